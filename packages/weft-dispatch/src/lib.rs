//! Weft dispatch — in-process message dispatch with transaction propagation.
//!
//! A sender invokes a locally registered listener without a network hop:
//!
//! 1. **Registry** (`registry`): service name -> listener bindings
//! 2. **Transactions** (`txn`): descriptor/handle types and the lazily
//!    resolving manager proxy
//! 3. **Execution** (`caller`): inline calls on the caller's task, or
//!    isolated calls on a worker with its own transaction and a streamed
//!    handoff of the message body
//! 4. **Entry point** (`sender`): target resolution, run-state gating,
//!    strategy selection
//! 5. **Gateways** (`gateway`): closed factory table for outbound
//!    transports, with the local gateway as the shipped variant

pub mod caller;
pub mod config;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod sender;
pub mod txn;

// Re-export key types for convenient access.
pub use caller::{Completion, DispatchOutcome, IsolatedCall, IsolatedCaller};
pub use config::DispatchConfig;
pub use error::DispatchError;
pub use gateway::{GatewayFactory, LocalGateway, OutboundGateway};
pub use registry::ServiceRegistry;
pub use sender::{LocalSender, SenderResult};
pub use txn::{
    Propagation, TransactionDescriptor, TransactionHandle, TransactionManager, TxError,
    TxManagerContainer, TxManagerProxy, TxManagerRegistry,
};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
