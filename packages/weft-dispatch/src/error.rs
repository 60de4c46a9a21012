//! Dispatch error taxonomy.

use std::time::Duration;

use weft_core::message::MessageError;
use weft_core::run_state::RunState;

use crate::txn::TxError;

/// Errors surfaced by the dispatch layer.
///
/// Callee failures ride inside the call's result; errors in target
/// resolution or state validation are returned immediately to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Unresolved target name or invalid wiring. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The target exists but is not accepting dispatch. The caller decides
    /// whether to retry.
    #[error("service [{service}] is not available to receive messages (run state: {state})")]
    Unavailable { service: String, state: RunState },

    /// Reading an already-consumed or broken message stream. Fatal per call.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The callee failed while processing the message.
    #[error("listener failed to process message: {0}")]
    Listener(#[source] anyhow::Error),

    /// A failure from the underlying transaction provider, passed through
    /// unmodified. Never retried: retrying a transaction decision is unsafe
    /// without external idempotency guarantees.
    #[error(transparent)]
    Transaction(#[from] TxError),

    /// A bounded wait expired. Stops only the wait, never the worker.
    #[error("timed out after {}ms waiting for call completion", waited.as_millis())]
    Timeout { waited: Duration },
}
