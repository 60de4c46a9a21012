//! The local sender: public entry point for in-process dispatch.
//!
//! Resolves its target either by direct listener reference or by a registry
//! lookup, gates on the target's run state, and executes the call inline
//! (synchronous) or on an isolated worker (asynchronous).

use std::sync::Arc;

use tracing::debug;

use weft_core::listener::LocalListener;
use weft_core::message::Message;
use weft_core::run_state::RunState;
use weft_core::session::SessionContext;

use crate::caller::{Completion, IsolatedCaller};
use crate::error::DispatchError;
use crate::registry::ServiceRegistry;
use crate::txn::{Propagation, TransactionDescriptor};

/// Result container handed back to the caller of [`LocalSender::send`].
///
/// Ownership of `result` transfers to the caller, who is responsible for
/// eventually dropping (closing) it. Callee failures ride in `failure`;
/// resolution and state-validation errors never reach this struct.
#[derive(Debug)]
pub struct SenderResult {
    /// The reply (synchronous) or the pipe-backed mirror of the input
    /// stream (asynchronous).
    pub result: Message,
    /// The callee's failure, when the call itself ran but failed.
    pub failure: Option<DispatchError>,
    /// Completion signal for asynchronous calls; `None` for synchronous.
    pub completion: Option<Completion>,
}

impl SenderResult {
    /// Whether the call produced a result without a callee failure.
    ///
    /// For asynchronous calls this says only that the call was submitted;
    /// the definitive outcome arrives through `completion`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// How the sender finds its target.
enum Target {
    /// Registry lookup by service name at each call.
    ServiceName {
        registry: Arc<ServiceRegistry>,
        name: String,
    },
    /// Direct reference, bound at construction.
    Listener(Arc<dyn LocalListener>),
}

/// Sends messages to a locally registered listener without a network hop.
pub struct LocalSender {
    target: Target,
    caller: Arc<IsolatedCaller>,
    synchronous: bool,
    check_dependency: bool,
    /// Descriptor for synchronous dispatch. Inline calls participate in the
    /// caller's existing transaction context and never begin one, so only
    /// `Supports` and `Required` propagation can be honored here.
    sync_descriptor: TransactionDescriptor,
}

impl LocalSender {
    /// Creates a sender that resolves its target from `registry` by name.
    pub fn by_service_name(
        registry: Arc<ServiceRegistry>,
        name: impl Into<String>,
        caller: Arc<IsolatedCaller>,
    ) -> Self {
        Self {
            target: Target::ServiceName {
                registry,
                name: name.into(),
            },
            caller,
            synchronous: false,
            check_dependency: true,
            sync_descriptor: TransactionDescriptor::new(Propagation::Supports),
        }
    }

    /// Creates a sender bound directly to `listener`.
    pub fn by_listener(listener: Arc<dyn LocalListener>, caller: Arc<IsolatedCaller>) -> Self {
        Self {
            target: Target::Listener(listener),
            caller,
            synchronous: false,
            check_dependency: true,
            sync_descriptor: TransactionDescriptor::new(Propagation::Supports),
        }
    }

    /// Selects inline (true) or isolated (false) execution. Default is
    /// isolated.
    #[must_use]
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Sets the transaction descriptor applied to synchronous dispatch.
    /// Default is `Supports` with the provider's timeout.
    ///
    /// Synchronous calls run inline in the caller's transaction context;
    /// the descriptor says how they relate to that context, and only
    /// `Supports` (participate when present) and `Required` (the caller
    /// must provide one) are honorable without beginning or suspending a
    /// transaction. Anything else is rejected at configure time.
    #[must_use]
    pub fn transaction(mut self, descriptor: TransactionDescriptor) -> Self {
        self.sync_descriptor = descriptor;
        self
    }

    /// Controls whether [`configure`](Self::configure) requires the named
    /// service to already be registered. Disable for services registered
    /// later in startup than this sender is configured.
    #[must_use]
    pub fn check_dependency(mut self, check: bool) -> Self {
        self.check_dependency = check;
        self
    }

    /// Validates the sender's wiring, surfacing unresolved names at the
    /// earliest detectable point instead of at call time.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Configuration`] when the configured service name is
    /// not registered (and dependency checking is on), or when the
    /// synchronous transaction descriptor cannot be honored inline.
    pub fn configure(&self) -> Result<(), DispatchError> {
        self.validate_sync_descriptor()?;
        if let Target::ServiceName { registry, name } = &self.target {
            if self.check_dependency && registry.lookup(name).is_none() {
                return Err(DispatchError::Configuration(format!(
                    "cannot find service [{name}] in the registry"
                )));
            }
        }
        Ok(())
    }

    fn validate_sync_descriptor(&self) -> Result<(), DispatchError> {
        if !self.synchronous {
            return Ok(());
        }
        match self.sync_descriptor.propagation() {
            Propagation::Supports | Propagation::Required => Ok(()),
            other => Err(DispatchError::Configuration(format!(
                "synchronous dispatch runs inline in the caller's transaction context \
                 and cannot honor propagation [{other:?}]"
            ))),
        }
    }

    fn resolve_target(&self) -> Result<Arc<dyn LocalListener>, DispatchError> {
        match &self.target {
            Target::Listener(listener) => Ok(listener.clone()),
            Target::ServiceName { registry, name } => registry.lookup(name).ok_or_else(|| {
                DispatchError::Configuration(format!("cannot find service [{name}] in the registry"))
            }),
        }
    }

    /// Dispatches `message` to the resolved target.
    ///
    /// Synchronous: runs on this task, in the caller's transactional
    /// context; the callee's reply (or failure) lands in the result.
    /// Asynchronous: submits to an isolated worker with its own transaction
    /// and returns immediately; the result message mirrors the input stream
    /// and may be drained while the worker is still producing, and the
    /// definitive outcome arrives through the completion signal.
    ///
    /// # Errors
    ///
    /// Resolution failures ([`DispatchError::Configuration`]) and targets
    /// not in `Started` ([`DispatchError::Unavailable`]) are returned
    /// immediately, before any transaction work.
    pub async fn send(
        &self,
        message: Message,
        session: &mut SessionContext,
    ) -> Result<SenderResult, DispatchError> {
        let target = self.resolve_target()?;

        let state = target.run_state();
        if state != RunState::Started {
            return Err(DispatchError::Unavailable {
                service: target.name().to_string(),
                state,
            });
        }

        let cid = session.correlation_id();
        if self.synchronous {
            self.validate_sync_descriptor()?;
            debug!(
                cid = %cid,
                service = %target.name(),
                propagation = ?self.sync_descriptor.propagation(),
                "dispatching synchronously"
            );
            match self.caller.call_sync(target, &cid, message, session).await {
                Ok(reply) => Ok(SenderResult {
                    result: reply,
                    failure: None,
                    completion: None,
                }),
                Err(failure) => Ok(SenderResult {
                    result: Message::nil(),
                    failure: Some(failure),
                    completion: None,
                }),
            }
        } else {
            debug!(cid = %cid, service = %target.name(), "dispatching to an isolated worker");
            let call = self
                .caller
                .call_isolated(target, &cid, message, session)
                .await?;
            Ok(SenderResult {
                result: call.result,
                failure: None,
                completion: Some(call.completion),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
