//! The contract a local receiver exposes to the dispatch core.

use async_trait::async_trait;

use crate::message::Message;
use crate::run_state::RunState;
use crate::session::SessionContext;

/// A locally-registered receiving endpoint.
///
/// Implemented by receivers wired up outside this crate. The dispatch layer
/// only ever checks availability and hands the call over; anything behind
/// `process` (pipelines, transports) is the receiver's business.
#[async_trait]
pub trait LocalListener: Send + Sync {
    /// Name of this listener, used in logs and error messages.
    fn name(&self) -> &str;

    /// Current lifecycle state. Dispatch is only accepted in
    /// [`RunState::Started`].
    fn run_state(&self) -> RunState;

    /// Handles one dispatched message and produces a reply.
    ///
    /// The listener owns `message` and performs the terminal read of its
    /// body. The session passes through unchanged apart from whatever the
    /// listener itself adds.
    ///
    /// # Errors
    ///
    /// Any processing failure; the dispatch layer routes it into the call's
    /// result and, on isolated calls, rolls the worker transaction back.
    async fn process(
        &self,
        correlation_id: &str,
        message: Message,
        session: &mut SessionContext,
    ) -> anyhow::Result<Message>;
}
