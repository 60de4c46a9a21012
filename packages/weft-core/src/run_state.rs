//! Endpoint lifecycle state gating dispatch acceptance.
//!
//! Uses `ArcSwap` for lock-free state transitions and a deadline/poll loop
//! for bounded state waits.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;

/// Default interval between polls in [`RunStateHandle::wait_for_state`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle state of a receiving endpoint.
///
/// Happy path: `Stopped -> Starting -> Started -> Stopping -> Stopped`.
/// A failure while starting or started goes `ExceptionStopping -> Error`.
/// Dispatch is only accepted in `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunState {
    Stopped,
    Starting,
    Started,
    Stopping,
    ExceptionStopping,
    Error,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Started => "Started",
            Self::Stopping => "Stopping",
            Self::ExceptionStopping => "Exception Stopping",
            Self::Error => "Error",
        };
        f.write_str(text)
    }
}

/// Timeout from a bounded state wait, distinct from a normal observation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("run state still [{current}] after {}ms", waited.as_millis())]
pub struct StateWaitTimeout {
    /// The state observed when the wait gave up.
    pub current: RunState,
    /// How long the caller waited.
    pub waited: Duration,
}

/// Lock-free shared cell holding an endpoint's [`RunState`].
///
/// Cloning the handle shares the underlying cell, so a receiver and the
/// dispatch layer observe the same state.
#[derive(Debug, Clone)]
pub struct RunStateHandle {
    state: Arc<ArcSwap<RunState>>,
    poll_interval: Duration,
}

impl RunStateHandle {
    /// Creates a handle in the `Stopped` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(ArcSwap::from_pointee(RunState::Stopped)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the poll interval used by [`wait_for_state`](Self::wait_for_state).
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Returns the current state.
    #[must_use]
    pub fn get(&self) -> RunState {
        **self.state.load()
    }

    /// Transitions to the given state.
    pub fn set(&self, state: RunState) {
        let previous = self.state.swap(Arc::new(state));
        tracing::debug!(from = %previous, to = %state, "run state transition");
    }

    /// Whether dispatch is currently accepted.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.get() == RunState::Started
    }

    /// Waits until the state is one of `targets`, polling at the configured
    /// interval, for at most `timeout`.
    ///
    /// A target reached between two polls is still observed on the next
    /// poll. Returns the observed state on success.
    ///
    /// # Errors
    ///
    /// [`StateWaitTimeout`] if no target state was observed within `timeout`.
    pub async fn wait_for_state(
        &self,
        targets: &[RunState],
        timeout: Duration,
    ) -> Result<RunState, StateWaitTimeout> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.get();
            if targets.contains(&current) {
                return Ok(current);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StateWaitTimeout {
                    current,
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl Default for RunStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
