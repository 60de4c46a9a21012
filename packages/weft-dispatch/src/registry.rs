//! Process-wide registry of local service listeners.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use weft_core::listener::LocalListener;

/// Maps service names to registered listeners.
///
/// Safe under concurrent register/unregister/lookup from components starting
/// and stopping at arbitrary times: a lookup observes either the old or the
/// new binding, never a torn one.
///
/// Re-registering a bound name is replace-last-wins; the replacement is
/// logged as a configuration conflict rather than rejected.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<dyn LocalListener>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Registers `listener` under `name`, replacing any previous binding.
    pub fn register(&self, name: impl Into<String>, listener: Arc<dyn LocalListener>) {
        let name = name.into();
        if self.services.insert(name.clone(), listener).is_some() {
            warn!(
                service = %name,
                "service name was already bound; replacing the previous registration (configuration conflict)"
            );
        } else {
            debug!(service = %name, "service registered");
        }
    }

    /// Removes the binding for `name`. Idempotent: absence is not an error.
    pub fn unregister(&self, name: &str) {
        if self.services.remove(name).is_some() {
            debug!(service = %name, "service unregistered");
        }
    }

    /// Returns the listener bound to `name`, if any.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn LocalListener>> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    /// Names currently bound, for diagnostics.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
