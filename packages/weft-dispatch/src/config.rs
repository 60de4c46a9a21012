//! Dispatch-layer configuration.

/// Configuration for the isolated-call machinery.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Capacity in bytes of the in-memory pipe between an isolated worker
    /// and the caller. A full pipe blocks the producing worker (backpressure)
    /// rather than failing it.
    pub pipe_capacity: usize,
    /// Maximum number of concurrently running isolated workers. Calls beyond
    /// the bound wait for a worker slot.
    pub max_isolated_calls: usize,
    /// Name under which the transaction-manager delegate is resolved from
    /// the container.
    pub tx_manager_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: 8 * 1024,
            max_isolated_calls: 64,
            tx_manager_name: "txManager".to_string(),
        }
    }
}
