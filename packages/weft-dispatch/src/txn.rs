//! Transaction-manager indirection: descriptor/handle types, the delegate
//! contract, and the lazily-resolving proxy.
//!
//! The proxy mirrors the container-resolved singleton pattern: the concrete
//! transaction manager is looked up by name on first use and cached without
//! locking. That relaxed cache is safe under exactly one precondition,
//! stated on [`TxManagerContainer::resolve`] and relied on throughout: the
//! container returns the same instance for a given name, always, so a racing
//! overwrite stores an equal value.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

// ---------------------------------------------------------------------------
// TxError
// ---------------------------------------------------------------------------

/// Failures from the transaction layer.
///
/// Delegate failures pass through the proxy unmodified: no retry, no
/// suppression.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// No transaction manager is registered under the configured name.
    #[error("no transaction manager [{name}] in the container")]
    UnknownManager { name: String },
    /// A failure raised by the underlying transaction provider.
    #[error("transaction delegate error: {0}")]
    Delegate(#[source] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Descriptor and handle
// ---------------------------------------------------------------------------

/// Transaction propagation behavior requested from the delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Required,
    RequiresNew,
    Supports,
    NotSupported,
    Mandatory,
    Never,
    Nested,
}

/// Immutable description of the transaction to begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionDescriptor {
    propagation: Propagation,
    timeout: Option<Duration>,
}

impl TransactionDescriptor {
    /// Creates a descriptor with the provider's default timeout.
    #[must_use]
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            timeout: None,
        }
    }

    /// Sets the transaction timeout. A zero duration means the provider
    /// default and is stored as no timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Requested propagation behavior.
    #[must_use]
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    /// Requested timeout, or `None` for the provider default.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Opaque handle for one transaction, returned by `begin`.
///
/// Commit and rollback take the handle by value, so exactly one terminal
/// call is enforced by ownership. The rollback-only flag is atomic so a
/// borrowed handle can be marked while the call is still in flight.
#[derive(Debug)]
pub struct TransactionHandle {
    id: u64,
    rollback_only: AtomicBool,
}

impl TransactionHandle {
    /// Creates a handle with a delegate-assigned id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            rollback_only: AtomicBool::new(false),
        }
    }

    /// Delegate-assigned transaction id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Marks this transaction so that only rollback is a legal terminal
    /// operation.
    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    /// Whether the transaction has been marked rollback-only.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Delegate contract
// ---------------------------------------------------------------------------

/// The contract an externally supplied transaction provider implements.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Begins a transaction per `descriptor` and returns its handle.
    async fn begin(&self, descriptor: &TransactionDescriptor) -> Result<TransactionHandle, TxError>;

    /// Commits the transaction, consuming the handle.
    async fn commit(&self, handle: TransactionHandle) -> Result<(), TxError>;

    /// Rolls the transaction back, consuming the handle.
    async fn rollback(&self, handle: TransactionHandle) -> Result<(), TxError>;
}

/// Resolves named transaction managers for the proxy.
pub trait TxManagerContainer: Send + Sync {
    /// Returns the manager registered under `name`.
    ///
    /// Hard invariant: for a given name this must return the *same* instance
    /// on every call for the life of the container. The proxy's unlocked
    /// delegate cache is only correct under this contract.
    fn resolve(&self, name: &str) -> Option<Arc<dyn TransactionManager>>;
}

/// Container implementation backed by a concurrent map.
///
/// Stores each manager once at registration, which makes the referential
/// stability the proxy relies on hold by construction.
pub struct TxManagerRegistry {
    managers: DashMap<String, Arc<dyn TransactionManager>>,
}

impl TxManagerRegistry {
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            managers: DashMap::new(),
        }
    }

    /// Registers `manager` under `name`.
    pub fn register(&self, name: impl Into<String>, manager: Arc<dyn TransactionManager>) {
        self.managers.insert(name.into(), manager);
    }
}

impl Default for TxManagerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TxManagerContainer for TxManagerRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn TransactionManager>> {
        self.managers.get(name).map(|entry| entry.value().clone())
    }
}

// ---------------------------------------------------------------------------
// TxManagerProxy
// ---------------------------------------------------------------------------

/// Sized cell for the cached delegate; `ArcSwap` needs a thin pointer.
struct CachedDelegate(Arc<dyn TransactionManager>);

/// Transparent proxy in front of a named transaction manager.
///
/// Resolves the delegate from the container on first use and caches it.
/// The cache is deliberately not synchronized: concurrent first uses may
/// each resolve, and the last store wins, but under the container contract
/// every resolution yields the identical instance, so the race is benign.
/// Adding a lock here would change the performance characteristics for no
/// correctness gain.
pub struct TxManagerProxy {
    container: Arc<dyn TxManagerContainer>,
    delegate_name: String,
    delegate: ArcSwapOption<CachedDelegate>,
}

impl TxManagerProxy {
    /// Creates a proxy resolving `delegate_name` from `container`.
    pub fn new(container: Arc<dyn TxManagerContainer>, delegate_name: impl Into<String>) -> Self {
        Self {
            container,
            delegate_name: delegate_name.into(),
            delegate: ArcSwapOption::const_empty(),
        }
    }

    /// Name under which the delegate is resolved.
    #[must_use]
    pub fn delegate_name(&self) -> &str {
        &self.delegate_name
    }

    fn delegate(&self) -> Result<Arc<dyn TransactionManager>, TxError> {
        if let Some(cached) = self.delegate.load_full() {
            return Ok(cached.0.clone());
        }
        let resolved =
            self.container
                .resolve(&self.delegate_name)
                .ok_or_else(|| TxError::UnknownManager {
                    name: self.delegate_name.clone(),
                })?;
        self.delegate
            .store(Some(Arc::new(CachedDelegate(resolved.clone()))));
        debug!(manager = %self.delegate_name, "resolved transaction manager delegate");
        Ok(resolved)
    }
}

#[async_trait]
impl TransactionManager for TxManagerProxy {
    async fn begin(&self, descriptor: &TransactionDescriptor) -> Result<TransactionHandle, TxError> {
        debug!(?descriptor, "beginning transaction");
        self.delegate()?.begin(descriptor).await
    }

    /// Commits, unless the handle is marked rollback-only, in which case the
    /// call silently redirects to rollback. A rollback-only transaction must
    /// never reach the delegate's commit.
    async fn commit(&self, handle: TransactionHandle) -> Result<(), TxError> {
        if handle.is_rollback_only() {
            debug!(tx = handle.id(), "transaction is rollback-only; rolling back instead of committing");
            return self.delegate()?.rollback(handle).await;
        }
        debug!(tx = handle.id(), "committing transaction");
        self.delegate()?.commit(handle).await
    }

    async fn rollback(&self, handle: TransactionHandle) -> Result<(), TxError> {
        debug!(tx = handle.id(), "rolling back transaction");
        self.delegate()?.rollback(handle).await
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// In-memory transaction manager counting lifecycle calls.
///
/// Ships outside `cfg(test)` so downstream crates can assert transaction
/// outcomes in their own tests.
#[derive(Debug, Default)]
pub struct RecordingTxManager {
    next_id: AtomicU64,
    pub begins: AtomicU64,
    pub commits: AtomicU64,
    pub rollbacks: AtomicU64,
}

impl RecordingTxManager {
    /// Creates a manager with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionManager for RecordingTxManager {
    async fn begin(&self, _descriptor: &TransactionDescriptor) -> Result<TransactionHandle, TxError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(TransactionHandle::new(
            self.next_id.fetch_add(1, Ordering::SeqCst),
        ))
    }

    async fn commit(&self, _handle: TransactionHandle) -> Result<(), TxError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _handle: TransactionHandle) -> Result<(), TxError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Container that counts resolutions while returning a stable singleton.
    struct CountingContainer {
        manager: Arc<RecordingTxManager>,
        resolutions: AtomicU64,
    }

    impl TxManagerContainer for CountingContainer {
        fn resolve(&self, name: &str) -> Option<Arc<dyn TransactionManager>> {
            if name != "txManager" {
                return None;
            }
            self.resolutions.fetch_add(1, Ordering::SeqCst);
            Some(self.manager.clone())
        }
    }

    fn proxy_over(manager: Arc<RecordingTxManager>) -> (TxManagerProxy, Arc<CountingContainer>) {
        let container = Arc::new(CountingContainer {
            manager,
            resolutions: AtomicU64::new(0),
        });
        let proxy = TxManagerProxy::new(container.clone(), "txManager");
        (proxy, container)
    }

    #[test]
    fn descriptor_zero_timeout_means_provider_default() {
        let descriptor =
            TransactionDescriptor::new(Propagation::RequiresNew).with_timeout(Duration::ZERO);
        assert_eq!(descriptor.timeout(), None);

        let descriptor = TransactionDescriptor::new(Propagation::Required)
            .with_timeout(Duration::from_secs(30));
        assert_eq!(descriptor.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(descriptor.propagation(), Propagation::Required);
    }

    #[tokio::test]
    async fn begin_commit_delegates() {
        let manager = Arc::new(RecordingTxManager::new());
        let (proxy, _) = proxy_over(manager.clone());

        let handle = proxy
            .begin(&TransactionDescriptor::new(Propagation::RequiresNew))
            .await
            .unwrap();
        proxy.commit(handle).await.unwrap();

        assert_eq!(manager.begins.load(Ordering::SeqCst), 1);
        assert_eq!(manager.commits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn committing_rollback_only_redirects_to_rollback() {
        let manager = Arc::new(RecordingTxManager::new());
        let (proxy, _) = proxy_over(manager.clone());

        let handle = proxy
            .begin(&TransactionDescriptor::new(Propagation::RequiresNew))
            .await
            .unwrap();
        handle.set_rollback_only();
        proxy.commit(handle).await.unwrap();

        // The delegate's commit must never be invoked.
        assert_eq!(manager.commits.load(Ordering::SeqCst), 0);
        assert_eq!(manager.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delegate_is_resolved_once_and_reused() {
        let manager = Arc::new(RecordingTxManager::new());
        let (proxy, container) = proxy_over(manager);

        for _ in 0..5 {
            let handle = proxy
                .begin(&TransactionDescriptor::new(Propagation::Required))
                .await
                .unwrap();
            proxy.commit(handle).await.unwrap();
        }

        assert_eq!(container.resolutions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_first_use_is_a_benign_race() {
        let manager = Arc::new(RecordingTxManager::new());
        let (proxy, container) = proxy_over(manager.clone());
        let proxy = Arc::new(proxy);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let proxy = proxy.clone();
            tasks.push(tokio::spawn(async move {
                let handle = proxy
                    .begin(&TransactionDescriptor::new(Propagation::RequiresNew))
                    .await
                    .unwrap();
                proxy.commit(handle).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Every resolution handed out the identical singleton, so however
        // the first-use race went, all 8 transactions hit the one delegate.
        assert_eq!(manager.begins.load(Ordering::SeqCst), 8);
        assert_eq!(manager.commits.load(Ordering::SeqCst), 8);
        assert!(container.resolutions.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn unknown_manager_name_is_an_error() {
        let container = Arc::new(TxManagerRegistry::new());
        let proxy = TxManagerProxy::new(container, "missing");

        let err = proxy
            .begin(&TransactionDescriptor::new(Propagation::Required))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::UnknownManager { name } if name == "missing"));
    }

    #[tokio::test]
    async fn registry_container_resolves_registered_managers() {
        let container = TxManagerRegistry::new();
        let manager = Arc::new(RecordingTxManager::new());
        container.register("txManager", manager);

        assert!(container.resolve("txManager").is_some());
        assert!(container.resolve("other").is_none());
    }
}
