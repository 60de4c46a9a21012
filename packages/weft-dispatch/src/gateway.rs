//! Outbound gateway selection: a closed factory table keyed by kind.
//!
//! Gateways are registered as constructor functions against a discriminant
//! tag and created by configuration value, not open-ended reflection. The
//! shipped variant is the local gateway, which dispatches through the
//! in-process registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use weft_core::message::Message;
use weft_core::session::SessionContext;

use crate::caller::IsolatedCaller;
use crate::error::DispatchError;
use crate::registry::ServiceRegistry;
use crate::sender::LocalSender;

/// Session key naming the service a gateway call targets.
pub const SERVICE_KEY: &str = "service";

// ---------------------------------------------------------------------------
// OutboundGateway contract
// ---------------------------------------------------------------------------

/// Narrow send/receive contract for pluggable outbound transports.
#[async_trait]
pub trait OutboundGateway: Send + Sync {
    /// Sends `message` and waits for the reply.
    async fn send_sync(
        &self,
        message: Message,
        session: &mut SessionContext,
    ) -> Result<Message, DispatchError>;

    /// Sends `message` without waiting for a reply.
    async fn send_async(
        &self,
        message: Message,
        session: &mut SessionContext,
    ) -> Result<(), DispatchError>;
}

impl std::fmt::Debug for dyn OutboundGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OutboundGateway")
    }
}

// ---------------------------------------------------------------------------
// GatewayFactory
// ---------------------------------------------------------------------------

type GatewayCtor = Box<dyn Fn() -> Arc<dyn OutboundGateway> + Send + Sync>;

/// Registration-time factory table mapping a gateway kind to a constructor.
///
/// An unknown kind is a configuration error at creation time, not at call
/// time.
pub struct GatewayFactory {
    ctors: RwLock<HashMap<&'static str, GatewayCtor>>,
}

impl GatewayFactory {
    /// Kind under which the local gateway registers.
    pub const LOCAL: &'static str = "local";

    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctors: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a factory with the local gateway registered under
    /// [`Self::LOCAL`].
    #[must_use]
    pub fn with_local(registry: Arc<ServiceRegistry>, caller: Arc<IsolatedCaller>) -> Self {
        let factory = Self::new();
        factory.register(Self::LOCAL, move || {
            Arc::new(LocalGateway::new(registry.clone(), caller.clone())) as Arc<dyn OutboundGateway>
        });
        factory
    }

    /// Registers a constructor for `kind`, replacing any previous one.
    pub fn register(
        &self,
        kind: &'static str,
        ctor: impl Fn() -> Arc<dyn OutboundGateway> + Send + Sync + 'static,
    ) {
        if self.ctors.write().insert(kind, Box::new(ctor)).is_some() {
            warn!(kind, "gateway kind was already registered; replacing");
        } else {
            debug!(kind, "gateway kind registered");
        }
    }

    /// Creates a gateway of the given kind.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Configuration`] for a kind no constructor was
    /// registered for.
    pub fn create(&self, kind: &str) -> Result<Arc<dyn OutboundGateway>, DispatchError> {
        let ctors = self.ctors.read();
        let ctor = ctors.get(kind).ok_or_else(|| {
            DispatchError::Configuration(format!("unknown outbound gateway kind [{kind}]"))
        })?;
        let gateway = ctor();
        info!(kind, "created outbound gateway");
        Ok(gateway)
    }
}

impl Default for GatewayFactory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// LocalGateway
// ---------------------------------------------------------------------------

/// Gateway dispatching through the in-process service registry.
///
/// The target service is read from the session's [`SERVICE_KEY`] entry.
pub struct LocalGateway {
    registry: Arc<ServiceRegistry>,
    caller: Arc<IsolatedCaller>,
}

impl LocalGateway {
    /// Creates a local gateway over the given registry and caller.
    pub fn new(registry: Arc<ServiceRegistry>, caller: Arc<IsolatedCaller>) -> Self {
        Self { registry, caller }
    }

    fn sender_for(&self, session: &SessionContext) -> Result<LocalSender, DispatchError> {
        let service = session.get_str(SERVICE_KEY).ok_or_else(|| {
            DispatchError::Configuration(format!(
                "gateway call carries no [{SERVICE_KEY}] session entry"
            ))
        })?;
        // Registration order is the wiring layer's business; resolution
        // happens per call.
        Ok(
            LocalSender::by_service_name(self.registry.clone(), service, self.caller.clone())
                .check_dependency(false),
        )
    }
}

#[async_trait]
impl OutboundGateway for LocalGateway {
    async fn send_sync(
        &self,
        message: Message,
        session: &mut SessionContext,
    ) -> Result<Message, DispatchError> {
        let sender = self.sender_for(session)?.synchronous(true);
        let result = sender.send(message, session).await?;
        match result.failure {
            None => Ok(result.result),
            Some(failure) => Err(failure),
        }
    }

    async fn send_async(
        &self,
        message: Message,
        session: &mut SessionContext,
    ) -> Result<(), DispatchError> {
        let sender = self.sender_for(session)?.synchronous(false);
        let result = sender.send(message, session).await?;

        // Nobody reads the mirrored stream on a fire-and-forget call; drain
        // it in the background so the worker is never backpressured into a
        // broken pipe.
        let mut mirror = result.result;
        tokio::spawn(async move {
            if let Ok(mut reader) = mirror.as_reader() {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut reader, &mut sink).await;
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use weft_core::listener::LocalListener;
    use weft_core::run_state::RunState;

    use crate::config::DispatchConfig;
    use crate::txn::{RecordingTxManager, TxManagerProxy, TxManagerRegistry};

    use super::*;

    struct EchoListener {
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl LocalListener for EchoListener {
        fn name(&self) -> &str {
            "echo"
        }

        fn run_state(&self) -> RunState {
            RunState::Started
        }

        async fn process(
            &self,
            _correlation_id: &str,
            mut message: Message,
            _session: &mut SessionContext,
        ) -> anyhow::Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = message.read_to_string().await?;
            Ok(Message::from_string(body))
        }
    }

    fn wired() -> (GatewayFactory, Arc<AtomicU64>, Arc<RecordingTxManager>) {
        let manager = Arc::new(RecordingTxManager::new());
        let container = Arc::new(TxManagerRegistry::new());
        container.register("txManager", manager.clone());
        let proxy = Arc::new(TxManagerProxy::new(container, "txManager"));
        let caller = Arc::new(IsolatedCaller::new(proxy, DispatchConfig::default()));

        let calls = Arc::new(AtomicU64::new(0));
        let registry = Arc::new(ServiceRegistry::new());
        registry.register("echo", Arc::new(EchoListener { calls: calls.clone() }));

        (
            GatewayFactory::with_local(registry, caller),
            calls,
            manager,
        )
    }

    #[test]
    fn unknown_kind_is_a_configuration_error() {
        let factory = GatewayFactory::new();
        let err = factory.create("jms").unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));
    }

    #[tokio::test]
    async fn local_gateway_round_trips_synchronously() {
        let (factory, calls, _) = wired();
        let gateway = factory.create(GatewayFactory::LOCAL).unwrap();

        let mut session = SessionContext::new();
        session.put(SERVICE_KEY, "echo");

        let mut reply = gateway
            .send_sync(Message::from_string("ping"), &mut session)
            .await
            .unwrap();
        assert_eq!(reply.read_to_string().await.unwrap(), "ping");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_gateway_send_async_commits_in_the_background() {
        let (factory, calls, manager) = wired();
        let gateway = factory.create(GatewayFactory::LOCAL).unwrap();

        let mut session = SessionContext::new();
        session.put(SERVICE_KEY, "echo");

        gateway
            .send_async(Message::from_string("fire-and-forget"), &mut session)
            .await
            .unwrap();

        for _ in 0..100 {
            if manager.commits.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gateway_call_without_service_entry_fails() {
        let (factory, _, _) = wired();
        let gateway = factory.create(GatewayFactory::LOCAL).unwrap();

        let mut session = SessionContext::new();
        let err = gateway
            .send_sync(Message::from_string("x"), &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));
    }
}
