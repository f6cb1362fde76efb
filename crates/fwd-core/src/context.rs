//! Process-wide service graph, built once at startup and handed to the
//! controller adapter.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    admin::AdminOps,
    autoforward::AutoForwardScheduler,
    config::Config,
    control::ControlService,
    credentials::CredentialStore,
    delay::DelayPolicy,
    forwarder::ForwardRouter,
    lifecycle::SessionLifecycleManager,
    messaging::port::MessagingPort,
    protocol::ProtocolConnector,
    registry::ConnectionRegistry,
    store::ConfigStore,
};

pub struct AppContext {
    pub cfg: Arc<Config>,
    pub store: Arc<ConfigStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub delay: Arc<DelayPolicy>,
    pub router: Arc<ForwardRouter>,
    pub scheduler: AutoForwardScheduler,
    pub lifecycle: SessionLifecycleManager,
    pub control: ControlService,
    pub admin: AdminOps,
}

impl AppContext {
    pub fn new(
        cfg: Arc<Config>,
        connector: Arc<dyn ProtocolConnector>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        let store = Arc::new(ConfigStore::load(&cfg.data_file));
        let registry = Arc::new(ConnectionRegistry::new());
        let delay = Arc::new(DelayPolicy::new(store.clone(), &cfg));
        let router = Arc::new(ForwardRouter::new(store.clone(), delay.clone()));
        let scheduler =
            AutoForwardScheduler::new(store.clone(), delay.clone(), cfg.auto_forward_retry);
        let lifecycle = SessionLifecycleManager::new(
            store.clone(),
            registry.clone(),
            CredentialStore::new(&cfg.sessions_dir),
            connector,
            router.clone(),
            scheduler.clone(),
            cfg.login_timeout,
        );
        let control = ControlService::new(
            store.clone(),
            registry.clone(),
            scheduler.clone(),
            delay.clone(),
            lifecycle.clone(),
        );
        let admin = AdminOps::new(store.clone(), registry.clone(), lifecycle.clone(), messenger);

        Self {
            cfg,
            store,
            registry,
            delay,
            router,
            scheduler,
            lifecycle,
            control,
            admin,
        }
    }

    /// Log liveness (and the live-connection count) every heartbeat interval.
    pub fn spawn_heartbeat(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let every = self.cfg.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                let live = registry.live().await.len();
                info!(live_connections = live, "forwarder alive");
            }
        })
    }
}
