//! Reload controller: rebuilds the live server when the registry changes
//!
//! The controller exclusively owns the active [`LiveServer`]. Every cycle
//! snapshots the registry, drains the current server, builds a new routing
//! table, fetches TLS material and binds a fresh listener. Cycles run one at
//! a time; triggers that arrive meanwhile collapse into a single follow-up.
//!
//! Observers see an immutable [`ServerSnapshot`] through [`ReloadHandle`],
//! which can schedule reloads but never touches the listener itself.

use crate::access::AccessPolicy;
use crate::config::{Config, ReloadFailurePolicy};
use crate::error::{ConfigError, ReloadError};
use crate::pool::ConnectionPool;
use crate::registry::HostRegistry;
use crate::router::RoutingTable;
use crate::server::LiveServer;
use crate::tls::CertificateClient;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use rustls::ServerConfig;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Lifecycle of the active server handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadState {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// Read-only view of the server the controller last published
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    /// Incremented every time a listener is bound
    pub generation: u64,
    pub addr: SocketAddr,
    pub tls: bool,
    /// Certificate domains: routed hosts plus the management hostname
    pub domains: Vec<String>,
    /// Hosts with a working route
    pub hosts: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// Settings the controller needs from the process configuration
#[derive(Debug, Clone)]
pub struct ReloadSettings {
    pub listen: SocketAddr,
    pub management_host: String,
    pub drain_timeout: Duration,
    pub on_failure: ReloadFailurePolicy,
}

impl ReloadSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            listen: config.server.listen_addr()?,
            management_host: config.hostname.clone(),
            drain_timeout: config.server.drain_timeout(),
            on_failure: config.server.on_reload_failure,
        })
    }
}

/// Cheap, cloneable capability to request reloads and observe the result
#[derive(Clone)]
pub struct ReloadHandle {
    trigger: mpsc::Sender<()>,
    snapshot: Arc<ArcSwapOption<ServerSnapshot>>,
    state: watch::Receiver<ReloadState>,
}

impl ReloadHandle {
    /// Ask for a reload. Returns `false` when one is already pending, in
    /// which case this request is folded into it.
    pub fn schedule(&self) -> bool {
        match self.trigger.try_send(()) {
            Ok(()) => {
                debug!("Reload scheduled");
                true
            }
            Err(TrySendError::Full(())) => {
                debug!("Reload already pending, coalescing");
                false
            }
            Err(TrySendError::Closed(())) => {
                warn!("Reload controller is not running, trigger ignored");
                false
            }
        }
    }

    /// Snapshot of the currently published server, if any
    pub fn current(&self) -> Option<Arc<ServerSnapshot>> {
        self.snapshot.load_full()
    }

    pub fn state(&self) -> ReloadState {
        *self.state.borrow()
    }
}

pub struct ReloadController {
    registry: Arc<HostRegistry>,
    certificates: Arc<dyn CertificateClient>,
    access: Arc<dyn AccessPolicy>,
    pool: Arc<ConnectionPool>,
    settings: ReloadSettings,
    active: Option<LiveServer>,
    /// Routing table and TLS material of the last successful bind
    last_good: Option<(Arc<RoutingTable>, Option<Arc<ServerConfig>>)>,
    generation: u64,
    trigger_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<ReloadState>,
    handle: ReloadHandle,
    #[cfg(test)]
    transitions: Vec<ReloadState>,
}

impl ReloadController {
    pub fn new(
        registry: Arc<HostRegistry>,
        certificates: Arc<dyn CertificateClient>,
        access: Arc<dyn AccessPolicy>,
        pool: Arc<ConnectionPool>,
        settings: ReloadSettings,
    ) -> Self {
        // Capacity 1: at most one reload can be pending behind a running cycle
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ReloadState::Stopped);

        let handle = ReloadHandle {
            trigger: trigger_tx,
            snapshot: Arc::new(ArcSwapOption::empty()),
            state: state_rx,
        };

        Self {
            registry,
            certificates,
            access,
            pool,
            settings,
            active: None,
            last_good: None,
            generation: 0,
            trigger_rx,
            state_tx,
            handle,
            #[cfg(test)]
            transitions: Vec::new(),
        }
    }

    pub fn handle(&self) -> ReloadHandle {
        self.handle.clone()
    }

    /// Boot cycle. Any failure here is fatal regardless of policy.
    pub async fn start(&mut self) -> Result<(), ReloadError> {
        info!(listen = %self.settings.listen, "Starting gateway");
        if let Err(e) = self.cycle().await {
            self.set_state(ReloadState::Stopped);
            return Err(e);
        }
        Ok(())
    }

    /// Serve reload triggers until `shutdown_rx` fires, then drain.
    ///
    /// With the `abort` policy a failed reload ends the loop with the error;
    /// with `keep-previous` the last working configuration is restored.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), ReloadError> {
        loop {
            tokio::select! {
                trigger = self.trigger_rx.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                    info!("Reload triggered");
                    if let Err(e) = self.reload().await {
                        self.shutdown().await;
                        return Err(e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Reload controller shutting down");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One reload cycle with the failure policy applied
    pub async fn reload(&mut self) -> Result<(), ReloadError> {
        let err = match self.cycle().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        match self.settings.on_failure {
            ReloadFailurePolicy::Abort => {
                error!(error = %err, "Reload failed, aborting");
                Err(err)
            }
            ReloadFailurePolicy::KeepPrevious => {
                error!(error = %err, "Reload failed, keeping previous configuration");
                self.restore_previous(err).await
            }
        }
    }

    /// Drain the active server, if any, and stop
    pub async fn shutdown(&mut self) {
        if let Some(server) = self.active.take() {
            self.set_state(ReloadState::Draining);
            let aborted = server.drain(self.settings.drain_timeout).await;
            if aborted > 0 {
                warn!(aborted, "Connections aborted at shutdown");
            }
        }
        self.handle.snapshot.store(None);
        self.set_state(ReloadState::Stopped);
    }

    async fn cycle(&mut self) -> Result<(), ReloadError> {
        // Owned snapshot: the registry lock is released before any slow work
        let hosts = self.registry.list()?;

        if let Some(server) = self.active.take() {
            self.set_state(ReloadState::Draining);
            let aborted = server.drain(self.settings.drain_timeout).await;
            if aborted > 0 {
                warn!(aborted, "Connections aborted at drain deadline");
            }
            self.set_state(ReloadState::Stopped);
        }

        self.set_state(ReloadState::Starting);
        let table = Arc::new(RoutingTable::build(
            &hosts,
            &self.settings.management_host,
            &self.pool,
        )?);

        debug!(domains = ?table.domains(), "Requesting TLS material");
        let tls = self.certificates.server_config(table.domains()).await?;

        self.install(table, tls).await
    }

    async fn restore_previous(&mut self, err: ReloadError) -> Result<(), ReloadError> {
        if self.active.is_some() {
            // Failed before the running server was drained
            self.set_state(ReloadState::Running);
            return Ok(());
        }

        let Some((table, tls)) = self.last_good.clone() else {
            self.set_state(ReloadState::Stopped);
            return Err(err);
        };

        self.set_state(ReloadState::Starting);
        match self.install(table, tls).await {
            Ok(()) => {
                info!("Previous configuration restored");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to restore previous configuration");
                self.set_state(ReloadState::Stopped);
                Err(e)
            }
        }
    }

    async fn install(
        &mut self,
        table: Arc<RoutingTable>,
        tls: Option<Arc<ServerConfig>>,
    ) -> Result<(), ReloadError> {
        let server = LiveServer::bind(
            self.settings.listen,
            Arc::clone(&table),
            tls.clone(),
            Arc::clone(&self.access),
        )
        .await?;

        self.generation += 1;
        let snapshot = ServerSnapshot {
            generation: self.generation,
            addr: server.local_addr(),
            tls: server.tls().is_some(),
            domains: table.domains().to_vec(),
            hosts: table.hosts(),
            started_at: Utc::now(),
        };
        info!(
            generation = snapshot.generation,
            addr = %snapshot.addr,
            hosts = snapshot.hosts.len(),
            "Server running"
        );

        self.handle.snapshot.store(Some(Arc::new(snapshot)));
        self.last_good = Some((table, tls));
        self.active = Some(server);
        self.set_state(ReloadState::Running);
        Ok(())
    }

    fn set_state(&mut self, state: ReloadState) {
        debug!(state = ?state, "Reload state");
        self.state_tx.send_replace(state);
        #[cfg(test)]
        self.transitions.push(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AllowAll;
    use crate::error::CertificateError;
    use crate::registry::{Host, HostType};
    use crate::tls::Plaintext;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Notify, Semaphore};

    fn settings(on_failure: ReloadFailurePolicy) -> ReloadSettings {
        ReloadSettings {
            listen: "127.0.0.1:0".parse().unwrap(),
            management_host: "gate.example.com".to_string(),
            drain_timeout: Duration::from_secs(1),
            on_failure,
        }
    }

    fn controller(
        registry: &Arc<HostRegistry>,
        certificates: Arc<dyn CertificateClient>,
        on_failure: ReloadFailurePolicy,
    ) -> ReloadController {
        ReloadController::new(
            Arc::clone(registry),
            certificates,
            Arc::new(AllowAll),
            Arc::new(ConnectionPool::default()),
            settings(on_failure),
        )
    }

    async fn wait_for_generation(handle: &ReloadHandle, generation: u64) -> Arc<ServerSnapshot> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(snapshot) = handle.current() {
                    if snapshot.generation >= generation {
                        return snapshot;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("generation reached in time")
    }

    /// Blocks the Nth certificate request until released
    struct Gated {
        calls: AtomicUsize,
        block_on: usize,
        entered: Notify,
        release: Semaphore,
    }

    #[async_trait]
    impl CertificateClient for Gated {
        async fn server_config(
            &self,
            _domains: &[String],
        ) -> Result<Option<Arc<ServerConfig>>, CertificateError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.block_on {
                self.entered.notify_one();
                let _permit = self.release.acquire().await;
            }
            Ok(None)
        }
    }

    /// Fails every certificate request after the first
    struct FailAfterBoot {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CertificateClient for FailAfterBoot {
        async fn server_config(
            &self,
            _domains: &[String],
        ) -> Result<Option<Arc<ServerConfig>>, CertificateError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Err(CertificateError::Acme("rate limited".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn test_boot_publishes_snapshot() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry
            .add(&Host::http("app.example.com", "http://127.0.0.1:9000"))
            .unwrap();

        let mut controller = controller(&registry, Arc::new(Plaintext), ReloadFailurePolicy::Abort);
        let handle = controller.handle();
        assert_eq!(handle.state(), ReloadState::Stopped);
        assert!(handle.current().is_none());

        controller.start().await.unwrap();

        let snapshot = handle.current().unwrap();
        assert_eq!(snapshot.generation, 1);
        assert!(!snapshot.tls);
        assert_eq!(snapshot.hosts, vec!["app.example.com".to_string()]);
        assert_eq!(snapshot.domains.len(), 2);
        assert_eq!(handle.state(), ReloadState::Running);

        controller.shutdown().await;
        assert_eq!(handle.state(), ReloadState::Stopped);
        assert!(handle.current().is_none());
    }

    #[tokio::test]
    async fn test_boot_failure_is_fatal() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry
            .add(&Host {
                hostname: "db.example.com".to_string(),
                backend: "127.0.0.1:5432".to_string(),
                host_type: HostType::Unsupported("tcp".to_string()),
            })
            .unwrap();

        let mut controller =
            controller(&registry, Arc::new(Plaintext), ReloadFailurePolicy::KeepPrevious);
        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, ReloadError::Routing(_)));
        assert_eq!(controller.handle().state(), ReloadState::Stopped);
    }

    #[tokio::test]
    async fn test_triggers_during_reload_coalesce() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry
            .add(&Host::http("a.example.com", "http://127.0.0.1:9001"))
            .unwrap();

        let gated = Arc::new(Gated {
            calls: AtomicUsize::new(0),
            block_on: 2,
            entered: Notify::new(),
            release: Semaphore::new(0),
        });

        let mut controller = controller(&registry, gated.clone(), ReloadFailurePolicy::Abort);
        let handle = controller.handle();
        controller.start().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(shutdown_rx));

        assert!(handle.schedule());
        gated.entered.notified().await;

        // Both arrive while the second generation is still starting
        registry
            .add(&Host::http("b.example.com", "http://127.0.0.1:9002"))
            .unwrap();
        assert!(handle.schedule());
        registry
            .add(&Host::http("c.example.com", "http://127.0.0.1:9003"))
            .unwrap();
        assert!(!handle.schedule());

        gated.release.add_permits(1);

        let snapshot = wait_for_generation(&handle, 3).await;
        assert_eq!(
            snapshot.hosts,
            vec![
                "a.example.com".to_string(),
                "b.example.com".to_string(),
                "c.example.com".to_string()
            ]
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.current().unwrap().generation, 3);
        assert_eq!(gated.calls.load(Ordering::SeqCst), 3);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(handle.state(), ReloadState::Stopped);
    }

    #[tokio::test]
    async fn test_abort_policy_ends_run_loop() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        let failing = Arc::new(FailAfterBoot {
            calls: AtomicUsize::new(0),
        });

        let mut controller = controller(&registry, failing, ReloadFailurePolicy::Abort);
        let handle = controller.handle();
        controller.start().await.unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(shutdown_rx));
        assert!(handle.schedule());

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ReloadError::Certificate(_))));
        assert_eq!(handle.state(), ReloadState::Stopped);
    }

    #[tokio::test]
    async fn test_keep_previous_restores_last_table() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        registry
            .add(&Host::http("a.example.com", "http://127.0.0.1:9001"))
            .unwrap();
        let failing = Arc::new(FailAfterBoot {
            calls: AtomicUsize::new(0),
        });

        let mut controller = controller(&registry, failing, ReloadFailurePolicy::KeepPrevious);
        let handle = controller.handle();
        controller.start().await.unwrap();

        registry
            .add(&Host::http("b.example.com", "http://127.0.0.1:9002"))
            .unwrap();
        controller.reload().await.unwrap();

        let snapshot = handle.current().unwrap();
        assert_eq!(snapshot.generation, 2);
        assert_eq!(snapshot.hosts, vec!["a.example.com".to_string()]);
        assert_eq!(handle.state(), ReloadState::Running);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_passes_through_stopped() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        let mut controller = controller(&registry, Arc::new(Plaintext), ReloadFailurePolicy::Abort);

        controller.start().await.unwrap();
        controller.reload().await.unwrap();
        controller.shutdown().await;

        use ReloadState::*;
        assert_eq!(
            controller.transitions,
            vec![Starting, Running, Draining, Stopped, Starting, Running, Draining, Stopped]
        );
    }

    #[tokio::test]
    async fn test_schedule_without_controller() {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        let controller = controller(&registry, Arc::new(Plaintext), ReloadFailurePolicy::Abort);
        let handle = controller.handle();
        drop(controller);
        assert!(!handle.schedule());
    }
}
