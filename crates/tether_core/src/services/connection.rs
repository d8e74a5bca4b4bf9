//! Managed single connection with optional SSH tunnel.
//!
//! The manager owns at most one live connection at a time, published as a
//! [`ConnectionHandle`] snapshot:
//! - `connect()` opens a new client (through the tunnel when configured),
//!   validates it with a ping and swaps it into the slot
//! - the previous handle is retired, so work still holding it can tell that
//!   it was superseded
//! - the background monitor (see [`crate::services::monitor`]) reuses the
//!   same connect path
//! - `disconnect()` closes the handle, after which every clone of it refuses
//!   further use

use crate::error::{Operation, TetherError, TetherResult};
use crate::models::{ConnectionConfig, ConnectionState, MonitorConfig};
use crate::services::monitor::{self, MonitorState, MonitorTask};
use crate::services::tunnel::{SshTunnel, Tunnel};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{MappedMutexGuard, MutexGuard};
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;

/// Shared state behind a handle.
struct HandleInner {
    generation: u64,
    /// `None` once the handle has been closed
    client: tokio::sync::Mutex<Option<Client>>,
    retired: AtomicBool,
    opened_at: DateTime<Utc>,
    statement_timeout: Duration,
    /// Set while a [`ClientGuard`] is held
    busy_since: Mutex<Option<Instant>>,
}

/// Snapshot of the manager's live connection.
///
/// Cheap to clone. The client is reachable only through [`lock`](Self::lock),
/// so a bulk load holding it keeps exclusive use for its whole transaction.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    fn new(generation: u64, client: Client, statement_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                generation,
                client: tokio::sync::Mutex::new(Some(client)),
                retired: AtomicBool::new(false),
                opened_at: Utc::now(),
                statement_timeout,
                busy_since: Mutex::new(None),
            }),
        }
    }

    /// Sequence number of the connect that produced this handle.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// When the underlying connection was opened.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.inner.opened_at
    }

    /// Deadline for a whole bulk load or verification query on this handle.
    pub fn statement_timeout(&self) -> Duration {
        self.inner.statement_timeout
    }

    /// Check whether a newer connection replaced this one.
    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.inner.retired.store(true, Ordering::Release);
    }

    /// Acquire exclusive use of the client.
    ///
    /// Fails once the handle was closed by [`ConnectionManager::disconnect`].
    pub async fn lock(&self) -> TetherResult<ClientGuard<'_>> {
        let guard = self.inner.client.lock().await;
        self.claim(guard)
    }

    fn claim<'a>(&'a self, guard: MutexGuard<'a, Option<Client>>) -> TetherResult<ClientGuard<'a>> {
        let client = MutexGuard::try_map(guard, |client| client.as_mut()).map_err(|_| {
            TetherError::connection(
                Operation::Open,
                format!("Connection {} was closed", self.generation()),
            )
        })?;
        *self.inner.busy_since.lock() = Some(Instant::now());
        Ok(ClientGuard { client, busy_since: &self.inner.busy_since })
    }

    /// Start the statement deadline for one load or query.
    pub(crate) fn deadline(&self) -> Deadline {
        Deadline::after(self.inner.statement_timeout)
    }

    /// Round-trip `SELECT 1`, waiting for the client if it is busy.
    ///
    /// The deadline covers the query, not the wait for the lock.
    pub async fn ping(&self, deadline: Duration) -> TetherResult<()> {
        let client = self.lock().await?;
        ping_client(&client, deadline).await
    }

    /// Ping only if nobody else holds the client.
    ///
    /// Returns `Ok(false)` when the client is busy and no ping was sent. A
    /// client held for longer than the statement deadline counts as hung.
    pub(crate) async fn ping_if_idle(&self, deadline: Duration) -> TetherResult<bool> {
        let Ok(guard) = self.inner.client.try_lock() else {
            let limit = self.inner.statement_timeout;
            return match self.busy_for() {
                Some(busy) if busy > limit => Err(TetherError::timeout(Operation::Ping, limit)),
                _ => Ok(false),
            };
        };
        let client = self.claim(guard)?;
        ping_client(&client, deadline).await?;
        Ok(true)
    }

    fn busy_for(&self) -> Option<Duration> {
        let since = *self.inner.busy_since.lock();
        since.map(|since| since.elapsed())
    }

    /// Retire the handle and drop its client once current work releases it.
    ///
    /// Returns false if the client was still held after `wait`; it is then
    /// dropped along with the last clone of the handle.
    pub(crate) async fn close(&self, wait: Duration) -> bool {
        self.retire();
        match tokio::time::timeout(wait, self.inner.client.lock()).await {
            Ok(mut client) => {
                client.take();
                true
            }
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation())
            .field("retired", &self.is_retired())
            .field("opened_at", &self.opened_at())
            .finish()
    }
}

/// Exclusive use of a handle's [`Client`].
pub struct ClientGuard<'a> {
    client: MappedMutexGuard<'a, Client>,
    busy_since: &'a Mutex<Option<Instant>>,
}

impl Deref for ClientGuard<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl DerefMut for ClientGuard<'_> {
    fn deref_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl Drop for ClientGuard<'_> {
    fn drop(&mut self) {
        *self.busy_since.lock() = None;
    }
}

/// One deadline shared by every step of a load or query.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: tokio::time::Instant,
    limit: Duration,
}

impl Deadline {
    pub(crate) fn after(limit: Duration) -> Self {
        Self { at: tokio::time::Instant::now() + limit, limit }
    }

    /// Await `fut`, or fail with a timeout attributed to `operation`.
    pub(crate) async fn bound<F: Future>(
        &self,
        operation: Operation,
        fut: F,
    ) -> TetherResult<F::Output> {
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| TetherError::timeout(operation, self.limit))
    }
}

async fn ping_client(client: &Client, deadline: Duration) -> TetherResult<()> {
    if client.is_closed() {
        return Err(TetherError::connection(Operation::Ping, "Connection closed"));
    }
    match tokio::time::timeout(deadline, client.simple_query("SELECT 1")).await {
        Err(_) => Err(TetherError::timeout(Operation::Ping, deadline)),
        Ok(Err(e)) => Err(TetherError::connection_with_source(
            Operation::Ping,
            format!("Ping failed: {e}"),
            e,
        )),
        Ok(Ok(_)) => Ok(()),
    }
}

/// Owner of one database connection, its tunnel and its monitor.
pub struct ConnectionManager {
    config: ConnectionConfig,
    tunnel: tokio::sync::Mutex<Option<Box<dyn Tunnel>>>,
    slot: RwLock<Option<ConnectionHandle>>,
    state: RwLock<ConnectionState>,
    /// Serializes connects, reconnects and disconnects.
    connect_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    monitor: Mutex<Option<MonitorTask>>,
    monitor_state: RwLock<MonitorState>,
    reconnect_attempts: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager, building an SSH tunnel when one is configured.
    ///
    /// No connection is opened until [`connect`](Self::connect).
    pub fn new(config: ConnectionConfig) -> TetherResult<Self> {
        let tunnel = config
            .tunnel
            .clone()
            .map(|t| Box::new(SshTunnel::new(t)) as Box<dyn Tunnel>);
        Self::build(config, tunnel)
    }

    /// Create a manager that reaches the database through the given tunnel.
    pub fn with_tunnel(config: ConnectionConfig, tunnel: Box<dyn Tunnel>) -> TetherResult<Self> {
        Self::build(config, Some(tunnel))
    }

    fn build(config: ConnectionConfig, tunnel: Option<Box<dyn Tunnel>>) -> TetherResult<Self> {
        config.validate()?;
        if config.uses_tunnel_port() && tunnel.is_none() {
            return Err(TetherError::config(
                "Connection URL expects a tunnel port but no tunnel is configured",
            ));
        }

        tracing::debug!(
            driver = %config.driver,
            url = %config.display_url(),
            tunnel = tunnel.is_some(),
            "Connection manager created"
        );

        Ok(Self {
            config,
            tunnel: tokio::sync::Mutex::new(tunnel),
            slot: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            connect_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            monitor: Mutex::new(None),
            monitor_state: RwLock::new(MonitorState::Idle),
            reconnect_attempts: AtomicU64::new(0),
        })
    }

    /// Get the connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Current monitor state.
    pub fn monitor_state(&self) -> MonitorState {
        *self.monitor_state.read()
    }

    /// Number of reconnects the monitor has attempted.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Snapshot of the live connection.
    pub fn handle(&self) -> TetherResult<ConnectionHandle> {
        self.slot
            .read()
            .clone()
            .ok_or_else(|| TetherError::connection(Operation::Open, "Not connected"))
    }

    /// Open a new connection and make it current.
    ///
    /// On failure the previous handle, if any, stays installed.
    pub async fn connect(&self) -> TetherResult<ConnectionHandle> {
        let _guard = self.connect_lock.lock().await;
        *self.state.write() = ConnectionState::Connecting;

        match self.open().await {
            Ok(handle) => {
                self.install(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                let restored = if self.slot.read().is_some() {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                };
                *self.state.write() = restored;
                tracing::warn!(
                    url = %self.config.display_url(),
                    error = %e,
                    "Failed to connect to database"
                );
                Err(e)
            }
        }
    }

    /// Ping the live connection.
    pub async fn ping(&self) -> TetherResult<()> {
        self.handle()?.ping(self.config.options.ping_timeout()).await
    }

    /// Stop the monitor, close the connection and close the tunnel.
    ///
    /// Work in progress on the current handle may finish within the statement
    /// deadline; after that, every clone of the handle refuses further use.
    pub async fn disconnect(&self) {
        self.stop_monitoring().await;

        let _guard = self.connect_lock.lock().await;
        let previous = self.slot.write().take();
        *self.state.write() = ConnectionState::Disconnected;

        if let Some(handle) = previous {
            let generation = handle.generation();
            if handle.close(self.config.options.statement_timeout()).await {
                tracing::info!(generation, "Disconnected from database");
            } else {
                tracing::warn!(generation, "Connection still busy; it closes when released");
            }
        }

        if let Some(tunnel) = self.tunnel.lock().await.as_mut() {
            tunnel.close();
        }
    }

    /// Start the background monitor with the configured settings.
    pub fn start_monitoring(self: &Arc<Self>) -> TetherResult<()> {
        self.start_monitoring_with(self.config.monitor)
    }

    /// Start the background monitor with explicit settings.
    ///
    /// Fails if a monitor is already running for this manager.
    pub fn start_monitoring_with(self: &Arc<Self>, config: MonitorConfig) -> TetherResult<()> {
        config.validate()?;
        let mut slot = self.monitor.lock();
        if slot.as_ref().is_some_and(MonitorTask::is_running) {
            return Err(TetherError::monitor("Monitoring is already running"));
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor::run(Arc::downgrade(self), config, cancel.clone()));
        *slot = Some(MonitorTask::new(cancel, task));

        tracing::info!(
            interval_ms = config.interval_ms,
            policy = ?config.policy,
            "Connection monitoring started"
        );
        Ok(())
    }

    /// Stop the monitor and wait for its current tick to finish.
    ///
    /// An in-flight ping or reconnect is allowed to complete.
    pub async fn stop_monitoring(&self) {
        let task = self.monitor.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
            self.set_monitor_state(MonitorState::Idle);
            tracing::info!("Connection monitoring stopped");
        }
    }

    /// Check whether the monitor is running.
    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().as_ref().is_some_and(MonitorTask::is_running)
    }

    pub(crate) fn set_monitor_state(&self, state: MonitorState) {
        *self.monitor_state.write() = state;
    }

    pub(crate) fn record_reconnect_attempt(&self) -> u64 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Ping for the monitor.
    ///
    /// A busy client counts as alive until it has been held past the
    /// statement deadline.
    pub(crate) async fn check_health(&self) -> TetherResult<()> {
        let handle = self.handle()?;
        if !handle.ping_if_idle(self.config.options.ping_timeout()).await? {
            tracing::trace!(generation = handle.generation(), "Connection busy; skipping ping");
        }
        Ok(())
    }

    async fn open(&self) -> TetherResult<ConnectionHandle> {
        let connect_timeout = self.config.options.connect_timeout();
        let tunnel_port = self.ensure_tunnel(connect_timeout).await?;
        let url = self.config.resolve_url(tunnel_port)?;

        let mut pg_config: tokio_postgres::Config = url.parse().map_err(|e| {
            TetherError::config(format!(
                "Invalid connection URL '{}': {e}",
                self.config.display_url()
            ))
        })?;
        if pg_config.get_application_name().is_none() {
            pg_config.application_name(&self.config.options.application_name);
        }
        pg_config.connect_timeout(connect_timeout);

        let (client, connection) = tokio::time::timeout(connect_timeout, pg_config.connect(NoTls))
            .await
            .map_err(|_| TetherError::timeout(Operation::Open, connect_timeout))?
            .map_err(|e| {
                TetherError::connection_with_source(
                    Operation::Open,
                    format!("Failed to connect to {}: {e}", self.config.display_url()),
                    e,
                )
            })?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        // The connection object performs the actual communication with the database
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(generation, error = %e, "Database connection closed with error");
            }
        });

        let handle =
            ConnectionHandle::new(generation, client, self.config.options.statement_timeout());
        handle.ping(self.config.options.ping_timeout()).await?;
        Ok(handle)
    }

    async fn ensure_tunnel(&self, deadline: Duration) -> TetherResult<Option<u16>> {
        let mut tunnel = self.tunnel.lock().await;
        let Some(tunnel) = tunnel.as_mut() else {
            return Ok(None);
        };
        if tunnel.is_running() {
            return Ok(tunnel.local_port());
        }
        if tunnel.local_port().is_some() {
            tracing::warn!("SSH tunnel stopped; restarting");
            tunnel.close();
        }
        let port = tokio::time::timeout(deadline, tunnel.start())
            .await
            .map_err(|_| TetherError::timeout(Operation::Open, deadline))??;
        Ok(Some(port))
    }

    fn install(&self, handle: ConnectionHandle) {
        let generation = handle.generation();
        let previous = self.slot.write().replace(handle);
        *self.state.write() = ConnectionState::Connected;

        match previous {
            Some(previous) => {
                previous.retire();
                tracing::info!(
                    generation,
                    replaced = previous.generation(),
                    "Reconnected to database"
                );
            }
            None => {
                tracing::info!(
                    generation,
                    url = %self.config.display_url(),
                    "Connected to database"
                );
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.display_url())
            .field("state", &self.state())
            .field("monitor_state", &self.monitor_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TunnelConfig;
    use crate::services::stalling_server::StallingServer;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn unreachable_config() -> ConnectionConfig {
        let mut config =
            ConnectionConfig::postgres("host=127.0.0.1 port=1 user=tether dbname=tether");
        config.options.connect_timeout_secs = 2;
        config
    }

    /// Tunnel that binds nothing and reports a fixed port.
    struct FakeTunnel {
        port: u16,
        running: bool,
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tunnel for FakeTunnel {
        async fn start(&mut self) -> TetherResult<u16> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.running = true;
            Ok(self.port)
        }

        fn local_port(&self) -> Option<u16> {
            self.running.then_some(self.port)
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn close(&mut self) {
            self.running = false;
        }
    }

    #[test]
    fn test_new_validates_config() {
        assert!(ConnectionManager::new(ConnectionConfig::postgres("")).is_err());

        let placeholder = ConnectionConfig::postgres("host=127.0.0.1 port={tunnel_port}");
        let err = ConnectionManager::new(placeholder).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_new_manager_is_disconnected() {
        let manager = ConnectionManager::new(unreachable_config()).unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.monitor_state(), MonitorState::Idle);
        assert!(!manager.is_monitoring());
        assert!(manager.handle().is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_returns_error() {
        let manager = ConnectionManager::new(unreachable_config()).unwrap();
        let err = manager.connect().await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err.operation(), Some(Operation::Open));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_starts_tunnel_and_substitutes_port() {
        let starts = Arc::new(AtomicUsize::new(0));
        let tunnel = FakeTunnel { port: 1, running: false, starts: starts.clone() };
        let mut config = ConnectionConfig::postgres("host=127.0.0.1 port={tunnel_port} user=t")
            .with_tunnel(TunnelConfig::new("deploy", "pw", "bastion", "db:5432", 0));
        config.options.connect_timeout_secs = 2;

        let manager = ConnectionManager::with_tunnel(config, Box::new(tunnel)).unwrap();
        // Port 1 refuses, but only after the tunnel was started and the URL resolved
        let err = manager.connect().await.unwrap_err();
        assert!(!err.is_config());
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        // A running tunnel is reused
        let _ = manager.connect().await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let manager = ConnectionManager::new(unreachable_config()).unwrap();
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_second_monitor_is_rejected() {
        let manager = Arc::new(ConnectionManager::new(unreachable_config()).unwrap());
        let interval = MonitorConfig::fixed(Duration::from_secs(60));

        manager.start_monitoring_with(interval).unwrap();
        let err = manager.start_monitoring_with(interval).unwrap_err();
        assert_eq!(err.category(), "Monitor");

        manager.stop_monitoring().await;
        assert!(!manager.is_monitoring());
        manager.start_monitoring_with(interval).unwrap();
        manager.disconnect().await;
        assert!(!manager.is_monitoring());
        assert_eq!(manager.monitor_state(), MonitorState::Idle);
    }

    fn stalling_config(server: &StallingServer) -> ConnectionConfig {
        let mut config = server.config();
        config.options.statement_timeout_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_client_held_past_deadline_is_unhealthy() {
        let server = StallingServer::start(1).await;
        let manager = ConnectionManager::new(stalling_config(&server)).unwrap();
        let handle = manager.connect().await.unwrap();

        let client = handle.lock().await.unwrap();
        // Busy but within the deadline
        manager.check_health().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let err = manager.check_health().await.unwrap_err();
        assert!(matches!(err, TetherError::Timeout { .. }), "{err}");
        assert!(err.is_recoverable());

        drop(client);
        assert!(handle.busy_for().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_closes_cloned_handles() {
        let server = StallingServer::start(1).await;
        let manager = ConnectionManager::new(stalling_config(&server)).unwrap();
        let handle = manager.connect().await.unwrap();
        let clone = handle.clone();

        manager.disconnect().await;
        assert!(handle.is_retired());
        let err = clone.lock().await.err().unwrap();
        assert_eq!(err.operation(), Some(Operation::Open));
        assert!(clone.ping(Duration::from_secs(1)).await.is_err());
        assert!(manager.handle().is_err());
    }

    #[tokio::test]
    async fn test_deadline_reports_operation() {
        let deadline = Deadline::after(Duration::from_millis(20));
        let err = deadline
            .bound(Operation::Scan, std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err.operation(), Some(Operation::Scan));

        let fast = Deadline::after(Duration::from_secs(5));
        assert_eq!(fast.bound(Operation::Scan, async { 7 }).await.unwrap(), 7);
    }
}
