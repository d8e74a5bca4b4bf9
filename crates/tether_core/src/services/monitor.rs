//! Background connection monitor.
//!
//! One task per manager. Each tick pings the current handle and, when the
//! ping fails, attempts a single reconnect. Failures are logged and never
//! escalated. Cancellation is checked only while sleeping between ticks.

use crate::models::MonitorConfig;
use crate::services::connection::ConnectionManager;

use std::sync::Weak;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Observable state of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorState {
    /// No monitor running
    #[default]
    Idle,
    /// Monitor running, waiting for or performing a ping
    Polling,
    /// Ping failed, reconnect in progress
    Reconnecting,
}

/// A spawned monitor and its stop signal.
pub(crate) struct MonitorTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorTask {
    pub(crate) fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }

    /// Signal the task and wait for it to leave its loop.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Connection monitor task failed");
        }
    }
}

/// Monitor loop.
///
/// Holds only a weak reference so dropping the last manager ends the loop.
pub(crate) async fn run(
    manager: Weak<ConnectionManager>,
    config: MonitorConfig,
    cancel: CancellationToken,
) {
    let mut consecutive_failures = 0u32;

    loop {
        let Some(strong) = manager.upgrade() else {
            tracing::debug!("Connection manager dropped; monitor exiting");
            return;
        };

        if tick(&strong).await {
            consecutive_failures = 0;
        } else {
            consecutive_failures = consecutive_failures.saturating_add(1);
        }
        drop(strong);

        let delay = config.delay_after(consecutive_failures);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if let Some(strong) = manager.upgrade() {
        strong.set_monitor_state(MonitorState::Idle);
    }
}

/// One ping-then-maybe-reconnect cycle. Returns true when the connection
/// is healthy afterwards.
async fn tick(manager: &ConnectionManager) -> bool {
    manager.set_monitor_state(MonitorState::Polling);

    let error = match manager.check_health().await {
        Ok(()) => return true,
        Err(e) => e,
    };

    let attempt = manager.record_reconnect_attempt();
    tracing::warn!(attempt, error = %error, "Database connection lost; attempting to reconnect");
    manager.set_monitor_state(MonitorState::Reconnecting);

    let healthy = match manager.connect().await {
        Ok(handle) => {
            tracing::info!(
                attempt,
                generation = handle.generation(),
                "Database connection restored"
            );
            true
        }
        Err(e) => {
            tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
            false
        }
    };

    manager.set_monitor_state(MonitorState::Polling);
    healthy
}
