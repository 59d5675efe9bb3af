//! Proactive background refresh.
//!
//! A recurring timer, independent of request traffic, that renews the access
//! token shortly before it goes stale. Transient failures are logged and
//! retried on the next tick, with the interceptor's refresh-on-401 as the
//! backstop. When the server rejects the refresh token the timer stops and
//! hands the failure to the rejection hook so the session can be torn down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::error::RefreshError;
use super::expiry::is_expired_or_expiring_soon;
use super::refresh::RefreshCoordinator;
use super::store::TokenVault;

/// Default interval between checks (5 minutes)
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Called once when a background refresh is rejected by the server.
pub type RejectionHook = Arc<dyn Fn(RefreshError) -> BoxFuture<'static, ()> + Send + Sync>;

/// What a single scheduler tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No access token stored; the scheduler stops
    NoToken,
    Fresh,
    Refreshed,
    /// Refresh attempted and failed transiently; tried again next tick
    Failed,
    /// Refresh token rejected; the scheduler stops and reports it
    Rejected(RefreshError),
}

pub struct RefreshScheduler {
    vault: TokenVault,
    refresher: Arc<RefreshCoordinator>,
    period: Duration,
    buffer: ChronoDuration,
    on_rejected: Option<RejectionHook>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(
        vault: TokenVault,
        refresher: Arc<RefreshCoordinator>,
        period: Duration,
        buffer: ChronoDuration,
    ) -> Self {
        Self {
            vault,
            refresher,
            period,
            buffer,
            on_rejected: None,
            task: Mutex::new(None),
        }
    }

    /// Run `hook` when a background refresh is rejected. The hook runs on the
    /// timer task after the loop has ended, so it must not stop this scheduler.
    pub fn with_rejection_hook(mut self, hook: RejectionHook) -> Self {
        self.on_rejected = Some(hook);
        self
    }

    /// Start the timer. Returns `false` if it was already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let vault = self.vault.clone();
        let refresher = Arc::clone(&self.refresher);
        let period = self.period;
        let buffer = self.buffer;
        let on_rejected = self.on_rejected.clone();

        *task = Some(tokio::spawn(async move {
            // First check one full period after start
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match Self::tick(&vault, &refresher, buffer).await {
                    TickOutcome::NoToken => {
                        info!("No access token stored, stopping background refresh");
                        break;
                    }
                    TickOutcome::Rejected(e) => {
                        warn!(error = %e, "Refresh token rejected, stopping background refresh");
                        if let Some(hook) = &on_rejected {
                            hook(e).await;
                        }
                        break;
                    }
                    TickOutcome::Fresh | TickOutcome::Refreshed | TickOutcome::Failed => {}
                }
            }
        }));
        info!(period_secs = period.as_secs(), "Background token refresh started");
        true
    }

    /// Stop the timer. A refresh it already started is left to finish.
    pub fn stop(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("Background token refresh stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// One check: refresh if the stored access token is stale.
    pub async fn tick(
        vault: &TokenVault,
        refresher: &RefreshCoordinator,
        buffer: ChronoDuration,
    ) -> TickOutcome {
        let access = match vault.access_token().await {
            Ok(Some(token)) => token,
            Ok(None) => return TickOutcome::NoToken,
            Err(e) => {
                warn!(error = %e, "Could not read access token, skipping refresh check");
                return TickOutcome::Failed;
            }
        };

        if !is_expired_or_expiring_soon(&access, buffer) {
            debug!("Access token still fresh");
            return TickOutcome::Fresh;
        }

        match refresher.refresh().await {
            Ok(_) => TickOutcome::Refreshed,
            Err(e) if e.is_auth_fatal() => TickOutcome::Rejected(e),
            Err(e) => {
                // Best effort; the request path retries on 401
                debug!(error = %e, "Proactive token refresh failed");
                TickOutcome::Failed
            }
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
