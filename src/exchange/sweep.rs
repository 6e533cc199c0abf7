//! Session liveness sweep
//!
//! The only place sessions leave the registry outside explicit
//! connect/disconnect handling. A sweep closes and removes sessions whose
//! connection is gone or that have been idle past `idle_timeout`, then
//! deletes persistent records that outlived their expiry with no live owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::Exchange;
use crate::session::{SessionHandle, SessionId};

/// Result of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions closed and removed from the registry
    pub removed_sessions: Vec<SessionId>,
    /// Persistent records deleted after expiring
    pub expired_persistent: Vec<Arc<str>>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.removed_sessions.is_empty() && self.expired_persistent.is_empty()
    }
}

impl Exchange {
    /// Run one sweep at the current time
    pub fn sweep_sessions(&self) -> SweepReport {
        self.sweep_sessions_at(Instant::now())
    }

    pub fn sweep_sessions_at(&self, now: Instant) -> SweepReport {
        let idle_timeout = self.config.idle_timeout;

        let dead: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| is_stale(entry.value().as_ref(), now, idle_timeout))
            .map(|entry| *entry.key())
            .collect();

        let mut report = SweepReport::default();
        for session_id in dead {
            // Re-check under removal: the session may have reconnected or
            // been touched since the scan
            let removed = self.sessions.remove_if(&session_id, |_, handle| {
                is_stale(handle.as_ref(), now, idle_timeout)
            });
            if let Some((_, handle)) = removed {
                handle.close();
                trace!(session_id, "sweep removed session");
                report.removed_sessions.push(session_id);
            }
        }

        report.expired_persistent = self
            .persistent
            .remove_expired(now, |session_id| self.sessions.contains_key(&session_id));

        if report.is_empty() {
            trace!("sweep found nothing to remove");
        } else {
            info!(
                sessions = report.removed_sessions.len(),
                persistent = report.expired_persistent.len(),
                "session sweep"
            );
        }
        report
    }

    /// Start a background task that sweeps every `sweep_interval`.
    ///
    /// The task holds only a weak reference and exits once the exchange is
    /// dropped or the returned handle is stopped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweepHandle {
        let interval = self.config.sweep_interval;
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let exchange: Weak<Exchange> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.recv() => {
                        match result {
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(exchange) = exchange.upgrade() else {
                            break;
                        };
                        exchange.sweep_sessions();
                    }
                }
            }
            debug!("session sweeper exited");
        });
        debug!(?interval, "session sweeper started");

        SweepHandle {
            shutdown,
            stopped: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }
}

fn is_stale(handle: &dyn SessionHandle, now: Instant, idle_timeout: Duration) -> bool {
    if !handle.is_connected() {
        return true;
    }
    // A zero timeout disables the idle check
    !idle_timeout.is_zero() && now.saturating_duration_since(handle.last_activity()) > idle_timeout
}

/// Handle to a background sweeper. Dropping it stops the sweeper.
pub struct SweepHandle {
    shutdown: broadcast::Sender<()>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SweepHandle {
    /// Stop the sweeper. Calling it again does nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // No receiver means the task already exited
        let _ = self.shutdown.send(());
        debug!("session sweeper stopping");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop and wait for the task to finish
    pub async fn join(self) {
        self.stop();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
