//! Inflight Manager
//!
//! Per-connection table of outbound QoS 1/2 publishes that are waiting for
//! their acknowledgement. A shared tokio task polls the table at a fixed
//! interval and re-sends anything older than the retry timeout through the
//! [`RetrySender`] given at construction. The task is started by the first
//! [`InflightManager::add`] and exits on its own once the table is empty.
//!
//! Messages that reach `max_retries` are dropped with a warning. There is no
//! escalation to the caller, so QoS 2 is best-effort past the retry ceiling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::InflightConfig;
use crate::protocol::{Packet, PubResponse, Publish, QoS};


/// Error type returned by a [`RetrySender`]
pub type SendError = Box<dyn std::error::Error + Send + Sync>;

/// Where a QoS 1/2 exchange stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightStage {
    /// PUBLISH sent, waiting for PUBACK (QoS 1) or PUBREC (QoS 2)
    AwaitingAck,
    /// PUBREL sent, waiting for PUBCOMP
    AwaitingComp,
}

/// An unacknowledged outbound publish
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub packet_id: u16,
    /// Carries `packet_id`; `dup` is set once it has been re-sent
    pub publish: Publish,
    pub stage: InflightStage,
    pub sent_at: Instant,
    pub retry_count: u32,
}

impl InflightMessage {
    /// The packet to put on the wire for this entry's current stage
    pub fn packet(&self) -> Packet {
        match self.stage {
            InflightStage::AwaitingAck => Packet::Publish(self.publish.clone()),
            InflightStage::AwaitingComp => Packet::PubRel(PubResponse::new(self.packet_id)),
        }
    }
}

/// Re-send strategy invoked by the retry timer
pub trait RetrySender: Send + Sync + 'static {
    fn resend(&self, message: &InflightMessage) -> Result<(), SendError>;
}

impl<F> RetrySender for F
where
    F: Fn(&InflightMessage) -> Result<(), SendError> + Send + Sync + 'static,
{
    fn resend(&self, message: &InflightMessage) -> Result<(), SendError> {
        self(message)
    }
}

/// Result of one retry scan
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    pub resent: usize,
    pub dropped: usize,
}

struct Table {
    entries: HashMap<u16, InflightMessage>,
    next_packet_id: u16,
}

struct Inner {
    table: Mutex<Table>,
    timer_running: AtomicBool,
    stopped: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    sender: Box<dyn RetrySender>,
    config: InflightConfig,
}

/// Tracks unacknowledged QoS 1/2 publishes for one connection
#[derive(Clone)]
pub struct InflightManager {
    inner: Arc<Inner>,
}

impl InflightManager {
    pub fn new(config: InflightConfig, sender: impl RetrySender) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table {
                    entries: HashMap::new(),
                    next_packet_id: 1,
                }),
                timer_running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                timer: Mutex::new(None),
                sender: Box::new(sender),
                config,
            }),
        }
    }

    /// Allocate the next free packet identifier.
    ///
    /// Ids count up from 1, wrap from 65535 back to 1 and skip ids that are
    /// still pending. Returns `None` only when all 65535 ids are in flight.
    pub fn next_packet_id(&self) -> Option<u16> {
        let mut table = self.inner.table.lock();
        for _ in 0..u16::MAX {
            let id = table.next_packet_id;
            table.next_packet_id = match id {
                u16::MAX => 1,
                n => n + 1,
            };
            if !table.entries.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Register a sent QoS 1/2 publish under `packet_id`.
    ///
    /// Returns false, leaving the table untouched, for QoS 0, a zero id or an
    /// id that is already pending.
    pub fn add(&self, packet_id: u16, mut publish: Publish) -> bool {
        if packet_id == 0 || publish.qos == QoS::AtMostOnce {
            debug!(packet_id, "not tracking publish without acknowledgement");
            return false;
        }

        publish.packet_id = Some(packet_id);
        {
            let mut table = self.inner.table.lock();
            if table.entries.contains_key(&packet_id) {
                warn!(packet_id, "packet id already inflight");
                return false;
            }
            table.entries.insert(
                packet_id,
                InflightMessage {
                    packet_id,
                    publish,
                    stage: InflightStage::AwaitingAck,
                    sent_at: Instant::now(),
                    retry_count: 0,
                },
            );
        }

        self.ensure_timer();
        true
    }

    /// Complete an exchange (PUBACK, PUBCOMP). Unknown ids return false.
    pub fn acknowledge(&self, packet_id: u16) -> bool {
        let removed = self.inner.table.lock().entries.remove(&packet_id).is_some();
        if !removed {
            debug!(packet_id, "acknowledgement for unknown packet id");
        }
        removed
    }

    /// PUBREC received for a QoS 2 publish: from now on the entry waits for
    /// PUBCOMP and is retried as PUBREL.
    pub fn release(&self, packet_id: u16) -> bool {
        let mut table = self.inner.table.lock();
        match table.entries.get_mut(&packet_id) {
            Some(entry) if entry.publish.qos == QoS::ExactlyOnce => {
                entry.stage = InflightStage::AwaitingComp;
                entry.sent_at = Instant::now();
                entry.retry_count = 0;
                true
            }
            Some(_) => {
                debug!(packet_id, "PUBREC for a QoS 1 publish");
                false
            }
            None => {
                debug!(packet_id, "PUBREC for unknown packet id");
                false
            }
        }
    }

    /// Re-send or drop every entry older than the retry timeout at `now`
    pub fn poll_expired(&self, now: Instant) -> RetryOutcome {
        self.inner.retry_expired(now, false).0
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.inner.table.lock().entries.contains_key(&packet_id)
    }

    pub fn get(&self, packet_id: u16) -> Option<InflightMessage> {
        self.inner.table.lock().entries.get(&packet_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_timer_running(&self) -> bool {
        self.inner.timer_running.load(Ordering::Acquire)
    }

    /// Cancel the retry timer. Pending entries stay in the table and no new
    /// timer is started afterwards. Calling it again does nothing.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
        }
        self.inner.timer_running.store(false, Ordering::Release);
        debug!("inflight retry timer stopped");
    }

    /// Remove and return every pending entry, ordered by packet id
    pub fn drain(&self) -> Vec<InflightMessage> {
        let mut drained: Vec<_> = self
            .inner
            .table
            .lock()
            .entries
            .drain()
            .map(|(_, m)| m)
            .collect();
        drained.sort_by_key(|m| m.packet_id);
        drained
    }

    fn ensure_timer(&self) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        if self
            .inner
            .timer_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            self.inner.timer_running.store(false, Ordering::Release);
            warn!("no tokio runtime, inflight retries need poll_expired");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let poll_interval = self.inner.config.poll_interval;
        let handle = runtime.spawn(run_timer(weak, poll_interval));
        *self.inner.timer.lock() = Some(handle);
        trace!("inflight retry timer started");
    }
}

impl Inner {
    /// Scan for expired entries. When `from_timer` is set and the table is
    /// empty after the scan, the running flag is cleared while the table lock
    /// is held, so a concurrent `add` either sees the flag cleared or its entry
    /// is seen by this scan.
    fn retry_expired(&self, now: Instant, from_timer: bool) -> (RetryOutcome, bool) {
        let mut outcome = RetryOutcome::default();
        let mut to_send = Vec::new();
        let keep_running;

        {
            let mut table = self.table.lock();
            let retry_timeout = self.config.retry_timeout;
            let max_retries = self.config.max_retries;

            table.entries.retain(|packet_id, entry| {
                if now.saturating_duration_since(entry.sent_at) < retry_timeout {
                    return true;
                }
                if entry.retry_count >= max_retries {
                    warn!(
                        packet_id = *packet_id,
                        retries = entry.retry_count,
                        "dropping unacknowledged message after retry limit"
                    );
                    outcome.dropped += 1;
                    return false;
                }

                entry.retry_count += 1;
                entry.sent_at = now;
                entry.publish.dup = true;
                to_send.push(entry.clone());
                true
            });

            keep_running = !table.entries.is_empty();
            if from_timer && !keep_running {
                self.timer_running.store(false, Ordering::Release);
            }
        }

        for entry in &to_send {
            trace!(
                packet_id = entry.packet_id,
                retry = entry.retry_count,
                stage = ?entry.stage,
                "re-sending inflight message"
            );
            match self.sender.resend(entry) {
                Ok(()) => outcome.resent += 1,
                Err(e) => warn!(packet_id = entry.packet_id, "re-send failed: {}", e),
            }
        }

        (outcome, keep_running)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_timer(inner: Weak<Inner>, poll_interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }

        let (_, keep_running) = inner.retry_expired(Instant::now(), true);
        if !keep_running {
            trace!("inflight table empty, retry timer exiting");
            return;
        }
    }
}
