//! Publish/subscribe exchange
//!
//! Process-wide state shared by every connection:
//! - the subscription table, topic filter -> subscribers of that filter
//! - the session registry, session id -> live [`SessionHandle`]
//! - the retained message store
//! - the persistent session store with per-client offline queues
//!
//! The top-level maps are `DashMap`s, so unrelated keys never contend. Each
//! filter's subscriber list has its own lock. [`Exchange::publish`] takes a
//! snapshot of the matching lists before delivering, so background sweeps and
//! concurrent subscribes never observe a list mid-mutation.

mod persistent;
mod retained;
mod sweep;


pub use persistent::{PersistentSession, PersistentStore};
pub use retained::RetainedStore;
pub use sweep::{SweepHandle, SweepReport};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::ExchangeConfig;
use crate::protocol::{ProtocolError, Publish, QoS};
use crate::session::{SessionHandle, SessionId};
use crate::topic::{
    topic_matches_filter, validate_topic_filter, validate_topic_name, Subscription,
};

/// One session's entry in a filter's subscriber list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscriber {
    pub session_id: SessionId,
    pub qos: QoS,
}

type SubscriberList = Arc<Mutex<Vec<Subscriber>>>;

/// What a single [`Exchange::publish`] did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Copies accepted by live sessions
    pub delivered: usize,
    /// Copies parked in offline queues of persistent sessions
    pub queued: usize,
    /// Stale subscriber entries removed
    pub pruned: usize,
}

pub struct Exchange {
    subscriptions: DashMap<Arc<str>, SubscriberList, ahash::RandomState>,
    sessions: DashMap<SessionId, Arc<dyn SessionHandle>, ahash::RandomState>,
    retained: RetainedStore,
    persistent: PersistentStore,
    config: ExchangeConfig,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(ExchangeConfig::default())
    }
}

impl Exchange {
    pub fn new(config: ExchangeConfig) -> Self {
        Self {
            subscriptions: DashMap::default(),
            sessions: DashMap::default(),
            retained: RetainedStore::new(),
            persistent: PersistentStore::new(config.offline_queue_capacity),
            config,
        }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    // ---- subscriptions ----

    /// Subscribe `session_id` to `filter`. A repeat subscription to the same
    /// filter replaces the granted QoS.
    pub fn subscribe(
        &self,
        session_id: SessionId,
        filter: &str,
        qos: QoS,
    ) -> Result<(), ProtocolError> {
        validate_topic_filter(filter).map_err(ProtocolError::InvalidTopicFilter)?;

        let entry = self.subscriptions.entry(Arc::from(filter)).or_default();
        let mut list = entry.lock();
        match list.iter_mut().find(|s| s.session_id == session_id) {
            Some(existing) => existing.qos = qos,
            None => list.push(Subscriber { session_id, qos }),
        }
        trace!(session_id, filter, ?qos, "subscribed");
        Ok(())
    }

    /// Remove `session_id` from `filter`. The filter disappears with its last
    /// subscriber.
    pub fn unsubscribe(&self, session_id: SessionId, filter: &str) -> bool {
        let removed = match self.subscriptions.get(filter) {
            Some(list) => {
                let mut list = list.lock();
                let before = list.len();
                list.retain(|s| s.session_id != session_id);
                list.len() != before
            }
            None => false,
        };
        self.subscriptions
            .remove_if(filter, |_, list| list.lock().is_empty());
        if removed {
            trace!(session_id, filter, "unsubscribed");
        }
        removed
    }

    /// Remove every subscription held by `session_id`. Returns how many.
    pub fn unsubscribe_all(&self, session_id: SessionId) -> usize {
        let mut removed = 0;
        let mut emptied = Vec::new();
        for (filter, list) in self.snapshot(|_| true) {
            let mut list = list.lock();
            let before = list.len();
            list.retain(|s| s.session_id != session_id);
            removed += before - list.len();
            if list.is_empty() {
                emptied.push(filter);
            }
        }
        for filter in emptied {
            self.subscriptions
                .remove_if(&filter, |_, list| list.lock().is_empty());
        }
        removed
    }

    /// Subscriptions currently held by `session_id`
    pub fn subscriptions_of(&self, session_id: SessionId) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .snapshot(|_| true)
            .into_iter()
            .filter_map(|(filter, list)| {
                let qos = list
                    .lock()
                    .iter()
                    .find(|s| s.session_id == session_id)
                    .map(|s| s.qos)?;
                Some(Subscription { filter, qos })
            })
            .collect();
        subs.sort_by(|a, b| a.filter.cmp(&b.filter));
        subs
    }

    /// Subscribers of exactly `filter`
    pub fn subscribers(&self, filter: &str) -> Vec<Subscriber> {
        self.subscriptions
            .get(filter)
            .map(|list| list.lock().clone())
            .unwrap_or_default()
    }

    pub fn filter_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ---- dispatch ----

    /// Route a publish to every matching subscriber.
    ///
    /// Each subscriber gets a copy downgraded to its granted QoS with the
    /// retain flag cleared. Subscribers whose session is gone are moved to
    /// their persistent offline queue, or pruned when they have none. A
    /// retained publish also updates the retained store.
    ///
    /// A topic name that is empty or contains wildcards is rejected before
    /// anything is routed or retained.
    pub fn publish(&self, publish: &Publish) -> Result<DispatchOutcome, ProtocolError> {
        validate_topic_name(&publish.topic).map_err(ProtocolError::InvalidTopicName)?;

        if publish.retain {
            self.retained.update(publish);
        }

        let mut outcome = DispatchOutcome::default();
        let matching = self.snapshot(|filter| topic_matches_filter(&publish.topic, filter));
        for (filter, list) in matching {
            let subscribers: SmallVec<[Subscriber; 8]> = list.lock().iter().copied().collect();

            let mut stale: SmallVec<[SessionId; 4]> = SmallVec::new();
            for sub in subscribers {
                let mut copy = publish.downgraded(sub.qos);
                copy.retain = false;

                let handle = self.sessions.get(&sub.session_id).map(|h| h.value().clone());
                match &handle {
                    Some(handle) if handle.is_connected() => {
                        if handle.deliver(copy) {
                            outcome.delivered += 1;
                        } else {
                            debug!(
                                session_id = sub.session_id,
                                topic = %publish.topic,
                                "delivery refused"
                            );
                        }
                    }
                    _ => {
                        if self.persistent.enqueue_for_session(sub.session_id, copy) {
                            outcome.queued += 1;
                        } else if handle.is_none() {
                            stale.push(sub.session_id);
                        }
                    }
                }
            }

            if !stale.is_empty() {
                outcome.pruned += self.prune(&filter, &list, &stale);
            }
        }

        trace!(
            topic = %publish.topic,
            delivered = outcome.delivered,
            queued = outcome.queued,
            "dispatched publish"
        );
        Ok(outcome)
    }

    fn prune(&self, filter: &Arc<str>, list: &SubscriberList, stale: &[SessionId]) -> usize {
        let pruned = {
            let mut list = list.lock();
            let before = list.len();
            list.retain(|s| !stale.contains(&s.session_id));
            before - list.len()
        };
        self.subscriptions
            .remove_if(filter, |_, list| list.lock().is_empty());
        debug!(filter = %filter, pruned, "pruned stale subscribers");
        pruned
    }

    /// Copy out `(filter, list)` pairs so no map guard is held while the
    /// lists are locked
    fn snapshot(&self, keep: impl Fn(&str) -> bool) -> Vec<(Arc<str>, SubscriberList)> {
        self.subscriptions
            .iter()
            .filter(|entry| keep(entry.key().as_ref()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    // ---- retained ----

    /// Retained messages to replay for a new subscription to `filter`.
    /// The copies carry `retain = true`.
    pub fn get_retained_messages(&self, filter: &str) -> Vec<Publish> {
        self.retained.matching(filter)
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    // ---- session registry ----

    /// Register a live session. Returns false if it replaced an existing
    /// handle for the same id.
    pub fn add_session(&self, session_id: SessionId, handle: Arc<dyn SessionHandle>) -> bool {
        let replaced = self.sessions.insert(session_id, handle).is_some();
        debug!(session_id, replaced, "session registered");
        !replaced
    }

    pub fn get_session(&self, session_id: SessionId) -> Option<Arc<dyn SessionHandle>> {
        self.sessions.get(&session_id).map(|h| h.value().clone())
    }

    /// Drop a session from the registry. Its subscriptions are left for the
    /// next publish to route offline or prune.
    pub fn remove_session(&self, session_id: SessionId) -> Option<Arc<dyn SessionHandle>> {
        let removed = self.sessions.remove(&session_id).map(|(_, h)| h);
        if removed.is_some() {
            debug!(session_id, "session removed");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ---- persistent sessions ----

    /// Save (or refresh) the persistent record for `client_id` with the
    /// configured default expiry
    pub fn save_persistent_session(
        &self,
        client_id: &str,
        session_id: SessionId,
        subscriptions: Vec<Subscription>,
    ) {
        let expiry = match self.config.session_expiry {
            d if d.is_zero() => None,
            d => Some(d),
        };
        self.persistent.save(client_id, session_id, subscriptions, expiry);
    }

    /// Save with an explicit expiry, e.g. from a v5 session expiry interval.
    /// `None` keeps the record until it is cleared.
    pub fn save_persistent_session_with_expiry(
        &self,
        client_id: &str,
        session_id: SessionId,
        subscriptions: Vec<Subscription>,
        expiry: Option<Duration>,
    ) {
        self.persistent.save(client_id, session_id, subscriptions, expiry);
    }

    /// Rebind the record for `client_id` to `session_id`.
    ///
    /// Subscription entries left under the previous session id are removed;
    /// the caller re-applies [`persistent_subscriptions`](Self::persistent_subscriptions)
    /// under the new id. Returns false when there is no record.
    pub fn restore_persistent_session(&self, client_id: &str, session_id: SessionId) -> bool {
        let Some(previous) = self.persistent.restore(client_id, session_id) else {
            return false;
        };
        if previous != session_id {
            let removed = self.unsubscribe_all(previous);
            trace!(client_id, previous, removed, "dropped subscriptions of previous session");
        }
        true
    }

    pub fn persistent_subscriptions(&self, client_id: &str) -> Vec<Subscription> {
        self.persistent.subscriptions(client_id).unwrap_or_default()
    }

    /// Delete the record for `client_id` together with its offline queue
    pub fn clear_persistent_session(&self, client_id: &str) -> bool {
        self.persistent.clear(client_id)
    }

    /// Park a message for an offline client. Does nothing and returns false
    /// when the client has no persistent record.
    pub fn enqueue_offline_message(&self, client_id: &str, publish: Publish) -> bool {
        self.persistent.enqueue(client_id, publish)
    }

    /// Drain the offline queue of `client_id`, oldest first
    pub fn take_offline_messages(&self, client_id: &str) -> Vec<Publish> {
        self.persistent.take_offline(client_id)
    }

    pub fn persistent(&self) -> &PersistentStore {
        &self.persistent
    }
}
