//! Persistent sessions
//!
//! Records for clients that connected without a clean-session request. Each
//! record keeps the client's subscriptions and a bounded offline queue that
//! collects publishes while no live session owns it.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::Publish;
use crate::session::SessionId;
use crate::topic::Subscription;

pub struct PersistentSession {
    pub client_id: Arc<str>,
    /// Session that currently owns the record
    pub session_id: SessionId,
    pub subscriptions: Vec<Subscription>,
    /// `None` never expires
    pub expiry: Option<Duration>,
    last_seen: Instant,
    offline: ArrayQueue<Publish>,
}

impl PersistentSession {
    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.expiry {
            Some(expiry) => now.saturating_duration_since(self.last_seen) >= expiry,
            None => false,
        }
    }
}

pub struct PersistentStore {
    records: DashMap<Arc<str>, PersistentSession, ahash::RandomState>,
    owners: DashMap<SessionId, Arc<str>, ahash::RandomState>,
    queue_capacity: usize,
}

impl PersistentStore {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            records: DashMap::default(),
            owners: DashMap::default(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Create or refresh the record for `client_id`. A refresh keeps queued
    /// offline messages.
    pub fn save(
        &self,
        client_id: &str,
        session_id: SessionId,
        subscriptions: Vec<Subscription>,
        expiry: Option<Duration>,
    ) {
        let now = Instant::now();
        let previous_owner = match self.records.get_mut(client_id) {
            Some(mut record) => {
                let previous = record.session_id;
                record.session_id = session_id;
                record.subscriptions = subscriptions;
                record.expiry = expiry;
                record.last_seen = now;
                Some(previous)
            }
            None => {
                let client_id: Arc<str> = Arc::from(client_id);
                self.records.insert(
                    client_id.clone(),
                    PersistentSession {
                        client_id,
                        session_id,
                        subscriptions,
                        expiry,
                        last_seen: now,
                        offline: ArrayQueue::new(self.queue_capacity),
                    },
                );
                None
            }
        };

        if let Some(previous) = previous_owner.filter(|&p| p != session_id) {
            self.owners.remove(&previous);
        }
        self.owners.insert(session_id, Arc::from(client_id));
        debug!(client_id, session_id, "saved persistent session");
    }

    /// Hand the record to `session_id`. Returns the previous owner, or `None`
    /// when there is no record.
    pub fn restore(&self, client_id: &str, session_id: SessionId) -> Option<SessionId> {
        let previous = {
            let mut record = self.records.get_mut(client_id)?;
            let previous = record.session_id;
            record.session_id = session_id;
            record.last_seen = Instant::now();
            previous
        };

        if previous != session_id {
            self.owners.remove(&previous);
        }
        self.owners.insert(session_id, Arc::from(client_id));
        debug!(client_id, previous, session_id, "restored persistent session");
        Some(previous)
    }

    /// Delete the record and whatever it had queued
    pub fn clear(&self, client_id: &str) -> bool {
        let Some((_, record)) = self.records.remove(client_id) else {
            return false;
        };
        self.owners
            .remove_if(&record.session_id, |_, owner| &**owner == client_id);
        debug!(client_id, dropped = record.offline.len(), "cleared persistent session");
        true
    }

    /// Queue a message for an offline client. No record means nothing is
    /// queued. A full queue loses its oldest message.
    pub fn enqueue(&self, client_id: &str, publish: Publish) -> bool {
        let Some(record) = self.records.get(client_id) else {
            return false;
        };
        if record.offline.force_push(publish).is_some() {
            debug!(client_id, "offline queue full, dropped oldest message");
        }
        true
    }

    /// [`enqueue`](Self::enqueue) for the client owned by `session_id`
    pub fn enqueue_for_session(&self, session_id: SessionId, publish: Publish) -> bool {
        let Some(client_id) = self.client_for(session_id) else {
            return false;
        };
        self.enqueue(&client_id, publish)
    }

    /// Drain the offline queue, oldest first
    pub fn take_offline(&self, client_id: &str) -> Vec<Publish> {
        let Some(record) = self.records.get(client_id) else {
            return Vec::new();
        };
        std::iter::from_fn(|| record.offline.pop()).collect()
    }

    pub fn subscriptions(&self, client_id: &str) -> Option<Vec<Subscription>> {
        self.records.get(client_id).map(|r| r.subscriptions.clone())
    }

    pub fn client_for(&self, session_id: SessionId) -> Option<Arc<str>> {
        self.owners.get(&session_id).map(|c| c.value().clone())
    }

    pub fn is_persistent(&self, session_id: SessionId) -> bool {
        self.owners.contains_key(&session_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.records.contains_key(client_id)
    }

    /// Inspect a record without copying it out
    pub fn with_record<R>(
        &self,
        client_id: &str,
        f: impl FnOnce(&PersistentSession) -> R,
    ) -> Option<R> {
        self.records.get(client_id).map(|r| f(&r))
    }

    /// Drop records past their expiry whose owner is not live. Returns the
    /// client ids removed.
    pub fn remove_expired(
        &self,
        now: Instant,
        is_live: impl Fn(SessionId) -> bool,
    ) -> Vec<Arc<str>> {
        let mut removed = Vec::new();
        self.records.retain(|client_id, record| {
            if is_live(record.session_id) || !record.is_expired(now) {
                return true;
            }
            removed.push(client_id.clone());
            false
        });

        for client_id in &removed {
            self.owners.retain(|_, owner| owner.as_ref() != client_id.as_ref());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
