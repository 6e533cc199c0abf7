//! Retained message store
//!
//! At most one message per exact topic name. Independent of any session.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::protocol::Publish;
use crate::topic::topic_matches_filter;

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: DashMap<Arc<str>, Publish, ahash::RandomState>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a retained publish: an empty payload clears the topic, anything
    /// else replaces what was stored.
    pub fn update(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            if self.messages.remove(&publish.topic).is_some() {
                trace!(topic = %publish.topic, "cleared retained message");
            }
            return;
        }

        let mut stored = publish.clone();
        stored.dup = false;
        stored.packet_id = None;
        stored.retain = true;
        self.messages.insert(publish.topic.clone(), stored);
        trace!(topic = %publish.topic, "stored retained message");
    }

    pub fn get(&self, topic: &str) -> Option<Publish> {
        self.messages.get(topic).map(|m| m.value().clone())
    }

    /// Copies of every retained message whose topic matches `filter`, with
    /// the retain flag set
    pub fn matching(&self, filter: &str) -> Vec<Publish> {
        self.messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
