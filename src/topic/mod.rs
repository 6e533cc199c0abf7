//! Topic matching and subscription values
//!
//! Topic names and filters are validated and matched by the functions in
//! [`validation`]; the exchange stores one [`Subscription`] per
//! `(session, filter)` pair.

pub mod validation;

pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_name, MAX_TOPIC_LENGTH,
};

use std::sync::Arc;

use crate::protocol::QoS;

/// A topic filter with the QoS granted for it.
///
/// Two subscriptions are equal only when both the filter and the QoS match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub filter: Arc<str>,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(filter: impl Into<Arc<str>>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }

    /// Whether this subscription's filter matches `topic`
    #[inline]
    pub fn matches(&self, topic: &str) -> bool {
        topic_matches_filter(topic, &self.filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_includes_qos() {
        let a = Subscription::new("a/+", QoS::AtMostOnce);
        let b = Subscription::new("a/+", QoS::AtLeastOnce);
        assert_ne!(a, b);
        assert_eq!(a, Subscription::new("a/+", QoS::AtMostOnce));
        assert!(a.matches("a/b"));
    }
}
