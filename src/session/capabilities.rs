//! Negotiated MQTT 5.0 limits for one connection
//!
//! Created when a CONNECT is accepted and dropped with the connection. Holds
//! the flow-control window, packet size limits and both topic alias tables:
//! aliases the client registered with us (inbound) and aliases we assigned
//! to the client (outbound).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::protocol::{Properties, PropertyId, ProtocolError, Publish};

/// What [`SessionCapabilities::assign_topic_alias`] did to an outbound publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasAssignment {
    /// No alias: aliasing is off or the client's table is full
    None,
    /// A fresh alias was attached; the full topic name is still sent
    New(u16),
    /// A known alias replaced the topic name
    Reused(u16),
}

#[derive(Debug, Clone)]
pub struct SessionCapabilities {
    /// Client's receive maximum: QoS 1/2 publishes we may have unacknowledged
    pub receive_maximum: u16,
    /// Our receive maximum: QoS 1/2 publishes the client may have unacknowledged
    pub inbound_receive_maximum: u16,
    /// Largest packet the client accepts from us
    pub max_packet_size: Option<u32>,
    /// Largest packet we accept from the client
    pub inbound_max_packet_size: Option<u32>,
    /// Aliases the client may register with us
    pub topic_alias_maximum: u16,
    /// Aliases the client lets us assign (its CONNECT topic alias maximum)
    pub server_topic_alias_maximum: u16,
    pub session_expiry_interval: Option<u32>,
    inbound_aliases: HashMap<u16, Arc<str>>,
    outbound_aliases: HashMap<Arc<str>, u16>,
    next_outbound_alias: u16,
}

impl Default for SessionCapabilities {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

impl SessionCapabilities {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            receive_maximum: u16::MAX,
            inbound_receive_maximum: config.receive_maximum,
            max_packet_size: None,
            inbound_max_packet_size: match config.max_packet_size {
                0 => None,
                n => Some(n),
            },
            topic_alias_maximum: config.topic_alias_maximum,
            server_topic_alias_maximum: 0,
            session_expiry_interval: None,
            inbound_aliases: HashMap::new(),
            outbound_aliases: HashMap::new(),
            next_outbound_alias: 1,
        }
    }

    /// Copy the limits a client put in its CONNECT properties. Absent values
    /// keep their current setting.
    pub fn apply_connect_properties(&mut self, props: &Properties) {
        if let Some(v) = props.receive_maximum() {
            self.receive_maximum = v;
        }
        if let Some(v) = props.maximum_packet_size() {
            self.max_packet_size = Some(v);
        }
        if let Some(v) = props.topic_alias_maximum() {
            self.server_topic_alias_maximum = v;
        }
        if let Some(v) = props.session_expiry_interval() {
            self.session_expiry_interval = Some(v);
        }
        debug!(
            receive_maximum = self.receive_maximum,
            max_packet_size = ?self.max_packet_size,
            topic_alias_maximum = self.server_topic_alias_maximum,
            "applied connect properties"
        );
    }

    /// Properties advertising our own limits in the CONNACK
    pub fn connack_properties(&self) -> Properties {
        let mut props = Properties::new();
        if self.inbound_receive_maximum < u16::MAX {
            props.set_receive_maximum(self.inbound_receive_maximum);
        }
        if self.topic_alias_maximum > 0 {
            props.set_topic_alias_maximum(self.topic_alias_maximum);
        }
        if let Some(max) = self.inbound_max_packet_size {
            props.set_maximum_packet_size(max);
        }
        props
    }

    /// Resolve the topic alias on an inbound publish.
    ///
    /// A publish with a topic name registers (or replaces) the alias; one
    /// with an empty topic gets the remembered name filled in. The alias
    /// property is removed either way since aliases are scoped to this
    /// connection.
    pub fn resolve_topic_alias(&mut self, publish: &mut Publish) -> Result<(), ProtocolError> {
        let Some(alias) = publish.properties.topic_alias() else {
            if publish.topic.is_empty() {
                return Err(ProtocolError::ProtocolViolation(
                    "empty topic name without topic alias",
                ));
            }
            return Ok(());
        };
        if alias == 0 || alias > self.topic_alias_maximum {
            return Err(ProtocolError::TopicAliasInvalid(alias));
        }

        if publish.topic.is_empty() {
            let Some(topic) = self.inbound_aliases.get(&alias) else {
                debug!(alias, "publish uses unknown topic alias");
                return Err(ProtocolError::TopicAliasInvalid(alias));
            };
            publish.topic = topic.clone();
        } else {
            trace!(alias, topic = %publish.topic, "registered inbound topic alias");
            self.inbound_aliases.insert(alias, publish.topic.clone());
        }

        publish.properties.remove(PropertyId::TopicAlias);
        Ok(())
    }

    /// Attach an outbound topic alias when the client allows them.
    pub fn assign_topic_alias(&mut self, publish: &mut Publish) -> AliasAssignment {
        if self.server_topic_alias_maximum == 0 || publish.topic.is_empty() {
            return AliasAssignment::None;
        }

        if let Some(&alias) = self.outbound_aliases.get(&publish.topic) {
            publish.properties.set_topic_alias(alias);
            publish.topic = Arc::from("");
            return AliasAssignment::Reused(alias);
        }

        if self.next_outbound_alias > self.server_topic_alias_maximum {
            return AliasAssignment::None;
        }
        let alias = self.next_outbound_alias;
        self.next_outbound_alias += 1;
        self.outbound_aliases.insert(publish.topic.clone(), alias);
        publish.properties.set_topic_alias(alias);
        AliasAssignment::New(alias)
    }

    /// Flow-control gate checked before emitting another QoS 1/2 publish
    #[inline]
    pub fn can_send_qos_message(&self, inflight_count: usize) -> bool {
        inflight_count < usize::from(self.receive_maximum)
    }

    /// Reject another inbound QoS 1/2 publish once `pending` unacknowledged
    /// ones already fill our receive maximum
    pub fn check_inbound_quota(&self, pending: usize) -> Result<(), ProtocolError> {
        if pending >= usize::from(self.inbound_receive_maximum) {
            debug!(
                pending,
                receive_maximum = self.inbound_receive_maximum,
                "client exceeded receive maximum"
            );
            return Err(ProtocolError::ReceiveMaximumExceeded);
        }
        Ok(())
    }

    /// Whether a packet of `len` bytes may be sent to the client
    #[inline]
    pub fn fits_packet_size(&self, len: usize) -> bool {
        match self.max_packet_size {
            Some(max) => len <= max as usize,
            None => true,
        }
    }

    /// Reject an inbound packet above our advertised maximum
    pub fn check_inbound_size(&self, len: usize) -> Result<(), ProtocolError> {
        match self.inbound_max_packet_size {
            Some(maximum) if len > maximum as usize => {
                Err(ProtocolError::PacketTooLarge { size: len, maximum })
            }
            _ => Ok(()),
        }
    }
}
