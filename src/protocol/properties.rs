//! MQTT v5.0 Properties
//!
//! A properties block is a map from property identifier to one typed value,
//! plus the ordered (repeatable) list of user properties. Every identifier
//! has exactly one wire type, given by [`PropertyId::kind`].

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::codec::{variable_int_len, write_binary, write_string, write_variable_int, Reader};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers (MQTT v5.0 table 2-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// Wire type of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Byte,
    TwoByteInt,
    FourByteInt,
    VariableInt,
    Utf8String,
    BinaryData,
    Utf8Pair,
}

impl PropertyId {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PropertyId::*;
        let id = match v {
            0x01 => PayloadFormatIndicator,
            0x02 => MessageExpiryInterval,
            0x03 => ContentType,
            0x08 => ResponseTopic,
            0x09 => CorrelationData,
            0x0B => SubscriptionIdentifier,
            0x11 => SessionExpiryInterval,
            0x12 => AssignedClientIdentifier,
            0x13 => ServerKeepAlive,
            0x15 => AuthenticationMethod,
            0x16 => AuthenticationData,
            0x17 => RequestProblemInformation,
            0x18 => WillDelayInterval,
            0x19 => RequestResponseInformation,
            0x1A => ResponseInformation,
            0x1C => ServerReference,
            0x1F => ReasonString,
            0x21 => ReceiveMaximum,
            0x22 => TopicAliasMaximum,
            0x23 => TopicAlias,
            0x24 => MaximumQoS,
            0x25 => RetainAvailable,
            0x26 => UserProperty,
            0x27 => MaximumPacketSize,
            0x28 => WildcardSubscriptionAvailable,
            0x29 => SubscriptionIdentifierAvailable,
            0x2A => SharedSubscriptionAvailable,
            _ => return None,
        };
        Some(id)
    }

    pub fn kind(self) -> PropertyKind {
        use PropertyId::*;
        match self {
            PayloadFormatIndicator
            | RequestProblemInformation
            | RequestResponseInformation
            | MaximumQoS
            | RetainAvailable
            | WildcardSubscriptionAvailable
            | SubscriptionIdentifierAvailable
            | SharedSubscriptionAvailable => PropertyKind::Byte,
            ServerKeepAlive | ReceiveMaximum | TopicAliasMaximum | TopicAlias => {
                PropertyKind::TwoByteInt
            }
            MessageExpiryInterval
            | SessionExpiryInterval
            | WillDelayInterval
            | MaximumPacketSize => PropertyKind::FourByteInt,
            SubscriptionIdentifier => PropertyKind::VariableInt,
            ContentType
            | ResponseTopic
            | AssignedClientIdentifier
            | AuthenticationMethod
            | ResponseInformation
            | ServerReference
            | ReasonString => PropertyKind::Utf8String,
            CorrelationData | AuthenticationData => PropertyKind::BinaryData,
            UserProperty => PropertyKind::Utf8Pair,
        }
    }
}

/// A single typed property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByteInt(u16),
    FourByteInt(u32),
    VariableInt(u32),
    Utf8String(String),
    BinaryData(Bytes),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Byte(_) => PropertyKind::Byte,
            PropertyValue::TwoByteInt(_) => PropertyKind::TwoByteInt,
            PropertyValue::FourByteInt(_) => PropertyKind::FourByteInt,
            PropertyValue::VariableInt(_) => PropertyKind::VariableInt,
            PropertyValue::Utf8String(_) => PropertyKind::Utf8String,
            PropertyValue::BinaryData(_) => PropertyKind::BinaryData,
        }
    }

    /// Encoded size of the value alone
    fn encoded_size(&self) -> usize {
        match self {
            PropertyValue::Byte(_) => 1,
            PropertyValue::TwoByteInt(_) => 2,
            PropertyValue::FourByteInt(_) => 4,
            PropertyValue::VariableInt(v) => variable_int_len(*v),
            PropertyValue::Utf8String(s) => 2 + s.len(),
            PropertyValue::BinaryData(d) => 2 + d.len(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            PropertyValue::Byte(v) => buf.put_u8(*v),
            PropertyValue::TwoByteInt(v) => buf.put_u16(*v),
            PropertyValue::FourByteInt(v) => buf.put_u32(*v),
            PropertyValue::VariableInt(v) => {
                write_variable_int(buf, *v)?;
            }
            PropertyValue::Utf8String(s) => write_string(buf, s)?,
            PropertyValue::BinaryData(d) => write_binary(buf, d)?,
        }
        Ok(())
    }
}

macro_rules! int_property {
    ($getter:ident, $setter:ident, $id:ident, $variant:ident, $ty:ty) => {
        pub fn $getter(&self) -> Option<$ty> {
            match self.values.get(&PropertyId::$id) {
                Some(PropertyValue::$variant(v)) => Some(*v),
                _ => None,
            }
        }

        pub fn $setter(&mut self, value: $ty) {
            self.values
                .insert(PropertyId::$id, PropertyValue::$variant(value));
        }
    };
}

macro_rules! string_property {
    ($getter:ident, $setter:ident, $id:ident) => {
        pub fn $getter(&self) -> Option<&str> {
            match self.values.get(&PropertyId::$id) {
                Some(PropertyValue::Utf8String(s)) => Some(s.as_str()),
                _ => None,
            }
        }

        pub fn $setter(&mut self, value: impl Into<String>) {
            self.values
                .insert(PropertyId::$id, PropertyValue::Utf8String(value.into()));
        }
    };
}

macro_rules! binary_property {
    ($getter:ident, $setter:ident, $id:ident) => {
        pub fn $getter(&self) -> Option<&Bytes> {
            match self.values.get(&PropertyId::$id) {
                Some(PropertyValue::BinaryData(d)) => Some(d),
                _ => None,
            }
        }

        pub fn $setter(&mut self, value: impl Into<Bytes>) {
            self.values
                .insert(PropertyId::$id, PropertyValue::BinaryData(value.into()));
        }
    };
}

/// Properties block of a v5.0 packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<PropertyId, PropertyValue>,
    /// User properties; order is preserved and keys may repeat
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.user_properties.is_empty()
    }

    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.values.get(&id)
    }

    pub fn contains(&self, id: PropertyId) -> bool {
        self.values.contains_key(&id)
    }

    /// Insert a value for `id`. Returns false (and stores nothing) when the
    /// value's wire type does not match the identifier's.
    pub fn insert(&mut self, id: PropertyId, value: PropertyValue) -> bool {
        if id.kind() != value.kind() {
            return false;
        }
        self.values.insert(id, value);
        true
    }

    pub fn remove(&mut self, id: PropertyId) -> Option<PropertyValue> {
        self.values.remove(&id)
    }

    /// Typed entries in identifier order (user properties excluded)
    pub fn iter(&self) -> impl Iterator<Item = (PropertyId, &PropertyValue)> {
        self.values.iter().map(|(id, v)| (*id, v))
    }

    pub fn add_user_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.user_properties.push((key.into(), value.into()));
    }

    int_property!(
        payload_format_indicator,
        set_payload_format_indicator,
        PayloadFormatIndicator,
        Byte,
        u8
    );
    int_property!(
        message_expiry_interval,
        set_message_expiry_interval,
        MessageExpiryInterval,
        FourByteInt,
        u32
    );
    string_property!(content_type, set_content_type, ContentType);
    string_property!(response_topic, set_response_topic, ResponseTopic);
    binary_property!(correlation_data, set_correlation_data, CorrelationData);
    int_property!(
        subscription_identifier,
        set_subscription_identifier,
        SubscriptionIdentifier,
        VariableInt,
        u32
    );
    int_property!(
        session_expiry_interval,
        set_session_expiry_interval,
        SessionExpiryInterval,
        FourByteInt,
        u32
    );
    string_property!(
        assigned_client_identifier,
        set_assigned_client_identifier,
        AssignedClientIdentifier
    );
    int_property!(server_keep_alive, set_server_keep_alive, ServerKeepAlive, TwoByteInt, u16);
    string_property!(authentication_method, set_authentication_method, AuthenticationMethod);
    binary_property!(authentication_data, set_authentication_data, AuthenticationData);
    int_property!(
        request_problem_information,
        set_request_problem_information,
        RequestProblemInformation,
        Byte,
        u8
    );
    int_property!(
        will_delay_interval,
        set_will_delay_interval,
        WillDelayInterval,
        FourByteInt,
        u32
    );
    int_property!(
        request_response_information,
        set_request_response_information,
        RequestResponseInformation,
        Byte,
        u8
    );
    string_property!(response_information, set_response_information, ResponseInformation);
    string_property!(server_reference, set_server_reference, ServerReference);
    string_property!(reason_string, set_reason_string, ReasonString);
    int_property!(receive_maximum, set_receive_maximum, ReceiveMaximum, TwoByteInt, u16);
    int_property!(topic_alias_maximum, set_topic_alias_maximum, TopicAliasMaximum, TwoByteInt, u16);
    int_property!(topic_alias, set_topic_alias, TopicAlias, TwoByteInt, u16);
    int_property!(maximum_qos, set_maximum_qos, MaximumQoS, Byte, u8);
    int_property!(retain_available, set_retain_available, RetainAvailable, Byte, u8);
    int_property!(
        maximum_packet_size,
        set_maximum_packet_size,
        MaximumPacketSize,
        FourByteInt,
        u32
    );
    int_property!(
        wildcard_subscription_available,
        set_wildcard_subscription_available,
        WildcardSubscriptionAvailable,
        Byte,
        u8
    );
    int_property!(
        subscription_identifier_available,
        set_subscription_identifier_available,
        SubscriptionIdentifierAvailable,
        Byte,
        u8
    );
    int_property!(
        shared_subscription_available,
        set_shared_subscription_available,
        SharedSubscriptionAvailable,
        Byte,
        u8
    );

    /// Encoded size of the block, excluding its length prefix
    pub fn encoded_size(&self) -> usize {
        let typed: usize = self.values.values().map(|v| 1 + v.encoded_size()).sum();
        let user: usize = self
            .user_properties
            .iter()
            .map(|(k, v)| 1 + 2 + k.len() + 2 + v.len())
            .sum();
        typed + user
    }

    /// Encoded size including the variable-length prefix
    pub fn wire_size(&self) -> usize {
        let size = self.encoded_size();
        variable_int_len(size as u32) + size
    }

    /// Decode a properties block (length prefix included).
    ///
    /// An identifier this implementation does not know has no known wire
    /// type, so the rest of the block is skipped; the bytes that follow the
    /// block are still decoded normally.
    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = reader.variable_int()? as usize;
        let mut block = Reader::new(reader.take(len)?);
        let mut props = Properties::new();

        while !block.is_empty() {
            let raw_id = block.u8()?;
            let Some(id) = PropertyId::from_u8(raw_id) else {
                debug!(
                    "skipping {} bytes after unknown property 0x{:02X}",
                    block.remaining(),
                    raw_id
                );
                break;
            };

            let value = match id.kind() {
                PropertyKind::Utf8Pair => {
                    let key = block.string()?;
                    let value = block.string()?;
                    props.add_user_property(key, value);
                    continue;
                }
                PropertyKind::Byte => PropertyValue::Byte(block.u8()?),
                PropertyKind::TwoByteInt => PropertyValue::TwoByteInt(block.u16()?),
                PropertyKind::FourByteInt => PropertyValue::FourByteInt(block.u32()?),
                PropertyKind::VariableInt => PropertyValue::VariableInt(block.variable_int()?),
                PropertyKind::Utf8String => PropertyValue::Utf8String(block.string()?.to_string()),
                PropertyKind::BinaryData => {
                    PropertyValue::BinaryData(Bytes::copy_from_slice(block.binary()?))
                }
            };

            check_value(id, &value)?;

            if props.values.insert(id, value).is_some() {
                return Err(DecodeError::DuplicateProperty(id as u8));
            }
        }

        Ok(props)
    }

    /// Encode the block with its variable-length prefix
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        for (id, value) in &self.values {
            buf.put_u8(*id as u8);
            value.encode(buf)?;
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(PropertyId::UserProperty as u8);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }

        Ok(())
    }
}

/// Values the protocol forbids for specific identifiers
fn check_value(id: PropertyId, value: &PropertyValue) -> Result<(), DecodeError> {
    match (id, value) {
        (PropertyId::ReceiveMaximum, PropertyValue::TwoByteInt(0)) => {
            Err(DecodeError::MalformedPacket("receive maximum cannot be 0"))
        }
        (PropertyId::TopicAlias, PropertyValue::TwoByteInt(0)) => {
            Err(DecodeError::MalformedPacket("topic alias cannot be 0"))
        }
        (PropertyId::MaximumPacketSize, PropertyValue::FourByteInt(0)) => {
            Err(DecodeError::MalformedPacket("maximum packet size cannot be 0"))
        }
        (PropertyId::SubscriptionIdentifier, PropertyValue::VariableInt(0)) => Err(
            DecodeError::MalformedPacket("subscription identifier cannot be 0"),
        ),
        (PropertyId::MaximumQoS, PropertyValue::Byte(q)) if *q > 1 => {
            Err(DecodeError::MalformedPacket("maximum QoS must be 0 or 1"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(props: &Properties) -> Properties {
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), props.wire_size());
        let mut reader = Reader::new(&buf);
        let decoded = Properties::decode(&mut reader).unwrap();
        assert!(reader.is_empty());
        decoded
    }

    #[test]
    fn typed_accessors_round_trip() {
        let mut props = Properties::new();
        props.set_receive_maximum(20);
        props.set_session_expiry_interval(3600);
        props.set_content_type("text/plain");
        props.set_correlation_data(Bytes::from_static(b"\x01\x02"));
        props.set_subscription_identifier(268_435_455);
        props.add_user_property("k", "v1");
        props.add_user_property("k", "v2");

        let decoded = round_trip(&props);
        assert_eq!(decoded, props);
        assert_eq!(decoded.receive_maximum(), Some(20));
        assert_eq!(decoded.content_type(), Some("text/plain"));
        assert_eq!(decoded.user_properties.len(), 2);
    }

    #[test]
    fn insert_rejects_wrong_kind() {
        let mut props = Properties::new();
        assert!(!props.insert(PropertyId::TopicAlias, PropertyValue::Byte(1)));
        assert!(props.insert(PropertyId::TopicAlias, PropertyValue::TwoByteInt(1)));
        assert_eq!(props.topic_alias(), Some(1));
    }

    #[test]
    fn unknown_property_skips_rest_of_block() {
        // block: receive maximum 10, unknown 0x7F with two junk bytes; then a trailing byte
        let raw = [0x06, 0x21, 0x00, 0x0A, 0x7F, 0xAA, 0xBB, 0x42];
        let mut reader = Reader::new(&raw);
        let props = Properties::decode(&mut reader).unwrap();
        assert_eq!(props.receive_maximum(), Some(10));
        assert_eq!(reader.u8().unwrap(), 0x42);
    }

    #[test]
    fn duplicate_property_is_rejected() {
        let raw = [0x06, 0x21, 0x00, 0x0A, 0x21, 0x00, 0x0B];
        let mut reader = Reader::new(&raw);
        assert_eq!(
            Properties::decode(&mut reader),
            Err(DecodeError::DuplicateProperty(0x21))
        );
    }

    #[test]
    fn zero_topic_alias_is_malformed() {
        let raw = [0x03, 0x23, 0x00, 0x00];
        let mut reader = Reader::new(&raw);
        assert!(matches!(
            Properties::decode(&mut reader),
            Err(DecodeError::MalformedPacket(_))
        ));
    }
}
