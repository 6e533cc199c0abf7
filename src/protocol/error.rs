//! Protocol error types
//!
//! `DecodeError` is a framing failure: the connection must be closed.
//! `ProtocolError` is a well-formed packet that breaks a protocol rule: the
//! caller answers with a DISCONNECT carrying [`ProtocolError::reason_code`].

use std::fmt;

use super::ReasonCode;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Declared remaining length exceeds the buffered bytes
    Truncated { declared: usize, available: usize },
    /// Packet type nibble 0 (reserved)
    InvalidPacketType(u8),
    /// Invalid remaining length encoding
    InvalidRemainingLength,
    /// Invalid protocol name
    InvalidProtocolName,
    /// Invalid protocol version
    InvalidProtocolVersion(u8),
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Duplicate property (not allowed)
    DuplicateProperty(u8),
    /// Invalid packet flags
    InvalidFlags,
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet too large
    PacketTooLarge,
    /// Invalid reason code
    InvalidReasonCode(u8),
    /// Invalid subscription options
    InvalidSubscriptionOptions,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::Truncated {
                declared,
                available,
            } => write!(
                f,
                "truncated packet: remaining length {} but only {} bytes buffered",
                declared, available
            ),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "invalid protocol version: {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::DuplicateProperty(id) => write!(f, "duplicate property: 0x{:02X}", id),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::InvalidReasonCode(r) => write!(f, "invalid reason code: 0x{:02X}", r),
            Self::InvalidSubscriptionOptions => write!(f, "invalid subscription options"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Packet too large
    PacketTooLarge,
    /// String or binary field longer than 65535 bytes
    StringTooLong,
    /// Packet kind not available in the negotiated protocol version
    UnsupportedPacket(&'static str),
    /// Field combination the wire format cannot express
    InvalidPacket(&'static str),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::UnsupportedPacket(kind) => {
                write!(f, "{} is not supported by this protocol version", kind)
            }
            Self::InvalidPacket(msg) => write!(f, "invalid packet: {}", msg),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Protocol violations raised by well-formed packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Decode error
    Decode(DecodeError),
    /// Encode error
    Encode(EncodeError),
    /// Topic alias is zero, above the advertised maximum, or unknown
    TopicAliasInvalid(u16),
    /// Topic name failed validation
    InvalidTopicName(&'static str),
    /// Topic filter failed validation
    InvalidTopicFilter(&'static str),
    /// Peer sent more QoS > 0 publishes than the receive maximum
    ReceiveMaximumExceeded,
    /// Packet exceeds the negotiated maximum packet size
    PacketTooLarge { size: usize, maximum: u32 },
    /// Other protocol violation
    ProtocolViolation(&'static str),
}

impl ProtocolError {
    /// Reason code for the DISCONNECT that answers this violation
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::Decode(_) => ReasonCode::MalformedPacket,
            Self::Encode(_) => ReasonCode::ImplementationError,
            Self::TopicAliasInvalid(_) => ReasonCode::TopicAliasInvalid,
            Self::InvalidTopicName(_) => ReasonCode::TopicNameInvalid,
            Self::InvalidTopicFilter(_) => ReasonCode::TopicFilterInvalid,
            Self::ReceiveMaximumExceeded => ReasonCode::ReceiveMaxExceeded,
            Self::PacketTooLarge { .. } => ReasonCode::PacketTooLarge,
            Self::ProtocolViolation(_) => ReasonCode::ProtocolError,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::TopicAliasInvalid(alias) => write!(f, "topic alias invalid: {}", alias),
            Self::InvalidTopicName(msg) => write!(f, "invalid topic name: {}", msg),
            Self::InvalidTopicFilter(msg) => write!(f, "invalid topic filter: {}", msg),
            Self::ReceiveMaximumExceeded => write!(f, "receive maximum exceeded"),
            Self::PacketTooLarge { size, maximum } => {
                write!(f, "packet of {} bytes exceeds maximum {}", size, maximum)
            }
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
