//! MQTT Packet Decoder
//!
//! Decodes MQTT packets for v3.1, v3.1.1 and v5.0. The packet type nibble
//! selects a body decoder from a fixed table; flag nibbles for every kind
//! except PUBLISH are checked once, before dispatch.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_variable_int, Reader, MAX_REMAINING_LENGTH};
use crate::protocol::{
    Auth, ConnAck, Connect, DecodeError, Disconnect, Packet, PacketType, Properties,
    ProtocolVersion, PubResponse, Publish, QoS, ReasonCode, SubAck, Subscribe, SubscribeFilter,
    SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

type BodyDecoder = fn(&mut Decoder, u8, &mut Reader<'_>) -> Result<Packet, DecodeError>;

/// Body decoders indexed by packet type nibble
const BODY_DECODERS: [BodyDecoder; 16] = [
    Decoder::decode_reserved,
    Decoder::decode_connect,
    Decoder::decode_connack,
    Decoder::decode_publish,
    Decoder::decode_puback,
    Decoder::decode_pubrec,
    Decoder::decode_pubrel,
    Decoder::decode_pubcomp,
    Decoder::decode_subscribe,
    Decoder::decode_suback,
    Decoder::decode_unsubscribe,
    Decoder::decode_unsuback,
    Decoder::decode_pingreq,
    Decoder::decode_pingresp,
    Decoder::decode_disconnect,
    Decoder::decode_auth,
];

/// Fixed header of a buffered frame
struct FrameHeader {
    first_byte: u8,
    header_len: usize,
    remaining_length: usize,
}

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
    /// Protocol version (learned from CONNECT, or set by the caller)
    protocol_version: Option<ProtocolVersion>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = Some(version);
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    #[inline]
    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Decode one packet from a stream buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame,
    /// otherwise the packet and the number of bytes it occupied.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let header = match self.read_header(buf) {
            Ok(h) => h,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total_len = header.header_len + header.remaining_length;
        if buf.len() < total_len {
            return Ok(None);
        }

        let packet = self.decode_body(header.first_byte, &buf[header.header_len..total_len])?;
        Ok(Some((packet, total_len)))
    }

    /// Decode exactly one packet from a buffer that is expected to hold it.
    ///
    /// Unlike [`Decoder::decode`], a declared remaining length larger than the
    /// buffered bytes is an error.
    pub fn read(&mut self, buf: &[u8]) -> Result<(Packet, usize), DecodeError> {
        let header = self.read_header(buf)?;

        let available = buf.len() - header.header_len;
        if header.remaining_length > available {
            return Err(DecodeError::Truncated {
                declared: header.remaining_length,
                available,
            });
        }

        let total_len = header.header_len + header.remaining_length;
        let packet = self.decode_body(header.first_byte, &buf[header.header_len..total_len])?;
        Ok((packet, total_len))
    }

    fn read_header(&self, buf: &[u8]) -> Result<FrameHeader, DecodeError> {
        let Some(&first_byte) = buf.first() else {
            return Err(DecodeError::InsufficientData);
        };

        let (remaining_length, len_bytes) = read_variable_int(&buf[1..])?;
        let remaining_length = remaining_length as usize;

        if remaining_length > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        Ok(FrameHeader {
            first_byte,
            header_len: 1 + len_bytes,
            remaining_length,
        })
    }

    fn decode_body(&mut self, first_byte: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let kind = PacketType::from_nibble(first_byte >> 4);
        let flags = first_byte & 0x0F;

        if kind != PacketType::Publish
            && kind != PacketType::Reserved
            && flags != kind.fixed_flags()
        {
            return Err(DecodeError::InvalidFlags);
        }

        let mut reader = Reader::new(body);
        let packet = BODY_DECODERS[(first_byte >> 4) as usize](self, flags, &mut reader)?;

        if !reader.is_empty() {
            return Err(DecodeError::MalformedPacket("trailing bytes after packet"));
        }
        Ok(packet)
    }

    /// v5 properties block, or an empty set before v5
    fn properties(&self, r: &mut Reader<'_>) -> Result<Properties, DecodeError> {
        if self.is_v5() {
            Properties::decode(r)
        } else {
            Ok(Properties::default())
        }
    }

    fn packet_id(r: &mut Reader<'_>) -> Result<u16, DecodeError> {
        let id = r.u16()?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        Ok(id)
    }

    fn reason_code(byte: u8) -> Result<ReasonCode, DecodeError> {
        ReasonCode::from_u8(byte).ok_or(DecodeError::InvalidReasonCode(byte))
    }

    fn decode_reserved(&mut self, _: u8, _: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        Err(DecodeError::InvalidPacketType(0))
    }

    fn decode_connect(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let protocol_name = r.string()?;
        let level = r.u8()?;

        let protocol_version =
            ProtocolVersion::from_u8(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;
        if protocol_name != protocol_version.protocol_name() {
            return Err(DecodeError::InvalidProtocolName);
        }

        self.protocol_version = Some(protocol_version);

        let connect_flags = r.u8()?;

        // Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_start = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos_bits = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

        // If will flag is 0, will QoS and will retain must be 0
        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        // v3.1.1 forbids a password without a username; v5 allows it
        if !protocol_version.is_v5() && password_flag && !username_flag {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = r.u16()?;
        let properties = self.properties(r)?;
        let client_id = r.string()?.to_string();

        let will = if will_flag {
            let will_properties = self.properties(r)?;
            let topic = r.string()?.to_string();
            let payload = Bytes::copy_from_slice(r.binary()?);
            Some(Will {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(r.string()?.to_string())
        } else {
            None
        };

        let password = if password_flag {
            Some(Bytes::copy_from_slice(r.binary()?))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id,
            clean_start,
            keep_alive,
            username,
            password,
            will,
            properties,
        })))
    }

    fn decode_connack(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let acknowledge_flags = r.u8()?;
        // Only bit 0 is valid (session present)
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let session_present = (acknowledge_flags & 0x01) != 0;
        let code = r.u8()?;

        let (reason_code, properties) = if self.is_v5() {
            let reason_code = Self::reason_code(code)?;
            let properties = if r.is_empty() {
                Properties::default()
            } else {
                Properties::decode(r)?
            };
            (reason_code, properties)
        } else {
            let reason_code = ReasonCode::from_v3_connack_code(code)
                .ok_or(DecodeError::InvalidReasonCode(code))?;
            (reason_code, Properties::default())
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&mut self, flags: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let topic: Arc<str> = Arc::from(r.string()?);

        let packet_id = if qos.requires_ack() {
            Some(Self::packet_id(r)?)
        } else {
            None
        };

        let properties = self.properties(r)?;
        let payload = Bytes::copy_from_slice(r.rest());

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload,
            properties,
        }))
    }

    /// Shared layout of PUBACK, PUBREC, PUBREL and PUBCOMP.
    ///
    /// In v5 the reason code and the properties are each present only when
    /// the remaining length leaves room for them.
    fn pub_response(&self, r: &mut Reader<'_>) -> Result<PubResponse, DecodeError> {
        let mut response = PubResponse::new(Self::packet_id(r)?);

        if self.is_v5() && !r.is_empty() {
            response.reason_code = Self::reason_code(r.u8()?)?;
            if !r.is_empty() {
                response.properties = Properties::decode(r)?;
            }
        }

        Ok(response)
    }

    fn decode_puback(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        Ok(Packet::PubAck(self.pub_response(r)?))
    }

    fn decode_pubrec(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        Ok(Packet::PubRec(self.pub_response(r)?))
    }

    fn decode_pubrel(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        Ok(Packet::PubRel(self.pub_response(r)?))
    }

    fn decode_pubcomp(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        Ok(Packet::PubComp(self.pub_response(r)?))
    }

    fn decode_subscribe(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let properties = self.properties(r)?;

        let mut filters = Vec::new();
        while !r.is_empty() {
            let filter = r.string()?.to_string();
            let options_byte = r.u8()?;

            let options = if self.is_v5() {
                SubscriptionOptions::from_byte(options_byte)
                    .ok_or(DecodeError::InvalidSubscriptionOptions)?
            } else {
                // Only the QoS bits exist before v5; the rest are reserved
                if (options_byte & 0xFC) != 0 {
                    return Err(DecodeError::InvalidSubscriptionOptions);
                }
                let qos = QoS::from_u8(options_byte).ok_or(DecodeError::InvalidQoS(options_byte))?;
                SubscriptionOptions::with_qos(qos)
            };

            filters.push(SubscribeFilter { filter, options });
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must have at least one topic filter",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_suback(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let properties = self.properties(r)?;

        let mut reason_codes = Vec::with_capacity(r.remaining());
        while !r.is_empty() {
            let code = r.u8()?;
            let reason_code = if self.is_v5() {
                Self::reason_code(code)?
            } else {
                ReasonCode::from_v3_suback_code(code).ok_or(DecodeError::InvalidReasonCode(code))?
            };
            reason_codes.push(reason_code);
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsubscribe(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let properties = self.properties(r)?;

        let mut filters = Vec::new();
        while !r.is_empty() {
            filters.push(r.string()?.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must have at least one topic filter",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_unsuback(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let properties = self.properties(r)?;

        // v3.x UNSUBACK has no payload; the trailing-bytes check covers it
        let mut reason_codes = Vec::new();
        if self.is_v5() {
            while !r.is_empty() {
                reason_codes.push(Self::reason_code(r.u8()?)?);
            }
        }

        Ok(Packet::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_pingreq(&mut self, _: u8, _: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        Ok(Packet::PingReq)
    }

    fn decode_pingresp(&mut self, _: u8, _: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        Ok(Packet::PingResp)
    }

    fn decode_disconnect(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let mut disconnect = Disconnect::default();

        if self.is_v5() && !r.is_empty() {
            disconnect.reason_code = Self::reason_code(r.u8()?)?;
            if !r.is_empty() {
                disconnect.properties = Properties::decode(r)?;
            }
        }

        Ok(Packet::Disconnect(disconnect))
    }

    fn decode_auth(&mut self, _: u8, r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        // AUTH is v5.0 only
        if !self.is_v5() {
            return Err(DecodeError::InvalidPacketType(PacketType::Auth as u8));
        }

        let mut auth = Auth::default();
        if !r.is_empty() {
            auth.reason_code = Self::reason_code(r.u8()?)?;
            if !r.is_empty() {
                auth.properties = Properties::decode(r)?;
            }
        }

        Ok(Packet::Auth(auth))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
