//! MQTT Packet Encoder
//!
//! Encodes MQTT packets for v3.1, v3.1.1 and v5.0. The fixed header byte is
//! always recomputed from the packet fields (see [`Packet::header_byte`]).

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int};
use crate::protocol::{
    Auth, ConnAck, Connect, Disconnect, EncodeError, Packet, Properties, ProtocolVersion,
    PubResponse, Publish, QoS, ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// MQTT Packet Encoder
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    #[inline]
    fn is_v5(&self) -> bool {
        self.protocol_version.is_v5()
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        self.encode_body(packet, &mut body)?;

        if body.len() > super::MAX_REMAINING_LENGTH {
            return Err(EncodeError::PacketTooLarge);
        }

        buf.reserve(1 + variable_int_len(body.len() as u32) + body.len());
        buf.put_u8(packet.header_byte());
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }

    /// Encode a packet into a fresh buffer
    pub fn to_bytes(&self, packet: &Packet) -> Result<BytesMut, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf)
    }

    fn encode_body(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) | Packet::PubRec(p) | Packet::PubRel(p) | Packet::PubComp(p) => {
                self.encode_pub_response(p, buf)
            }
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => self.encode_unsuback(p, buf),
            Packet::PingReq | Packet::PingResp => Ok(()),
            Packet::Disconnect(p) => self.encode_disconnect(p, buf),
            Packet::Auth(p) => self.encode_auth(p, buf),
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // CONNECT carries its own protocol level
        let is_v5 = packet.protocol_version.is_v5();

        write_string(buf, packet.protocol_version.protocol_name())?;
        buf.put_u8(packet.protocol_version as u8);
        buf.put_u8(packet.flags());
        buf.put_u16(packet.keep_alive);

        if is_v5 {
            packet.properties.encode(buf)?;
        }

        write_string(buf, &packet.client_id)?;

        if let Some(ref will) = packet.will {
            if is_v5 {
                will.properties.encode(buf)?;
            }
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }

        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }

        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(packet.session_present as u8);

        if self.is_v5() {
            buf.put_u8(packet.reason_code as u8);
            packet.properties.encode(buf)?;
        } else {
            buf.put_u8(packet.reason_code.to_v3_connack_code());
        }

        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match (packet.qos, packet.packet_id) {
            (QoS::AtMostOnce, Some(_)) => {
                return Err(EncodeError::InvalidPacket("QoS 0 PUBLISH carries a packet id"))
            }
            (QoS::AtMostOnce, None) if packet.dup => {
                return Err(EncodeError::InvalidPacket("QoS 0 PUBLISH cannot set DUP"))
            }
            (_, Some(0)) => return Err(EncodeError::InvalidPacket("packet id cannot be 0")),
            (QoS::AtLeastOnce | QoS::ExactlyOnce, None) => {
                return Err(EncodeError::InvalidPacket("QoS > 0 PUBLISH needs a packet id"))
            }
            _ => {}
        }

        write_string(buf, &packet.topic)?;

        if let Some(packet_id) = packet.packet_id {
            buf.put_u16(packet_id);
        }

        if self.is_v5() {
            packet.properties.encode(buf)?;
        }

        buf.put_slice(&packet.payload);
        Ok(())
    }

    /// PUBACK, PUBREC, PUBREL, PUBCOMP: in v5 the reason code and properties
    /// are omitted when they carry nothing beyond success.
    fn encode_pub_response(
        &self,
        packet: &PubResponse,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u16(packet.packet_id);

        if self.is_v5() {
            write_reason_and_properties(packet.reason_code, &packet.properties, buf)?;
        }

        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if packet.filters.is_empty() {
            return Err(EncodeError::InvalidPacket("SUBSCRIBE without topic filters"));
        }

        buf.put_u16(packet.packet_id);

        if self.is_v5() {
            packet.properties.encode(buf)?;
        }

        for entry in &packet.filters {
            write_string(buf, &entry.filter)?;
            if self.is_v5() {
                buf.put_u8(entry.options.to_byte());
            } else {
                buf.put_u8(entry.options.qos as u8);
            }
        }

        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(packet.packet_id);

        if self.is_v5() {
            packet.properties.encode(buf)?;
            for code in &packet.reason_codes {
                buf.put_u8(*code as u8);
            }
        } else {
            for code in &packet.reason_codes {
                buf.put_u8(code.to_v3_suback_code());
            }
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if packet.filters.is_empty() {
            return Err(EncodeError::InvalidPacket("UNSUBSCRIBE without topic filters"));
        }

        buf.put_u16(packet.packet_id);

        if self.is_v5() {
            packet.properties.encode(buf)?;
        }

        for filter in &packet.filters {
            write_string(buf, filter)?;
        }

        Ok(())
    }

    fn encode_unsuback(&self, packet: &UnsubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(packet.packet_id);

        // v3.x UNSUBACK has no payload
        if self.is_v5() {
            packet.properties.encode(buf)?;
            for code in &packet.reason_codes {
                buf.put_u8(*code as u8);
            }
        }

        Ok(())
    }

    fn encode_disconnect(
        &self,
        packet: &Disconnect,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        // v3.x DISCONNECT has no payload
        if self.is_v5() {
            write_reason_and_properties(packet.reason_code, &packet.properties, buf)?;
        }
        Ok(())
    }

    fn encode_auth(&self, packet: &Auth, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if !self.is_v5() {
            return Err(EncodeError::UnsupportedPacket("AUTH"));
        }
        write_reason_and_properties(packet.reason_code, &packet.properties, buf)
    }
}

/// Optional trailing reason code + properties (v5 acks, DISCONNECT, AUTH)
fn write_reason_and_properties(
    reason_code: ReasonCode,
    properties: &Properties,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if reason_code == ReasonCode::Success && properties.is_empty() {
        return Ok(());
    }

    buf.put_u8(reason_code as u8);
    if !properties.is_empty() {
        properties.encode(buf)?;
    }
    Ok(())
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V5)
    }
}
