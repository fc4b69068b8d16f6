//! Packet encoder

use bytes::{BufMut, Bytes, BytesMut};

use super::{put_binary, put_string, write_variable_int, MAX_VARIABLE_INT};
use crate::protocol::{
    Ack, ConnAck, Connect, EncodeError, Packet, PacketType, Properties, ProtocolVersion, Publish,
    ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// Encodes packets for one negotiated protocol version.
///
/// Each packet body is built in a scratch buffer first so the remaining
/// length is known before the fixed header is written.
#[derive(Debug)]
pub struct Encoder {
    protocol_version: ProtocolVersion,
    scratch: BytesMut,
}

impl Encoder {
    pub fn new(protocol_version: ProtocolVersion) -> Self {
        Self {
            protocol_version,
            scratch: BytesMut::with_capacity(256),
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Append the encoded packet to `buf`
    pub fn encode(&mut self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = std::mem::take(&mut self.scratch);
        body.clear();
        let result = self.encode_into(packet, &mut body, buf);
        self.scratch = body;
        result
    }

    /// Encode into a fresh buffer
    pub fn encode_to_bytes(&mut self, packet: &Packet) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_into(
        &self,
        packet: &Packet,
        body: &mut BytesMut,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let flags = match packet {
            Packet::Connect(connect) => {
                self.connect(connect, body)?;
                0
            }
            Packet::ConnAck(connack) => {
                self.connack(connack, body)?;
                0
            }
            Packet::Publish(publish) => self.publish(publish, body)?,
            Packet::PubAck(ack) | Packet::PubRec(ack) | Packet::PubComp(ack) => {
                self.ack(ack, body)?;
                0
            }
            Packet::PubRel(ack) => {
                self.ack(ack, body)?;
                0x02
            }
            Packet::Subscribe(subscribe) => {
                self.subscribe(subscribe, body)?;
                0x02
            }
            Packet::SubAck(suback) => {
                self.suback(suback, body)?;
                0
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.unsubscribe(unsubscribe, body)?;
                0x02
            }
            Packet::UnsubAck(unsuback) => {
                self.unsuback(unsuback, body)?;
                0
            }
            Packet::PingReq | Packet::PingResp => 0,
            Packet::Disconnect(disconnect) => {
                self.trailing_reason(disconnect.reason_code, &disconnect.properties, body)?;
                0
            }
            Packet::Auth(auth) => {
                self.trailing_reason(auth.reason_code, &auth.properties, body)?;
                0
            }
        };

        let remaining = body.len() as u64;
        if remaining > u64::from(MAX_VARIABLE_INT) {
            return Err(EncodeError::VariableIntOverflow(remaining));
        }
        let packet_type: PacketType = packet.packet_type();
        buf.reserve(body.len() + 5);
        buf.put_u8(((packet_type as u8) << 4) | flags);
        write_variable_int(buf, remaining as u32)?;
        buf.extend_from_slice(body);
        Ok(())
    }

    fn properties(&self, props: &Properties, body: &mut BytesMut) -> Result<(), EncodeError> {
        if self.is_v5() {
            props.encode(body)?;
        }
        Ok(())
    }

    fn connect(&self, connect: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
        put_string(body, "MQTT")?;
        body.put_u8(connect.protocol_version as u8);

        let mut flags = 0u8;
        if connect.clean_start {
            flags |= 0x02;
        }
        if let Some(ref will) = connect.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if connect.password.is_some() {
            flags |= 0x40;
        }
        if connect.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(connect.keep_alive);
        self.properties(&connect.properties, body)?;
        put_string(body, &connect.client_id)?;

        if let Some(ref will) = connect.will {
            self.properties(&will.properties, body)?;
            put_string(body, &will.topic)?;
            put_binary(body, &will.payload)?;
        }
        if let Some(ref username) = connect.username {
            put_string(body, username)?;
        }
        if let Some(ref password) = connect.password {
            put_binary(body, password)?;
        }
        Ok(())
    }

    fn connack(&self, connack: &ConnAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u8(u8::from(connack.session_present));
        if self.is_v5() {
            body.put_u8(connack.reason_code as u8);
        } else {
            body.put_u8(connack.reason_code.to_v3_connack_code());
        }
        self.properties(&connack.properties, body)
    }

    /// Returns the fixed header flags
    fn publish(&self, publish: &Publish, body: &mut BytesMut) -> Result<u8, EncodeError> {
        put_string(body, &publish.topic)?;
        if publish.qos.needs_packet_id() {
            let id = publish.packet_id.ok_or(EncodeError::MissingPacketId)?;
            body.put_u16(id);
        }
        self.properties(&publish.properties, body)?;
        body.extend_from_slice(&publish.payload);

        let mut flags = (publish.qos as u8) << 1;
        if publish.dup {
            flags |= 0x08;
        }
        if publish.retain {
            flags |= 0x01;
        }
        Ok(flags)
    }

    /// v5 drops the reason code and properties when they carry nothing
    fn ack(&self, ack: &Ack, body: &mut BytesMut) -> Result<(), EncodeError> {
        if ack.packet_id == 0 {
            return Err(EncodeError::MissingPacketId);
        }
        body.put_u16(ack.packet_id);
        if self.is_v5() {
            if ack.properties.is_empty() {
                if ack.reason_code != ReasonCode::Success {
                    body.put_u8(ack.reason_code as u8);
                }
            } else {
                body.put_u8(ack.reason_code as u8);
                ack.properties.encode(body)?;
            }
        }
        Ok(())
    }

    fn trailing_reason(
        &self,
        reason_code: ReasonCode,
        properties: &Properties,
        body: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if !self.is_v5() {
            return Ok(());
        }
        if reason_code != ReasonCode::Success || !properties.is_empty() {
            body.put_u8(reason_code as u8);
            if !properties.is_empty() {
                properties.encode(body)?;
            }
        }
        Ok(())
    }

    fn subscribe(&self, subscribe: &Subscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(subscribe.packet_id);
        self.properties(&subscribe.properties, body)?;
        for sub in &subscribe.subscriptions {
            put_string(body, &sub.filter)?;
            let options = if self.is_v5() {
                sub.options.to_byte()
            } else {
                sub.options.qos as u8
            };
            body.put_u8(options);
        }
        Ok(())
    }

    fn suback(&self, suback: &SubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(suback.packet_id);
        self.properties(&suback.properties, body)?;
        for code in &suback.reason_codes {
            let byte = match (self.is_v5(), *code) {
                (true, code) => code as u8,
                (false, code) if code.is_error() => 0x80,
                (false, code) => code as u8,
            };
            body.put_u8(byte);
        }
        Ok(())
    }

    fn unsubscribe(&self, unsubscribe: &Unsubscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(unsubscribe.packet_id);
        self.properties(&unsubscribe.properties, body)?;
        for filter in &unsubscribe.filters {
            put_string(body, filter)?;
        }
        Ok(())
    }

    fn unsuback(&self, unsuback: &UnsubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(unsuback.packet_id);
        if self.is_v5() {
            unsuback.properties.encode(body)?;
            body.extend(unsuback.reason_codes.iter().map(|c| *c as u8));
        }
        Ok(())
    }
}
