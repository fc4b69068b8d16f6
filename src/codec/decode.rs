//! Streaming packet decoder

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use super::{read_variable_int, Reader, MAX_VARIABLE_INT};
use crate::protocol::{
    Ack, Auth, ConnAck, Connect, DecodeError, Disconnect, Packet, PacketType, Properties,
    ProtocolVersion, Publish, QoS, ReasonCode, SubAck, Subscribe, Subscription,
    SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

/// Packet decoder for one connection.
///
/// The only state is the negotiated protocol version, learned from CONNECT
/// (or set explicitly by a client-side user). Until then, packets are decoded
/// with v3.1.1 rules.
#[derive(Debug, Clone)]
pub struct Decoder {
    max_packet_size: usize,
    protocol_version: Option<ProtocolVersion>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_VARIABLE_INT as usize + 5,
            protocol_version: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
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

    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Try to decode one packet from the front of `buf`.
    ///
    /// `Ok(None)` means the bytes end before the packet does; nothing is
    /// consumed and the caller retries once more bytes arrive. On success the
    /// packet and its total encoded length are returned.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let Some((remaining, len_bytes)) = read_variable_int(&buf[1..])? else {
            return Ok(None);
        };

        let total = 1 + len_bytes + remaining as usize;
        if total > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }
        if buf.len() < total {
            return Ok(None);
        }

        let packet = self.decode_body(first, &buf[1 + len_bytes..total])?;
        Ok(Some((packet, total)))
    }

    /// Like [`decode`](Self::decode), but advances `buf` past the packet on
    /// success and leaves it untouched otherwise.
    pub fn decode_buf(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        match self.decode(buf)? {
            Some((packet, consumed)) => {
                buf.advance(consumed);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    fn decode_body(&mut self, first: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let type_bits = first >> 4;
        let flags = first & 0x0F;
        let packet_type =
            PacketType::from_u8(type_bits).ok_or(DecodeError::InvalidPacketType(type_bits))?;

        if let Some(required) = packet_type.required_flags() {
            if flags != required {
                return Err(DecodeError::InvalidFlags {
                    packet_type: type_bits,
                    flags,
                });
            }
        }

        let mut r = Reader::new(body);
        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Box::new(self.connect(&mut r)?)),
            PacketType::ConnAck => Packet::ConnAck(self.connack(&mut r)?),
            PacketType::Publish => Packet::Publish(self.publish(flags, &mut r)?),
            PacketType::PubAck => Packet::PubAck(self.ack(&mut r)?),
            PacketType::PubRec => Packet::PubRec(self.ack(&mut r)?),
            PacketType::PubRel => Packet::PubRel(self.ack(&mut r)?),
            PacketType::PubComp => Packet::PubComp(self.ack(&mut r)?),
            PacketType::Subscribe => Packet::Subscribe(self.subscribe(&mut r)?),
            PacketType::SubAck => Packet::SubAck(self.suback(&mut r)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(self.unsubscribe(&mut r)?),
            PacketType::UnsubAck => Packet::UnsubAck(self.unsuback(&mut r)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect(self.disconnect(&mut r)?),
            PacketType::Auth => {
                if !self.is_v5() {
                    return Err(DecodeError::InvalidPacketType(type_bits));
                }
                let (reason_code, properties) = self.reason_and_properties(&mut r)?;
                Packet::Auth(Auth {
                    reason_code,
                    properties,
                })
            }
        };

        if !r.is_empty() {
            return Err(DecodeError::Malformed("trailing bytes after packet body"));
        }
        Ok(packet)
    }

    fn properties(&self, r: &mut Reader<'_>) -> Result<Properties, DecodeError> {
        if self.is_v5() {
            Properties::decode(r)
        } else {
            Ok(Properties::default())
        }
    }

    fn packet_id(r: &mut Reader<'_>) -> Result<u16, DecodeError> {
        match r.u16("packet identifier")? {
            0 => Err(DecodeError::Malformed("packet identifier 0")),
            id => Ok(id),
        }
    }

    fn reason_code(r: &mut Reader<'_>) -> Result<ReasonCode, DecodeError> {
        let byte = r.u8("reason code")?;
        ReasonCode::from_u8(byte).ok_or(DecodeError::InvalidReasonCode(byte))
    }

    /// Optional trailing reason code and properties (v5 DISCONNECT and AUTH)
    fn reason_and_properties(
        &self,
        r: &mut Reader<'_>,
    ) -> Result<(ReasonCode, Properties), DecodeError> {
        if !self.is_v5() || r.is_empty() {
            return Ok((ReasonCode::Success, Properties::default()));
        }
        let reason_code = Self::reason_code(r)?;
        let properties = if r.is_empty() {
            Properties::default()
        } else {
            Properties::decode(r)?
        };
        Ok((reason_code, properties))
    }

    fn connect(&mut self, r: &mut Reader<'_>) -> Result<Connect, DecodeError> {
        let name = r.string("protocol name")?;
        let level = r.u8("protocol level")?;
        let protocol_version = match (name.as_str(), level) {
            ("MQTT", _) => ProtocolVersion::from_u8(level)
                .ok_or(DecodeError::InvalidProtocolVersion(level))?,
            _ => return Err(DecodeError::InvalidProtocolName),
        };
        self.protocol_version = Some(protocol_version);

        let flags = r.u8("connect flags")?;
        if flags & 0x01 != 0 {
            return Err(DecodeError::Malformed("reserved connect flag set"));
        }
        let clean_start = flags & 0x02 != 0;
        let will_flag = flags & 0x04 != 0;
        let will_qos_bits = (flags >> 3) & 0x03;
        let will_retain = flags & 0x20 != 0;
        let has_password = flags & 0x40 != 0;
        let has_username = flags & 0x80 != 0;

        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;
        if !will_flag && (will_qos_bits != 0 || will_retain) {
            return Err(DecodeError::Malformed("will QoS or retain without will flag"));
        }
        if protocol_version == ProtocolVersion::V311 && has_password && !has_username {
            return Err(DecodeError::Malformed("password flag without username flag"));
        }

        let keep_alive = r.u16("keep alive")?;
        let properties = self.properties(r)?;
        let client_id = r.string("client identifier")?;

        let will = if will_flag {
            let properties = self.properties(r)?;
            Some(Will {
                topic: r.string("will topic")?,
                payload: r.binary("will payload")?,
                qos: will_qos,
                retain: will_retain,
                properties,
            })
        } else {
            None
        };

        let username = if has_username {
            Some(r.string("username")?)
        } else {
            None
        };
        let password = if has_password {
            Some(r.binary("password")?)
        } else {
            None
        };

        Ok(Connect {
            protocol_version,
            client_id,
            clean_start,
            keep_alive,
            username,
            password,
            will,
            properties,
        })
    }

    fn connack(&self, r: &mut Reader<'_>) -> Result<ConnAck, DecodeError> {
        let ack_flags = r.u8("connack flags")?;
        if ack_flags & 0xFE != 0 {
            return Err(DecodeError::Malformed("reserved connack flags set"));
        }
        let code = r.u8("connack reason")?;
        let reason_code = if self.is_v5() {
            ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
        } else {
            ReasonCode::from_v3_connack_code(code).ok_or(DecodeError::InvalidReasonCode(code))?
        };
        let properties = self.properties(r)?;
        Ok(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
            properties,
        })
    }

    fn publish(&self, flags: u8, r: &mut Reader<'_>) -> Result<Publish, DecodeError> {
        let dup = flags & 0x08 != 0;
        let retain = flags & 0x01 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::Malformed("DUP set on QoS 0 publish"));
        }

        let topic = r.string("topic name")?;
        if topic.contains(['+', '#']) {
            return Err(DecodeError::Malformed("wildcard in topic name"));
        }
        let packet_id = if qos.needs_packet_id() {
            Some(Self::packet_id(r)?)
        } else {
            None
        };
        let properties = self.properties(r)?;
        if topic.is_empty() && properties.topic_alias.is_none() {
            return Err(DecodeError::Malformed("empty topic name"));
        }

        Ok(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(r.rest()),
            properties,
        })
    }

    /// PUBACK / PUBREC / PUBREL / PUBCOMP. v5 may shorten the body to just
    /// the packet id (success) or id + reason code (no properties).
    fn ack(&self, r: &mut Reader<'_>) -> Result<Ack, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let (reason_code, properties) = self.reason_and_properties(r)?;
        Ok(Ack {
            packet_id,
            reason_code,
            properties,
        })
    }

    fn subscribe(&self, r: &mut Reader<'_>) -> Result<Subscribe, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let properties = self.properties(r)?;

        let mut subscriptions = Vec::new();
        while !r.is_empty() {
            let filter = r.string("topic filter")?;
            let byte = r.u8("subscription options")?;
            if !self.is_v5() && byte & 0xFC != 0 {
                return Err(DecodeError::InvalidSubscriptionOptions(byte));
            }
            let options = SubscriptionOptions::from_byte(byte)
                .ok_or(DecodeError::InvalidSubscriptionOptions(byte))?;
            subscriptions.push(Subscription { filter, options });
        }
        if subscriptions.is_empty() {
            return Err(DecodeError::Malformed("subscribe without topic filters"));
        }

        Ok(Subscribe {
            packet_id,
            subscriptions,
            properties,
        })
    }

    fn suback(&self, r: &mut Reader<'_>) -> Result<SubAck, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let properties = self.properties(r)?;
        let mut reason_codes = Vec::with_capacity(r.remaining());
        for &byte in r.rest() {
            let code = match (self.is_v5(), byte) {
                (true, _) => ReasonCode::from_u8(byte),
                (false, 0..=2) => ReasonCode::from_u8(byte),
                (false, 0x80) => Some(ReasonCode::UnspecifiedError),
                (false, _) => None,
            };
            reason_codes.push(code.ok_or(DecodeError::InvalidReasonCode(byte))?);
        }
        Ok(SubAck {
            packet_id,
            reason_codes,
            properties,
        })
    }

    fn unsubscribe(&self, r: &mut Reader<'_>) -> Result<Unsubscribe, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let properties = self.properties(r)?;
        let mut filters = Vec::new();
        while !r.is_empty() {
            filters.push(r.string("topic filter")?);
        }
        if filters.is_empty() {
            return Err(DecodeError::Malformed("unsubscribe without topic filters"));
        }
        Ok(Unsubscribe {
            packet_id,
            filters,
            properties,
        })
    }

    fn unsuback(&self, r: &mut Reader<'_>) -> Result<UnsubAck, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let properties = self.properties(r)?;
        let mut reason_codes = Vec::new();
        if self.is_v5() {
            while !r.is_empty() {
                reason_codes.push(Self::reason_code(r)?);
            }
        }
        Ok(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        })
    }

    fn disconnect(&self, r: &mut Reader<'_>) -> Result<Disconnect, DecodeError> {
        let (reason_code, properties) = self.reason_and_properties(r)?;
        Ok(Disconnect {
            reason_code,
            properties,
        })
    }
}
