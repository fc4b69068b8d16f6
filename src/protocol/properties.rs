//! MQTT 5 property lists
//!
//! A property list is a variable byte integer length followed by
//! `(identifier, value)` pairs. The identifier implies the value type, so an
//! identifier this table does not know is a protocol violation.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{put_binary, put_string, write_variable_int, Reader};
use crate::protocol::{DecodeError, EncodeError};

/// Scalar property value types
trait PropertyValue: Sized {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError>;
    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;
}

impl PropertyValue for u8 {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.u8("byte property")
    }
    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(*self);
        Ok(())
    }
}

impl PropertyValue for u16 {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.u16("two byte property")
    }
    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(*self);
        Ok(())
    }
}

impl PropertyValue for u32 {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.u32("four byte property")
    }
    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u32(*self);
        Ok(())
    }
}

impl PropertyValue for String {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.string("string property")
    }
    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_string(buf, self)
    }
}

impl PropertyValue for Bytes {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.binary("binary property")
    }
    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_binary(buf, self)
    }
}

const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
const USER_PROPERTY: u8 = 0x26;

macro_rules! properties {
    ($($field:ident: $ty:ty = $id:literal as $variant:ident,)+) => {
        /// Property identifiers known to MQTT 5.0
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum PropertyId {
            $($variant = $id,)+
            SubscriptionIdentifier = SUBSCRIPTION_IDENTIFIER,
            UserProperty = USER_PROPERTY,
        }

        impl PropertyId {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $($id => Some(Self::$variant),)+
                    SUBSCRIPTION_IDENTIFIER => Some(Self::SubscriptionIdentifier),
                    USER_PROPERTY => Some(Self::UserProperty),
                    _ => None,
                }
            }
        }

        /// Decoded property list. Absent properties are `None`/empty.
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct Properties {
            $(pub $field: Option<$ty>,)+
            /// May repeat on PUBLISH delivered to a subscriber
            pub subscription_identifiers: Vec<u32>,
            /// May repeat; order is preserved
            pub user_properties: Vec<(String, String)>,
        }

        impl Properties {
            pub fn is_empty(&self) -> bool {
                $(self.$field.is_none() &&)+
                    self.subscription_identifiers.is_empty()
                    && self.user_properties.is_empty()
            }

            fn read_one(&mut self, id: u8, r: &mut Reader<'_>) -> Result<(), DecodeError> {
                match id {
                    $($id => {
                        let value = <$ty as PropertyValue>::read(r)?;
                        if self.$field.replace(value).is_some() {
                            return Err(DecodeError::DuplicateProperty(id));
                        }
                    })+
                    SUBSCRIPTION_IDENTIFIER => {
                        let value = r.variable_int("subscription identifier")?;
                        if value == 0 {
                            return Err(DecodeError::Malformed("subscription identifier 0"));
                        }
                        self.subscription_identifiers.push(value);
                    }
                    USER_PROPERTY => {
                        let key = r.string("user property")?;
                        let value = r.string("user property")?;
                        self.user_properties.push((key, value));
                    }
                    other => return Err(DecodeError::UnknownProperty(other)),
                }
                Ok(())
            }

            fn write_entries(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
                $(if let Some(ref value) = self.$field {
                    buf.put_u8($id);
                    value.write(buf)?;
                })+
                for id in &self.subscription_identifiers {
                    buf.put_u8(SUBSCRIPTION_IDENTIFIER);
                    write_variable_int(buf, *id)?;
                }
                for (key, value) in &self.user_properties {
                    buf.put_u8(USER_PROPERTY);
                    put_string(buf, key)?;
                    put_string(buf, value)?;
                }
                Ok(())
            }
        }
    };
}

properties! {
    payload_format_indicator: u8 = 0x01 as PayloadFormatIndicator,
    message_expiry_interval: u32 = 0x02 as MessageExpiryInterval,
    content_type: String = 0x03 as ContentType,
    response_topic: String = 0x08 as ResponseTopic,
    correlation_data: Bytes = 0x09 as CorrelationData,
    session_expiry_interval: u32 = 0x11 as SessionExpiryInterval,
    assigned_client_identifier: String = 0x12 as AssignedClientIdentifier,
    server_keep_alive: u16 = 0x13 as ServerKeepAlive,
    authentication_method: String = 0x15 as AuthenticationMethod,
    authentication_data: Bytes = 0x16 as AuthenticationData,
    request_problem_information: u8 = 0x17 as RequestProblemInformation,
    will_delay_interval: u32 = 0x18 as WillDelayInterval,
    request_response_information: u8 = 0x19 as RequestResponseInformation,
    response_information: String = 0x1A as ResponseInformation,
    server_reference: String = 0x1C as ServerReference,
    reason_string: String = 0x1F as ReasonString,
    receive_maximum: u16 = 0x21 as ReceiveMaximum,
    topic_alias_maximum: u16 = 0x22 as TopicAliasMaximum,
    topic_alias: u16 = 0x23 as TopicAlias,
    maximum_qos: u8 = 0x24 as MaximumQoS,
    retain_available: u8 = 0x25 as RetainAvailable,
    maximum_packet_size: u32 = 0x27 as MaximumPacketSize,
    wildcard_subscription_available: u8 = 0x28 as WildcardSubscriptionAvailable,
    subscription_identifier_available: u8 = 0x29 as SubscriptionIdentifierAvailable,
    shared_subscription_available: u8 = 0x2A as SharedSubscriptionAvailable,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a length-prefixed property list
    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = r.variable_int("property length")? as usize;
        let mut body = r.sub(len, "property list")?;
        let mut props = Self::default();
        while !body.is_empty() {
            let id = body.u8("property identifier")?;
            props.read_one(id, &mut body)?;
        }
        props.validate()?;
        Ok(props)
    }

    /// Values whose type allows them but whose meaning forbids them
    fn validate(&self) -> Result<(), DecodeError> {
        let flags = [
            self.payload_format_indicator,
            self.request_problem_information,
            self.request_response_information,
            self.retain_available,
            self.wildcard_subscription_available,
            self.subscription_identifier_available,
            self.shared_subscription_available,
        ];
        if flags.iter().flatten().any(|&v| v > 1) {
            return Err(DecodeError::Malformed("boolean property above 1"));
        }
        if self.maximum_qos.is_some_and(|q| q > 1) {
            return Err(DecodeError::Malformed("maximum QoS above 1"));
        }
        if self.receive_maximum == Some(0) {
            return Err(DecodeError::Malformed("receive maximum 0"));
        }
        if self.topic_alias == Some(0) {
            return Err(DecodeError::Malformed("topic alias 0"));
        }
        if self.maximum_packet_size == Some(0) {
            return Err(DecodeError::Malformed("maximum packet size 0"));
        }
        Ok(())
    }

    /// Write the length prefix followed by every present property
    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if self.is_empty() {
            buf.put_u8(0);
            return Ok(());
        }
        let mut body = BytesMut::with_capacity(64);
        self.write_entries(&mut body)?;
        write_variable_int(buf, body.len() as u32)?;
        buf.extend_from_slice(&body);
        Ok(())
    }
}
