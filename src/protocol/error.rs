//! Protocol error taxonomy

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Byte-level failures raised while decoding a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fixed header type nibble is 0
    InvalidPacketType(u8),
    /// Flags nibble does not match the value required for the packet type
    InvalidFlags { packet_type: u8, flags: u8 },
    /// Variable byte integer continued past its fourth byte
    VariableIntTooLong,
    /// Remaining length runs past the bytes the header declared
    Truncated(&'static str),
    /// Packet is larger than the configured maximum
    PacketTooLarge { size: usize, max: usize },
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Property identifier unknown for the negotiated version
    UnknownProperty(u8),
    DuplicateProperty(u8),
    InvalidReasonCode(u8),
    InvalidSubscriptionOptions(u8),
    /// Structurally valid bytes carrying an illegal value
    Malformed(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPacketType(t) => write!(f, "invalid packet type {}", t),
            Self::InvalidFlags { packet_type, flags } => {
                write!(f, "invalid flags {:#x} for packet type {}", flags, packet_type)
            }
            Self::VariableIntTooLong => write!(f, "variable byte integer exceeds four bytes"),
            Self::Truncated(what) => write!(f, "truncated {}", what),
            Self::PacketTooLarge { size, max } => {
                write!(f, "packet of {} bytes exceeds maximum {}", size, max)
            }
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "unsupported protocol level {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid QoS {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::UnknownProperty(id) => write!(f, "unknown property identifier {:#x}", id),
            Self::DuplicateProperty(id) => write!(f, "duplicate property {:#x}", id),
            Self::InvalidReasonCode(code) => write!(f, "invalid reason code {:#x}", code),
            Self::InvalidSubscriptionOptions(b) => {
                write!(f, "invalid subscription options {:#x}", b)
            }
            Self::Malformed(what) => write!(f, "malformed packet: {}", what),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Failures raised while encoding a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Value above 268,435,455 cannot be written as a variable byte integer
    VariableIntOverflow(u64),
    /// String or binary field longer than 65,535 bytes
    FieldTooLong(usize),
    /// QoS>0 PUBLISH or acknowledgement without a packet identifier
    MissingPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VariableIntOverflow(v) => {
                write!(f, "value {} exceeds variable byte integer range", v)
            }
            Self::FieldTooLong(len) => write!(f, "field of {} bytes exceeds 65535", len),
            Self::MissingPacketId => write!(f, "packet identifier required"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// How the owning connection must react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Malformed input. Always closes the connection; never retried.
    ProtocolViolation,
    /// Keep-alive, connect or ack deadline expired
    CommunicationTimeout,
    /// Retry budget or packet identifier space exhausted, or fatal ack reason
    SessionFailure,
    /// Rejected at construction time
    Configuration,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ProtocolViolation => "protocol violation",
            Self::CommunicationTimeout => "communication timeout",
            Self::SessionFailure => "session failure",
            Self::Configuration => "configuration error",
        })
    }
}

/// Where an error was detected
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub connection_id: Option<u64>,
    pub client_id: Option<Arc<str>>,
    /// Offset into the inbound byte stream of the packet being decoded
    pub byte_offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Decode(DecodeError),
    Encode(EncodeError),
    Message(Cow<'static, str>),
}

/// Single error type propagated from the codec and session layers up to
/// the connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    classification: Classification,
    kind: Kind,
    context: ErrorContext,
}

impl ProtocolError {
    pub fn violation(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Classification::ProtocolViolation, msg)
    }

    pub fn timeout(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Classification::CommunicationTimeout, msg)
    }

    pub fn session_failure(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Classification::SessionFailure, msg)
    }

    pub fn configuration(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Classification::Configuration, msg)
    }

    fn new(classification: Classification, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            classification,
            kind: Kind::Message(msg.into()),
            context: ErrorContext::default(),
        }
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn is_protocol_violation(&self) -> bool {
        self.classification == Classification::ProtocolViolation
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// The decode failure underneath, if this error came from the decoder
    pub fn decode_error(&self) -> Option<&DecodeError> {
        match &self.kind {
            Kind::Decode(e) => Some(e),
            _ => None,
        }
    }

    pub fn with_connection(mut self, connection_id: u64) -> Self {
        self.context.connection_id = Some(connection_id);
        self
    }

    pub fn with_client(mut self, client_id: Arc<str>) -> Self {
        self.context.client_id = Some(client_id);
        self
    }

    pub fn at_offset(mut self, offset: u64) -> Self {
        self.context.byte_offset = Some(offset);
        self
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.classification)?;
        match &self.kind {
            Kind::Decode(e) => write!(f, "{}", e)?,
            Kind::Encode(e) => write!(f, "{}", e)?,
            Kind::Message(msg) => f.write_str(msg)?,
        }
        if let Some(id) = self.context.connection_id {
            write!(f, " (connection {}", id)?;
            if let Some(ref client) = self.context.client_id {
                write!(f, ", client {}", client)?;
            }
            if let Some(offset) = self.context.byte_offset {
                write!(f, ", offset {}", offset)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            Kind::Decode(e) => Some(e),
            Kind::Encode(e) => Some(e),
            Kind::Message(_) => None,
        }
    }
}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        Self {
            classification: Classification::ProtocolViolation,
            kind: Kind::Decode(e),
            context: ErrorContext::default(),
        }
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        Self {
            classification: Classification::ProtocolViolation,
            kind: Kind::Encode(e),
            context: ErrorContext::default(),
        }
    }
}
