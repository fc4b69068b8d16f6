//! Reason codes
//!
//! v5 carries these on every acknowledgement. v3.1.1 only has the CONNACK
//! return codes and the SUBACK failure value, mapped at the codec boundary.

use std::fmt;

macro_rules! reason_codes {
    ($($name:ident = $value:literal => $text:literal,)+) => {
        /// One-byte MQTT reason code
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u8)]
        pub enum ReasonCode {
            #[default]
            $($name = $value,)+
        }

        impl ReasonCode {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $($value => Some(Self::$name),)+
                    _ => None,
                }
            }

            fn description(self) -> &'static str {
                match self {
                    $(Self::$name => $text,)+
                }
            }
        }
    };
}

reason_codes! {
    Success = 0x00 => "success",
    GrantedQoS1 = 0x01 => "granted QoS 1",
    GrantedQoS2 = 0x02 => "granted QoS 2",
    DisconnectWithWill = 0x04 => "disconnect with will message",
    NoMatchingSubscribers = 0x10 => "no matching subscribers",
    NoSubscriptionExisted = 0x11 => "no subscription existed",
    ContinueAuthentication = 0x18 => "continue authentication",
    ReAuthenticate = 0x19 => "re-authenticate",
    UnspecifiedError = 0x80 => "unspecified error",
    MalformedPacket = 0x81 => "malformed packet",
    ProtocolError = 0x82 => "protocol error",
    ImplementationError = 0x83 => "implementation specific error",
    UnsupportedProtocolVersion = 0x84 => "unsupported protocol version",
    ClientIdNotValid = 0x85 => "client identifier not valid",
    BadUserNameOrPassword = 0x86 => "bad user name or password",
    NotAuthorized = 0x87 => "not authorized",
    ServerUnavailable = 0x88 => "server unavailable",
    ServerBusy = 0x89 => "server busy",
    Banned = 0x8A => "banned",
    ServerShuttingDown = 0x8B => "server shutting down",
    BadAuthenticationMethod = 0x8C => "bad authentication method",
    KeepAliveTimeout = 0x8D => "keep alive timeout",
    SessionTakenOver = 0x8E => "session taken over",
    TopicFilterInvalid = 0x8F => "topic filter invalid",
    TopicNameInvalid = 0x90 => "topic name invalid",
    PacketIdInUse = 0x91 => "packet identifier in use",
    PacketIdNotFound = 0x92 => "packet identifier not found",
    ReceiveMaxExceeded = 0x93 => "receive maximum exceeded",
    TopicAliasInvalid = 0x94 => "topic alias invalid",
    PacketTooLarge = 0x95 => "packet too large",
    MessageRateTooHigh = 0x96 => "message rate too high",
    QuotaExceeded = 0x97 => "quota exceeded",
    AdministrativeAction = 0x98 => "administrative action",
    PayloadFormatInvalid = 0x99 => "payload format invalid",
    RetainNotSupported = 0x9A => "retain not supported",
    QoSNotSupported = 0x9B => "QoS not supported",
    UseAnotherServer = 0x9C => "use another server",
    ServerMoved = 0x9D => "server moved",
    SharedSubsNotSupported = 0x9E => "shared subscriptions not supported",
    ConnectionRateExceeded = 0x9F => "connection rate exceeded",
    MaximumConnectTime = 0xA0 => "maximum connect time",
    SubIdNotSupported = 0xA1 => "subscription identifiers not supported",
    WildcardSubsNotSupported = 0xA2 => "wildcard subscriptions not supported",
}

impl ReasonCode {
    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    #[inline]
    pub fn is_error(self) -> bool {
        !self.is_success()
    }

    /// Granted-QoS reason code for a SUBACK entry
    pub fn granted(qos: super::QoS) -> Self {
        match qos {
            super::QoS::AtMostOnce => Self::Success,
            super::QoS::AtLeastOnce => Self::GrantedQoS1,
            super::QoS::ExactlyOnce => Self::GrantedQoS2,
        }
    }

    /// v3.1.1 CONNACK return code. Errors without a v3 equivalent map to 5.
    pub fn to_v3_connack_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::UnsupportedProtocolVersion => 1,
            Self::ClientIdNotValid => 2,
            Self::ServerUnavailable | Self::ServerBusy | Self::ServerShuttingDown => 3,
            Self::BadUserNameOrPassword => 4,
            _ => 5,
        }
    }

    pub fn from_v3_connack_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::UnsupportedProtocolVersion,
            2 => Self::ClientIdNotValid,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => return None,
        })
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.description(), *self as u8)
    }
}
