//! Connection teardown
//!
//! Every way a connection can end funnels into [`Connection::finish`],
//! which says goodbye (v5 only), stops the writer and hands the session
//! back to the dispatcher.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Connection, ConnectionError, Link};
use crate::broker::dispatcher::{ConnectionEnd, Kick};
use crate::protocol::{
    Classification, DecodeError, Disconnect, Packet, ProtocolError, ProtocolVersion, ReasonCode,
};
use crate::transport::Transport;

/// Time the writer gets to flush a server DISCONNECT
const GOODBYE_GRACE: Duration = Duration::from_secs(1);

/// Why the read loop stopped
#[derive(Debug)]
pub(crate) enum Ending {
    /// The client sent DISCONNECT
    Client(ReasonCode),
    /// The peer closed the transport
    Closed,
    Io(std::io::Error),
    Error(ProtocolError),
    KeepAliveTimeout,
    Kicked(Kick),
    /// A publish was refused in a way that closes the connection
    Policy(ReasonCode),
    WriterClosed,
    Shutdown,
}

impl Ending {
    /// Reason code of the DISCONNECT the server sends, if any
    fn server_reason(&self) -> Option<ReasonCode> {
        match self {
            Ending::Client(_) | Ending::Closed | Ending::Io(_) | Ending::WriterClosed => None,
            Ending::Error(e) => Some(match (e.classification(), e.decode_error()) {
                (_, Some(DecodeError::PacketTooLarge { .. })) => ReasonCode::PacketTooLarge,
                (_, Some(_)) => ReasonCode::MalformedPacket,
                (Classification::ProtocolViolation, None) => ReasonCode::ProtocolError,
                (Classification::CommunicationTimeout, None) => ReasonCode::KeepAliveTimeout,
                _ => ReasonCode::UnspecifiedError,
            }),
            Ending::KeepAliveTimeout => Some(ReasonCode::KeepAliveTimeout),
            Ending::Kicked(kick) => Some(kick.reason_code()),
            Ending::Policy(reason) => Some(*reason),
            Ending::Shutdown => Some(ReasonCode::ServerShuttingDown),
        }
    }

    fn connection_end(&self) -> ConnectionEnd {
        match self {
            Ending::Client(ReasonCode::Success) => ConnectionEnd::Normal,
            Ending::Client(ReasonCode::DisconnectWithWill) => ConnectionEnd::NormalWithWill,
            Ending::Error(e) if e.classification() == Classification::SessionFailure => {
                ConnectionEnd::Failed
            }
            Ending::Kicked(Kick::SessionFailed) => ConnectionEnd::Failed,
            _ => ConnectionEnd::Lost,
        }
    }
}

impl<S: Transport> Connection<S> {
    /// DISCONNECT from the client. A v5 client may shorten or extend the
    /// session expiry here, but never raise it from zero.
    pub(crate) fn handle_client_disconnect(
        &mut self,
        link: &Link,
        disconnect: Disconnect,
    ) -> Result<Option<Ending>, ProtocolError> {
        debug!(reason = %disconnect.reason_code, "DISCONNECT from client");
        if let Some(expiry) = disconnect.properties.session_expiry_interval {
            let mut state = link.session.state_mut();
            if state.expiry_interval == 0 && expiry != 0 {
                return Err(ProtocolError::violation(
                    "session expiry set on DISCONNECT after connecting with zero",
                ));
            }
            state.expiry_interval = expiry;
        }
        Ok(Some(Ending::Client(disconnect.reason_code)))
    }

    /// Tear the connection down and release its session
    pub(crate) async fn finish(self, link: Link, ending: Ending) -> Result<(), ConnectionError> {
        let reason = ending
            .server_reason()
            .filter(|_| link.protocol_version == ProtocolVersion::V5);
        let end = ending.connection_end();

        match &ending {
            Ending::Client(_) | Ending::Closed | Ending::Shutdown => {
                debug!(?ending, "connection ending")
            }
            Ending::Kicked(kick) => info!(?kick, "connection closed by broker"),
            _ => warn!(?ending, "connection closed"),
        }

        let Link {
            client_id,
            session,
            writer,
            _closed,
            ..
        } = link;

        match reason {
            Some(reason) => {
                session.enqueue_control(Packet::Disconnect(Disconnect::new(reason)));
                writer.close(true, GOODBYE_GRACE).await;
            }
            None => writer.close(false, GOODBYE_GRACE).await,
        }

        self.dispatcher.unregister(&client_id, self.id);
        self.dispatcher.on_client_disconnected(&session, end).await;
        drop(_closed);

        match ending {
            Ending::Client(_) | Ending::Closed | Ending::Kicked(_) | Ending::Shutdown => Ok(()),
            Ending::Io(e) => Err(ConnectionError::Io(e)),
            Ending::Error(e) => Err(ConnectionError::Protocol(
                e.with_connection(self.id).with_client(client_id),
            )),
            Ending::KeepAliveTimeout => Err(ConnectionError::Timeout),
            Ending::Policy(reason) => Err(ConnectionError::Refused(reason)),
            Ending::WriterClosed => Err(ConnectionError::Closed),
        }
    }
}
