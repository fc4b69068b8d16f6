//! CONNECT handling

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use super::{rand_id, writer, Connection, ConnectionError, Link};
use crate::codec::Encoder;
use crate::broker::dispatcher::{ConnectionEnd, ConnectionHandle, Kick};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, Properties, ProtocolError, ProtocolVersion, QoS,
    ReasonCode,
};
use crate::topic::validate_topic_name;
use crate::transport::Transport;

impl<S: Transport> Connection<S> {
    /// Read and process CONNECT packet
    pub(crate) async fn read_connect(&mut self) -> Result<Link, ConnectionError> {
        loop {
            match self.decoder.decode_buf(&mut self.read_buf) {
                Ok(Some(Packet::Connect(connect))) => return self.handle_connect(*connect).await,
                Ok(Some(other)) => {
                    debug!(packet_type = ?other.packet_type(), "first packet was not CONNECT");
                    return Err(ProtocolError::violation("first packet must be CONNECT")
                        .with_connection(self.id)
                        .into());
                }
                Ok(None) => {}
                Err(e) => {
                    let reason = match (&e, self.decoder.protocol_version()) {
                        (DecodeError::InvalidProtocolVersion(_), _) => {
                            // the client's version is unknown, answer in v3.1.1 framing
                            self.encoder.set_protocol_version(ProtocolVersion::V311);
                            Some(ReasonCode::UnsupportedProtocolVersion)
                        }
                        (DecodeError::PacketTooLarge { .. }, Some(ProtocolVersion::V5)) => {
                            Some(ReasonCode::PacketTooLarge)
                        }
                        (_, Some(ProtocolVersion::V5)) => Some(ReasonCode::MalformedPacket),
                        _ => None,
                    };
                    if let Some(reason) = reason {
                        if reason != ReasonCode::UnsupportedProtocolVersion {
                            self.encoder.set_protocol_version(ProtocolVersion::V5);
                        }
                        let _ = self.write_connack(reason, false, Properties::default()).await;
                    }
                    return Err(ProtocolError::from(e).with_connection(self.id).into());
                }
            }

            if self.reader.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }

    /// Handle CONNECT packet
    async fn handle_connect(&mut self, connect: Connect) -> Result<Link, ConnectionError> {
        let protocol_version = connect.protocol_version;
        self.decoder.set_protocol_version(protocol_version);
        self.encoder.set_protocol_version(protocol_version);

        // a zero-length id is only acceptable for a throwaway session
        if connect.client_id.is_empty() && !connect.clean_start {
            debug!("rejecting empty client id without clean start");
            return Err(self.refuse(ReasonCode::ClientIdNotValid).await);
        }
        if let Some(will) = &connect.will {
            if let Err(e) = validate_topic_name(&will.topic) {
                debug!(topic = %will.topic, "invalid will topic: {}", e);
                return Err(self.refuse(ReasonCode::TopicNameInvalid).await);
            }
        }
        let assigned = connect.client_id.is_empty();
        let client_id: Arc<str> = if assigned {
            format!("hashmq-{:016x}", rand_id()).into()
        } else {
            connect.client_id.as_str().into()
        };
        tracing::Span::current().record("client_id", &*client_id);
        debug!(
            ?protocol_version,
            clean_start = connect.clean_start,
            keep_alive = connect.keep_alive,
            "CONNECT"
        );

        let auth = self
            .dispatcher
            .hooks
            .on_authenticate(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await;
        match auth {
            Ok(true) => self.username = connect.username.clone(),
            Ok(false) => {
                debug!("authentication failed");
                return Err(self.refuse(ReasonCode::NotAuthorized).await);
            }
            Err(e) => {
                error!("authentication error: {}", e);
                return Err(self.refuse(ReasonCode::UnspecifiedError).await);
            }
        }

        let config = self.dispatcher.config();
        let is_takeover = self.dispatcher.is_client_connected(&client_id);
        if !is_takeover && self.dispatcher.connection_count() >= config.max_connections {
            debug!(max = config.max_connections, "connection limit reached");
            return Err(self.refuse(ReasonCode::ServerUnavailable).await);
        }
        if is_takeover && self.dispatcher.kick_and_wait(&client_id, Kick::TakenOver).await {
            debug!("took over previous connection");
        }

        let (session, present) = self.dispatcher.open_session(&client_id, &connect);

        let (kick_tx, kick_rx) = mpsc::channel(4);
        let (closed_tx, closed_rx) = watch::channel(());
        self.dispatcher.register(
            client_id.clone(),
            ConnectionHandle {
                id: self.id,
                addr: self.addr,
                protocol_version,
                username: self.username.clone(),
                connected_at: SystemTime::now(),
                kick: kick_tx,
                closed: closed_rx,
            },
        );

        let properties = self.connack_properties(assigned.then(|| client_id.to_string()));
        if let Err(e) = self.write_connack(ReasonCode::Success, present, properties).await {
            self.dispatcher.unregister(&client_id, self.id);
            self.dispatcher
                .on_client_disconnected(&session, ConnectionEnd::Lost)
                .await;
            return Err(e);
        }
        info!(session_present = present, addr = %self.addr, "client connected");

        self.dispatcher
            .on_client_connected(&session, present, self.username.as_deref())
            .await;
        if present {
            let replayed = session.replay_inflight();
            if replayed > 0 {
                debug!(replayed, "resending unacknowledged messages");
            }
        }

        let Some(io) = self.writer.take() else {
            return Err(ProtocolError::violation("writer already started").into());
        };
        let writer = writer::spawn(io, session.clone(), Encoder::new(protocol_version));

        let keep_alive = (connect.keep_alive > 0)
            .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));

        Ok(Link {
            client_id,
            session,
            protocol_version,
            keep_alive,
            kick_rx,
            writer,
            _closed: closed_tx,
        })
    }

    fn connack_properties(&self, assigned_client_id: Option<String>) -> Properties {
        let mut properties = Properties::default();
        if self.encoder.protocol_version() != ProtocolVersion::V5 {
            return properties;
        }
        let config = self.dispatcher.config();
        properties.assigned_client_identifier = assigned_client_id;
        if config.max_qos < QoS::ExactlyOnce {
            properties.maximum_qos = Some(config.max_qos as u8);
        }
        if !config.retain_available {
            properties.retain_available = Some(0);
        }
        properties.maximum_packet_size = Some(u32::try_from(config.max_packet_size).unwrap_or(u32::MAX));
        properties.shared_subscription_available = Some(0);
        properties
    }

    /// Answer CONNECT with a failure and hand back the error to return
    async fn refuse(&mut self, reason: ReasonCode) -> ConnectionError {
        match self.write_connack(reason, false, Properties::default()).await {
            Ok(()) => ConnectionError::Refused(reason),
            Err(e) => e,
        }
    }

    /// CONNACK goes straight to the socket, ahead of the writer task
    async fn write_connack(
        &mut self,
        reason_code: ReasonCode,
        session_present: bool,
        properties: Properties,
    ) -> Result<(), ConnectionError> {
        let connack = Packet::ConnAck(ConnAck {
            session_present,
            reason_code,
            properties,
        });
        let mut buf = BytesMut::with_capacity(64);
        self.encoder.encode(&connack, &mut buf).map_err(ProtocolError::from)?;
        let Some(io) = self.writer.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        io.write_all(&buf).await?;
        io.flush().await?;
        Ok(())
    }
}
