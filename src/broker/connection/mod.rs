//! MQTT Connection Handler
//!
//! One task per transport. The reader half lives here and drives the
//! protocol state machine; the writer half runs in its own task and drains
//! the session's packet bus (see [`writer`]). Everything that touches more
//! than this session goes through the [`Dispatcher`].

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;
mod writer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout};
use tracing::{debug, trace};

use super::dispatcher::{Dispatcher, Kick};
use super::stopped;
use crate::codec::{Decoder, Encoder};
use crate::protocol::{Packet, ProtocolError, ProtocolVersion, ReasonCode};
use crate::session::Session;
use crate::transport::Transport;

pub(crate) use disconnect::Ending;

const READ_BUF_CAPACITY: usize = 8 * 1024;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    /// CONNECT or keep-alive deadline missed
    Timeout,
    /// CONNECT answered with a failure CONNACK
    Refused(ReasonCode),
    /// Peer closed the transport before CONNECT completed
    Closed,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "{}", e),
            ConnectionError::Timeout => write!(f, "connection timeout"),
            ConnectionError::Refused(code) => write!(f, "connection refused: {}", code),
            ConnectionError::Closed => write!(f, "connection closed by peer"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<crate::protocol::DecodeError> for ConnectionError {
    fn from(e: crate::protocol::DecodeError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

/// Everything a connection owns once CONNECT was accepted
pub(crate) struct Link {
    pub(crate) client_id: Arc<str>,
    pub(crate) session: Arc<Session>,
    pub(crate) protocol_version: ProtocolVersion,
    /// 1.5x the client's keep-alive; `None` when disabled
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) kick_rx: mpsc::Receiver<Kick>,
    pub(crate) writer: writer::WriterHandle,
    /// Dropped once teardown is complete, releasing a pending takeover
    pub(crate) _closed: watch::Sender<()>,
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    pub(crate) id: u64,
    pub(crate) addr: SocketAddr,
    pub(crate) reader: ReadHalf<S>,
    /// Taken by the writer task once CONNACK is on the wire
    pub(crate) writer: Option<WriteHalf<S>>,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) username: Option<String>,
}

impl<S: Transport> Connection<S> {
    pub fn new(
        stream: S,
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id: dispatcher.next_connection_id(),
            addr,
            reader,
            writer: Some(writer),
            decoder: Decoder::new().with_max_packet_size(dispatcher.config().max_packet_size),
            encoder: Encoder::new(ProtocolVersion::V311),
            read_buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            dispatcher,
            shutdown,
            username: None,
        }
    }

    /// Run the connection handler
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.dispatcher.config().connect_timeout;
        let link = match timeout(connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        };
        self.run_connected(link).await
    }

    /// Read packets until something ends the connection, then tear down
    async fn run_connected(mut self, mut link: Link) -> Result<(), ConnectionError> {
        let config = self.dispatcher.config().clone();
        let retry_enabled = !config.ack_timeout.is_zero();
        let mut retry_ticker = tokio::time::interval(config.retry_interval());
        retry_ticker.tick().await;

        let mut keep_alive_deadline = link
            .keep_alive
            .map(|period| tokio::time::Instant::now() + period);

        let ending = loop {
            let keep_alive_expired = async move {
                match keep_alive_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = self.reader.read_buf(&mut self.read_buf) => match result {
                    Ok(0) => break Ending::Closed,
                    Ok(_) => {
                        keep_alive_deadline = link
                            .keep_alive
                            .map(|period| tokio::time::Instant::now() + period);
                        match self.process_buffer(&link).await {
                            Ok(None) => {}
                            Ok(Some(ending)) => break ending,
                            Err(e) => break Ending::Error(e),
                        }
                    }
                    Err(e) => break Ending::Io(e),
                },
                kick = link.kick_rx.recv() => {
                    break Ending::Kicked(kick.unwrap_or(Kick::TakenOver));
                }
                _ = keep_alive_expired => break Ending::KeepAliveTimeout,
                _ = retry_ticker.tick(), if retry_enabled => {
                    let now = std::time::Instant::now();
                    if let Err(e) = link.session.retry_expired(now, config.ack_timeout, config.max_retries) {
                        break Ending::Error(e);
                    }
                }
                _ = link.writer.finished() => break Ending::WriterClosed,
                _ = stopped(&mut self.shutdown) => break Ending::Shutdown,
            }
        };

        self.finish(link, ending).await
    }

    /// Decode and handle every complete packet in the read buffer
    async fn process_buffer(&mut self, link: &Link) -> Result<Option<Ending>, ProtocolError> {
        while let Some(packet) = self.decoder.decode_buf(&mut self.read_buf)? {
            trace!(packet_type = ?packet.packet_type(), "received");
            if let Some(ending) = self.handle_packet(link, packet).await? {
                return Ok(Some(ending));
            }
        }
        Ok(None)
    }

    /// Handle an incoming packet
    async fn handle_packet(
        &mut self,
        link: &Link,
        packet: Packet,
    ) -> Result<Option<Ending>, ProtocolError> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(link, publish).await,
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubRel(_) | Packet::PubComp(_) => {
                self.handle_ack(link, packet)
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(link, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(link, unsubscribe).await,
            Packet::PingReq => {
                link.session.enqueue_health(Packet::PingResp);
                Ok(None)
            }
            Packet::Disconnect(disconnect) => self.handle_client_disconnect(link, disconnect),
            Packet::Connect(_) => Err(ProtocolError::violation("duplicate CONNECT")),
            Packet::Auth(_) => Err(ProtocolError::violation(
                "enhanced authentication is not supported",
            )),
            other => Err(ProtocolError::violation(format!(
                "unexpected {:?} from client",
                other.packet_type()
            ))),
        }
    }
}

/// Generate a random ID
pub(crate) fn rand_id() -> u64 {
    rand::random()
}
