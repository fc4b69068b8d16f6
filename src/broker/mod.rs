//! MQTT Broker Core
//!
//! The listener, the per-connection tasks and the operator-facing API.
//! Cross-session work (fan-out, retained replay, session lifecycle) lives
//! in the [`Dispatcher`]; connections only translate between the socket
//! and it.

mod connection;
mod dispatcher;

#[cfg(test)]
mod tests;

pub use connection::{Connection, ConnectionError};
pub use dispatcher::{
    ApplicationMessage, ConnectionEnd, ConnectionHandle, Dispatcher, Kick, PublishReply,
    PublishResult, RetainedReplay, SubscribeOutcome,
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use crate::events::{BroadcastEvents, BrokerEvent, EventSink};
use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::{PersistenceError, PersistenceManager, PersistenceOp, StoredSession};
use crate::protocol::{ProtocolError, ProtocolVersion, QoS};
use crate::retained::RetainedMessage;
use crate::session::SessionLimits;
use crate::transport::{configure_stream, Transport, TransportConfig};

/// How long shutdown waits for connections to finish their goodbye
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    /// Largest inbound packet accepted, in bytes
    pub max_packet_size: usize,
    /// Deadline for the CONNECT packet after the transport opens
    pub connect_timeout: Duration,
    /// How long an outbound QoS 1/2 packet waits for its acknowledgement
    /// before it is retransmitted. Zero disables retransmission.
    pub ack_timeout: Duration,
    /// Retransmissions before the session is failed
    pub max_retries: u32,
    pub max_qos: QoS,
    pub retain_available: bool,
    /// Bus limits for every new session
    pub session: SessionLimits,
    /// Session and retained-message expiry check interval
    pub expiry_check_interval: Duration,
    pub transport: TransportConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 100_000,
            max_packet_size: 1024 * 1024, // 1 MB
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(20),
            max_retries: 5,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            session: SessionLimits::default(),
            expiry_check_interval: Duration::from_secs(10),
            transport: TransportConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.session.max_pending_messages == 0 {
            return Err(ProtocolError::configuration(
                "max_pending_messages must be at least 1",
            ));
        }
        if self.max_retries == 0 && !self.ack_timeout.is_zero() {
            return Err(ProtocolError::configuration(
                "max_retries must be at least 1 when ack_timeout is set",
            ));
        }
        if self.max_packet_size == 0 {
            return Err(ProtocolError::configuration("max_packet_size must be positive"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ProtocolError::configuration("connect_timeout must be positive"));
        }
        if self.expiry_check_interval.is_zero() {
            return Err(ProtocolError::configuration(
                "expiry_check_interval must be positive",
            ));
        }
        Ok(())
    }

    /// Period of the per-connection retransmission check
    pub(crate) fn retry_interval(&self) -> Duration {
        (self.ack_timeout / 2).clamp(Duration::from_millis(100), Duration::from_secs(1))
    }
}

/// A live connection, as reported by [`Broker::clients`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: Arc<str>,
    pub connection_id: u64,
    pub addr: SocketAddr,
    pub protocol_version: ProtocolVersion,
    pub username: Option<String>,
    pub connected_at: SystemTime,
}

/// A session, connected or parked, as reported by [`Broker::sessions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub client_id: Arc<str>,
    pub connected: bool,
    pub protocol_version: ProtocolVersion,
    pub pending: usize,
    pub inflight: usize,
    pub subscriptions: usize,
    pub expiry_interval: u32,
    pub created_at: SystemTime,
    pub disconnected_at: Option<SystemTime>,
}

/// The MQTT Broker
pub struct Broker {
    dispatcher: Arc<Dispatcher>,
    events: BroadcastEvents,
    shutdown: watch::Sender<bool>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Result<Self, ProtocolError> {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Result<Self, ProtocolError> {
        Self::from_parts(config, hooks, None)
    }

    /// Create a broker backed by persistent storage. Call
    /// [`Broker::restore`] before serving to load what was stored.
    pub fn from_parts(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        let events = BroadcastEvents::default();
        let sink: Arc<dyn EventSink> = Arc::new(events.clone());
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            dispatcher: Arc::new(Dispatcher::new(config, hooks, sink, persistence)),
            events,
            shutdown,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        self.dispatcher.config()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Load retained messages and sessions from persistence. Returns how
    /// many of each were restored.
    pub async fn restore(&self) -> Result<(usize, usize), PersistenceError> {
        let Some(persistence) = &self.dispatcher.persistence else {
            return Ok((0, 0));
        };
        let loaded = persistence.load_all().await?;

        let mut retained = 0;
        for (topic, stored) in loaded.retained {
            match RetainedMessage::try_from(stored) {
                Ok(message) => {
                    self.dispatcher.restore_retained(message);
                    retained += 1;
                }
                Err(e) => warn!(topic = %topic, "skipping stored retained message: {}", e),
            }
        }

        let mut sessions = 0;
        for (client_id, stored) in loaded.sessions {
            match stored.restore(self.config().session, self.dispatcher.events.clone()) {
                Ok((session, subscriptions)) => {
                    self.dispatcher.restore_session(session, subscriptions);
                    sessions += 1;
                }
                Err(e) => warn!(client_id = %client_id, "skipping stored session: {}", e),
            }
        }
        info!(retained, sessions, "restored persisted state");
        Ok((retained, sessions))
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config().bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`Broker::shutdown`] is
    /// called, then close every connection and flush persistence
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("MQTT/TCP listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();
        let sweeper = self.spawn_sweeper();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = stopped(&mut shutdown_rx) => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("connection task failed: {}", e);
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if connections.len() >= self.config().max_connections {
                            warn!(%addr, "connection limit reached, refusing");
                            continue;
                        }
                        if let Err(e) = configure_stream(&stream, &self.config().transport) {
                            debug!(%addr, "failed to configure socket: {}", e);
                        }
                        connections.spawn(self.connection_task(stream, addr));
                    }
                    Err(e) => error!("failed to accept TCP connection: {}", e),
                },
            }
        }

        info!(open = connections.len(), "shutting down");
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("connections did not close in time, aborting them");
            connections.abort_all();
        }
        sweeper.abort();
        self.flush_persistence().await;
        Ok(())
    }

    /// Run one connection over an arbitrary transport until it ends
    pub async fn serve_stream<S: Transport>(&self, stream: S, addr: SocketAddr) {
        self.connection_task(stream, addr).await
    }

    fn connection_task<S: Transport>(
        &self,
        stream: S,
        addr: SocketAddr,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let connection = Connection::new(
            stream,
            addr,
            self.dispatcher.clone(),
            self.shutdown.subscribe(),
        );
        let span = tracing::debug_span!("connection", peer = %addr, client_id = tracing::field::Empty);
        async move {
            if let Err(e) = connection.run().await {
                debug!("connection ended: {}", e);
            }
        }
        .instrument(span)
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let period = self.config().expiry_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;

                    _ = stopped(&mut shutdown_rx) => break,
                    _ = ticker.tick() => dispatcher.sweep(Instant::now()).await,
                }
            }
        })
    }

    async fn flush_persistence(&self) {
        let Some(persistence) = &self.dispatcher.persistence else {
            return;
        };
        let count = self.dispatcher.persist_all();
        debug!(count, "persisting sessions before exit");
        if let Err(e) = persistence.shutdown().await {
            error!("failed to flush persistence: {}", e);
        }
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Publish a server-originated message through the normal dispatch path
    pub async fn publish(&self, message: ApplicationMessage) -> Result<PublishResult, ProtocolError> {
        self.dispatcher.inject(message).await
    }

    // Status API

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .dispatcher
            .clients()
            .iter()
            .map(|entry| {
                let handle = entry.value();
                ClientInfo {
                    client_id: entry.key().clone(),
                    connection_id: handle.id,
                    addr: handle.addr,
                    protocol_version: handle.protocol_version,
                    username: handle.username.clone(),
                    connected_at: handle.connected_at,
                }
            })
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .dispatcher
            .sessions()
            .snapshot()
            .into_iter()
            .map(|session| {
                let state = session.state();
                SessionInfo {
                    client_id: session.id().clone(),
                    connected: state.connected,
                    protocol_version: state.protocol_version,
                    pending: session.pending_count(),
                    inflight: session.inflight_count(),
                    subscriptions: state.subscriptions.len(),
                    expiry_interval: state.expiry_interval,
                    created_at: wall_clock(session.created_at()),
                    disconnected_at: state.disconnected_at.map(wall_clock),
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        sessions
    }

    /// Remove a session, closing its connection if it has one
    pub async fn delete_session(&self, client_id: &str) -> bool {
        self.dispatcher.delete_session(client_id).await
    }

    /// Close a client's connection. Its session survives according to its
    /// expiry interval.
    pub async fn disconnect_client(&self, client_id: &str) -> bool {
        self.dispatcher
            .kick_and_wait(client_id, Kick::Administrative)
            .await
    }

    pub fn retained_messages(&self) -> Vec<RetainedMessage> {
        self.dispatcher.retained().snapshot()
    }

    /// Drop every retained message. Returns how many were removed.
    pub fn clear_retained(&self) -> usize {
        let messages = self.dispatcher.retained().snapshot();
        for message in &messages {
            self.dispatcher.retained().remove(&message.topic);
            if let Some(persistence) = &self.dispatcher.persistence {
                persistence.write(PersistenceOp::DeleteRetained {
                    topic: message.topic.to_string(),
                });
            }
            self.dispatcher.events.emit(BrokerEvent::RetainedChanged {
                topic: message.topic.clone(),
                removed: true,
            });
        }
        messages.len()
    }

    pub fn session_count(&self) -> usize {
        self.dispatcher.sessions().len()
    }

    pub fn connection_count(&self) -> usize {
        self.dispatcher.connection_count()
    }

    pub fn retained_count(&self) -> usize {
        self.dispatcher.retained().len()
    }

    /// Serialize one session as persistence would store it
    pub fn session_snapshot(&self, client_id: &str) -> Option<StoredSession> {
        self.dispatcher
            .sessions()
            .get(client_id)
            .map(|session| StoredSession::from_session(&session))
    }
}

/// Resolves once the shutdown flag is raised (or its sender is gone)
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Map a monotonic instant onto the wall clock
fn wall_clock(instant: Instant) -> SystemTime {
    let age = Instant::now().saturating_duration_since(instant);
    SystemTime::now().checked_sub(age).unwrap_or(SystemTime::UNIX_EPOCH)
}
