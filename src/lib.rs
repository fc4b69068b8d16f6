//! HashMQ - MQTT v3.1.1/v5.0 broker core
//!
//! Topic matching runs on per-level hashes and wildcard masks instead of a
//! trie. Every session owns a bounded, partitioned packet bus between
//! dispatch and its connection writer.

pub mod broker;
pub mod codec;
pub mod config;
pub mod events;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;
pub mod transport;

pub use broker::{ApplicationMessage, Broker, BrokerConfig, PublishResult};
pub use config::Config;
pub use events::{BroadcastEvents, BrokerEvent, EventSink};
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use persistence::{FjallBackend, MemoryBackend, PersistenceManager, StorageBackend};
pub use protocol::{ProtocolVersion, QoS};
pub use session::OverflowStrategy;
