//! fjall (LSM-tree) storage backend
//!
//! One keyspace with a partition per record kind. Keys are the topic or
//! client id, values are bincode-encoded models.

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::debug;

use super::backend::{PersistenceOp, StorageBackend};
use super::error::Result;
use super::models::{StoredRetainedMessage, StoredSession};

pub struct FjallBackend {
    keyspace: Keyspace,
    retained: PartitionHandle,
    sessions: PartitionHandle,
}

impl FjallBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path.as_ref()).open()?;
        let retained = keyspace.open_partition("retained", PartitionCreateOptions::default())?;
        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;
        debug!(path = %path.as_ref().display(), "opened fjall keyspace");
        Ok(Self {
            keyspace,
            retained,
            sessions,
        })
    }

    fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
    }

    fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(value)
    }

    fn get<T: bincode::Decode<()>>(partition: &PartitionHandle, key: &str) -> Result<Option<T>> {
        partition
            .get(key)?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    fn list<T: bincode::Decode<()>>(partition: &PartitionHandle) -> Result<Vec<(String, T)>> {
        let mut out = Vec::new();
        for item in partition.iter() {
            let (key, value) = item?;
            out.push((String::from_utf8_lossy(&key).into_owned(), Self::decode(&value)?));
        }
        Ok(out)
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        Self::get(&self.retained, topic)
    }

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()> {
        self.retained.insert(topic, Self::encode(message)?)?;
        Ok(())
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.retained.remove(topic)?;
        Ok(())
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        Self::list(&self.retained)
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        Self::get(&self.sessions, client_id)
    }

    async fn save_session(&self, client_id: &str, session: &StoredSession) -> Result<()> {
        self.sessions.insert(client_id, Self::encode(session)?)?;
        Ok(())
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        self.sessions.remove(client_id)?;
        Ok(())
    }

    async fn load_persisted_sessions(&self) -> Result<Vec<(String, StoredSession)>> {
        Self::list(&self.sessions)
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for op in ops {
            match op {
                PersistenceOp::SetRetained { topic, message } => {
                    batch.insert(&self.retained, topic, Self::encode(&message)?);
                }
                PersistenceOp::DeleteRetained { topic } => batch.remove(&self.retained, topic),
                PersistenceOp::SetSession { client_id, session } => {
                    batch.insert(&self.sessions, client_id, Self::encode(&session)?);
                }
                PersistenceOp::DeleteSession { client_id } => {
                    batch.remove(&self.sessions, client_id)
                }
            }
        }
        batch.commit()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // fjall releases its files on drop
        self.flush().await
    }
}
