//! In-memory storage backend for tests and embedding

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{PersistenceOp, StorageBackend};
use super::error::Result;
use super::models::{StoredRetainedMessage, StoredSession};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    retained: Mutex<BTreeMap<String, StoredRetainedMessage>>,
    sessions: Mutex<BTreeMap<String, StoredSession>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retained_len(&self) -> usize {
        self.retained.lock().len()
    }

    pub fn session_len(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        Ok(self.retained.lock().get(topic).cloned())
    }

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()> {
        self.retained.lock().insert(topic.to_string(), message.clone());
        Ok(())
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.retained.lock().remove(topic);
        Ok(())
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        Ok(self
            .retained
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        Ok(self.sessions.lock().get(client_id).cloned())
    }

    async fn save_session(&self, client_id: &str, session: &StoredSession) -> Result<()> {
        self.sessions.lock().insert(client_id.to_string(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        self.sessions.lock().remove(client_id);
        Ok(())
    }

    async fn load_persisted_sessions(&self) -> Result<Vec<(String, StoredSession)>> {
        Ok(self
            .sessions
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut retained = self.retained.lock();
        let mut sessions = self.sessions.lock();
        for op in ops {
            match op {
                PersistenceOp::SetRetained { topic, message } => {
                    retained.insert(topic, message);
                }
                PersistenceOp::DeleteRetained { topic } => {
                    retained.remove(&topic);
                }
                PersistenceOp::SetSession { client_id, session } => {
                    sessions.insert(client_id, session);
                }
                PersistenceOp::DeleteSession { client_id } => {
                    sessions.remove(&client_id);
                }
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
