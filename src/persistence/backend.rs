//! Storage backend trait.
//!
//! The broker only talks to this interface; how and where data lands is up
//! to the implementation.

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredRetainedMessage, StoredSession};

/// One queued write for the batching writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceOp {
    SetRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    DeleteRetained {
        topic: String,
    },
    SetSession {
        client_id: String,
        session: StoredSession,
    },
    DeleteSession {
        client_id: String,
    },
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>>;

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()>;

    async fn delete_retained(&self, topic: &str) -> Result<()>;

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>>;

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>>;

    async fn save_session(&self, client_id: &str, session: &StoredSession) -> Result<()>;

    async fn delete_session(&self, client_id: &str) -> Result<()>;

    /// Every stored session, for resuming non-clean sessions at startup
    async fn load_persisted_sessions(&self) -> Result<Vec<(String, StoredSession)>>;

    /// Apply a batch of operations in one commit
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn load_all(&self) -> Result<LoadedData> {
        Ok(LoadedData {
            retained: self.list_retained().await?,
            sessions: self.load_persisted_sessions().await?,
        })
    }
}
