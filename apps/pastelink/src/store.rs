//! What a UI needs to pick up where it left off: the role, the last code, and
//! whether a credential is waiting to be applied.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::Role;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub role: Role,
    /// The sender's own offer, or the offer a receiver answered.
    pub encoded_offer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_answer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConnection {
    pub role: Option<Role>,
    pub encoded_offer: Option<String>,
    pub encoded_answer: Option<String>,
    pub credential_received: bool,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_connection_info(&self, info: ConnectionInfo) -> Result<(), StoreError>;

    async fn connection_info(&self) -> Result<StoredConnection, StoreError>;

    async fn save_credential(&self, value: String) -> Result<(), StoreError>;

    async fn credential(&self) -> Result<Option<String>, StoreError>;

    /// Forgets the credential once it has been applied.
    async fn clear_credential(&self) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    info: Option<ConnectionInfo>,
    credential: Option<String>,
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_connection_info(&self, info: ConnectionInfo) -> Result<(), StoreError> {
        self.state.lock().info = Some(info);
        Ok(())
    }

    async fn connection_info(&self) -> Result<StoredConnection, StoreError> {
        let state = self.state.lock();
        Ok(StoredConnection {
            role: state.info.as_ref().map(|info| info.role),
            encoded_offer: state.info.as_ref().map(|info| info.encoded_offer.clone()),
            encoded_answer: state
                .info
                .as_ref()
                .and_then(|info| info.encoded_answer.clone()),
            credential_received: state.credential.is_some(),
        })
    }

    async fn save_credential(&self, value: String) -> Result<(), StoreError> {
        self.state.lock().credential = Some(value);
        Ok(())
    }

    async fn credential(&self) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().credential.clone())
    }

    async fn clear_credential(&self) -> Result<(), StoreError> {
        self.state.lock().credential = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_store_reports_nothing() {
        let store = MemoryStateStore::new();
        assert_eq!(store.connection_info().await.unwrap(), StoredConnection::default());
        assert_eq!(store.credential().await.unwrap(), None);
    }

    #[tokio::test]
    async fn latest_connection_info_wins() {
        let store = MemoryStateStore::new();
        store
            .save_connection_info(ConnectionInfo {
                role: Role::Sender,
                encoded_offer: "first".into(),
                encoded_answer: None,
            })
            .await
            .unwrap();
        store
            .save_connection_info(ConnectionInfo {
                role: Role::Receiver,
                encoded_offer: "offer".into(),
                encoded_answer: Some("answer".into()),
            })
            .await
            .unwrap();
        store.save_credential("hunter2".into()).await.unwrap();

        let info = store.connection_info().await.unwrap();
        assert_eq!(info.role, Some(Role::Receiver));
        assert_eq!(info.encoded_offer.as_deref(), Some("offer"));
        assert_eq!(info.encoded_answer.as_deref(), Some("answer"));
        assert!(info.credential_received);

        store.clear_credential().await.unwrap();
        assert!(!store.connection_info().await.unwrap().credential_received);
    }
}
