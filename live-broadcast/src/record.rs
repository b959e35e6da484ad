use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::RecordStoreError;
use crate::session::{ChannelId, ParticipantId};

/// Identifier of a persisted session record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Live,
    Ended,
    Failed,
}

/// Durable description of a broadcast, created once the join is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub channel_id: ChannelId,
    pub broadcaster: ParticipantId,
    pub status: RecordStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub replay_url: Option<String>,
}

impl SessionRecord {
    pub fn live(channel_id: ChannelId, broadcaster: ParticipantId) -> Self {
        Self {
            channel_id,
            broadcaster,
            status: RecordStatus::Live,
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
            replay_url: None,
        }
    }

    pub fn apply(&mut self, patch: RecordPatch) {
        self.status = patch.status;
        self.ended_at = Some(patch.ended_at);
        self.end_reason = patch.end_reason;
        if patch.replay_url.is_some() {
            self.replay_url = patch.replay_url;
        }
    }
}

/// Terminal update written when the session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub status: RecordStatus,
    pub ended_at: DateTime<Utc>,
    pub end_reason: Option<String>,
    pub replay_url: Option<String>,
}

#[async_trait]
pub trait SessionRecordStore: Send + Sync {
    async fn create(&self, record: SessionRecord) -> Result<RecordId, RecordStoreError>;

    async fn update(&self, id: &RecordId, patch: RecordPatch) -> Result<(), RecordStoreError>;
}

/// Record store kept in process memory.
#[derive(Clone)]
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<RecordId, SessionRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        InMemoryRecordStore {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, id: &RecordId) -> Option<SessionRecord> {
        let records = self.records.read().await;
        records.get(id).cloned()
    }

    /// Records whose broadcast is still running, for live catalogs.
    pub async fn list_live(&self) -> Vec<(RecordId, SessionRecord)> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|(_, record)| record.status == RecordStatus::Live)
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionRecordStore for InMemoryRecordStore {
    async fn create(&self, record: SessionRecord) -> Result<RecordId, RecordStoreError> {
        let id = RecordId::new(Uuid::new_v4().to_string());
        let mut records = self.records.write().await;
        records.insert(id.clone(), record);
        tracing::info!("Created session record: {}", id);
        Ok(id)
    }

    async fn update(&self, id: &RecordId, patch: RecordPatch) -> Result<(), RecordStoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(id) {
            Some(record) => {
                record.apply(patch);
                tracing::info!("Finalized session record: {} ({:?})", id, record.status);
                Ok(())
            }
            None => {
                tracing::warn!("Attempted to update nonexistent session record: {}", id);
                Err(RecordStoreError::NotFound(id.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionRecord {
        SessionRecord::live(ChannelId::new("live-seller-1"), ParticipantId::new("seller-1"))
    }

    fn ended_patch() -> RecordPatch {
        RecordPatch {
            status: RecordStatus::Ended,
            ended_at: Utc::now(),
            end_reason: None,
            replay_url: Some("https://cdn.example.com/live-seller-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_record() {
        let store = InMemoryRecordStore::new();
        let id = store.create(sample()).await.unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.channel_id.as_str(), "live-seller-1");
        assert_eq!(record.status, RecordStatus::Live);
        assert!(record.ended_at.is_none());
    }

    #[tokio::test]
    async fn test_create_generates_distinct_ids() {
        let store = InMemoryRecordStore::new();
        let a = store.create(sample()).await.unwrap();
        let b = store.create(sample()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_update_finalizes_record() {
        let store = InMemoryRecordStore::new();
        let id = store.create(sample()).await.unwrap();

        store.update(&id, ended_patch()).await.unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Ended);
        assert!(record.ended_at.is_some());
        assert_eq!(
            record.replay_url.as_deref(),
            Some("https://cdn.example.com/live-seller-1")
        );
    }

    #[tokio::test]
    async fn test_update_nonexistent_record() {
        let store = InMemoryRecordStore::new();
        let result = store.update(&RecordId::new("missing"), ended_patch()).await;
        assert_eq!(result, Err(RecordStoreError::NotFound("missing".to_string())));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_live_skips_finalized() {
        let store = InMemoryRecordStore::new();
        let live = store.create(sample()).await.unwrap();
        let done = store.create(sample()).await.unwrap();
        store.update(&done, ended_patch()).await.unwrap();

        let listed = store.list_live().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, live);
    }

    #[test]
    fn test_record_serializes_lowercase_status() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["status"], "live");
        assert_eq!(value["channel_id"], "live-seller-1");
    }
}
