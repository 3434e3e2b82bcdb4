//! In-process registry backend for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{SandboxPatch, SandboxRecord, SandboxStore, StoreError};

/// Single-process map of sandbox records guarded by a `parking_lot` lock.
///
/// Mutations hold the write lock for the duration of the patch, which gives
/// the same per-operation atomicity the Postgres backend gets from
/// single-row updates.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Uuid, SandboxRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxStore for MemoryStore {
    async fn save(&self, record: SandboxRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&record.sandbox_id) {
            return Err(StoreError::Conflict(record.sandbox_id));
        }
        records.insert(record.sandbox_id, record);
        Ok(())
    }

    async fn get(&self, sandbox_id: Uuid) -> Result<SandboxRecord, StoreError> {
        self.records
            .read()
            .get(&sandbox_id)
            .cloned()
            .ok_or(StoreError::NotFound(sandbox_id))
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<SandboxRecord>, StoreError> {
        let records = self.records.read();
        Ok(records
            .values()
            .filter(|record| user_id.map(|user| record.user_id == user).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        sandbox_id: Uuid,
        patch: SandboxPatch,
    ) -> Result<SandboxRecord, StoreError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&sandbox_id)
            .ok_or(StoreError::NotFound(sandbox_id))?;

        apply_patch(record, patch);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, sandbox_id: Uuid) -> Result<(), StoreError> {
        self.records
            .write()
            .remove(&sandbox_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(sandbox_id))
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SandboxRecord>, StoreError> {
        let records = self.records.read();
        Ok(records
            .values()
            .filter(|record| record.is_expired_at(now))
            .cloned()
            .collect())
    }
}

fn apply_patch(record: &mut SandboxRecord, patch: SandboxPatch) {
    if let Some(status) = patch.status {
        record.status = status;
    }
    if let Some(container_id) = patch.container_id {
        record.container_id = container_id;
    }
    if let Some(cwd) = patch.cwd {
        record.cwd = cwd;
    }
    if let Some(config) = patch.config {
        record.config = config;
    }
    if let Some(expires_at) = patch.expires_at {
        record.expires_at = Some(expires_at);
    }
    if let Some(heartbeat) = patch.last_heartbeat_at {
        record.last_heartbeat_at = Some(heartbeat);
    }
    if let Some(stopped_at) = patch.stopped_at {
        record.stopped_at = Some(stopped_at);
    }
    if let Some(reason) = patch.stop_reason {
        record.stop_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SandboxStatus, StopReason};
    use serde_json::json;

    fn record(user: &str) -> SandboxRecord {
        SandboxRecord::new(user, 7200, json!({}))
    }

    #[tokio::test]
    async fn save_rejects_duplicate_ids() {
        let store = MemoryStore::new();
        let rec = record("u-alice");
        let id = rec.sandbox_id;
        store.save(rec.clone()).await.unwrap();
        assert!(matches!(
            store.save(rec).await,
            Err(StoreError::Conflict(conflicting)) if conflicting == id
        ));
    }

    #[tokio::test]
    async fn list_is_scoped_per_user() {
        let store = MemoryStore::new();
        store.save(record("u-alice")).await.unwrap();
        store.save(record("u-alice")).await.unwrap();
        store.save(record("u-bob")).await.unwrap();

        let alice = store.list(Some("u-alice")).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|r| r.user_id == "u-alice"));

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn update_applies_patch_and_advances_updated_at() {
        let store = MemoryStore::new();
        let rec = record("u-alice");
        let id = rec.sandbox_id;
        let before = rec.updated_at;
        store.save(rec).await.unwrap();

        let updated = store
            .update(
                id,
                SandboxPatch {
                    status: Some(SandboxStatus::Starting),
                    container_id: Some(Some("c-1".into())),
                    ..SandboxPatch::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, SandboxStatus::Starting);
        assert_eq!(updated.container_id.as_deref(), Some("c-1"));
        assert!(updated.updated_at >= before);
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let store = MemoryStore::new();
        let missing = Uuid::new_v4();
        assert!(matches!(
            store.update(missing, SandboxPatch::default()).await,
            Err(StoreError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn list_expired_honors_status_and_deadline() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut live = record("u-alice");
        live.status = SandboxStatus::Running;
        live.expires_at = Some(now - chrono::Duration::seconds(5));
        let live_id = live.sandbox_id;

        let mut fresh = record("u-alice");
        fresh.status = SandboxStatus::Ready;
        fresh.expires_at = Some(now + chrono::Duration::seconds(300));

        let mut stopped = record("u-alice");
        stopped.status = SandboxStatus::Stopped;
        stopped.expires_at = Some(now - chrono::Duration::seconds(5));
        stopped.stop_reason = Some(StopReason::UserRequested);

        store.save(live).await.unwrap();
        store.save(fresh).await.unwrap();
        store.save(stopped).await.unwrap();

        let expired = store.list_expired(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sandbox_id, live_id);
    }
}
