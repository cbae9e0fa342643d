//! JSON-file store backend.
//!
//! One JSON document holding every record, keyed by id. All operations
//! serialize through an async mutex, and writes go to a temp file that is
//! renamed over the document, so a crash mid-write never leaves a torn
//! file. Blocking filesystem I/O runs under `tokio::task::spawn_blocking`
//! to keep the async runtime free.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::record::Subscription;
use crate::traits::SubscriptionStore;

/// `SubscriptionStore` persisted as a single JSON file.
///
/// Suitable for single-process deployments; the mutex makes every
/// read-modify-write atomic with respect to other calls on this store.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open a store at `path`. The file is created lazily on first write;
    /// a missing file reads as an empty store.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, Subscription>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_document(&path))
            .await
            .map_err(|e| StoreError::Unavailable(format!("task join error: {}", e)))?
    }

    async fn write_all(&self, records: HashMap<String, Subscription>) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_document(&path, &records))
            .await
            .map_err(|e| StoreError::Unavailable(format!("task join error: {}", e)))?
    }
}

fn read_document(path: &Path) -> Result<HashMap<String, Subscription>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)
        .map_err(|e| StoreError::Unavailable(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_str(&data)
        .map_err(|e| StoreError::Unavailable(format!("parse {}: {}", path.display(), e)))
}

fn write_document(path: &Path, records: &HashMap<String, Subscription>) -> Result<(), StoreError> {
    let data = serde_json::to_string_pretty(records)
        .map_err(|e| StoreError::Unavailable(format!("serialize store: {}", e)))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)
        .map_err(|e| StoreError::Unavailable(format!("write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| StoreError::Unavailable(format!("rename {}: {}", path.display(), e)))
}

#[async_trait]
impl SubscriptionStore for JsonFileStore {
    async fn create(&self, sub: Subscription) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        if records.contains_key(&sub.id) {
            return Err(StoreError::AlreadyExists { id: sub.id });
        }
        records.insert(sub.id.clone(), sub);
        self.write_all(records).await
    }

    async fn get(&self, id: &str) -> Result<Subscription, StoreError> {
        let _guard = self.lock.lock().await;
        let records = self.read_all().await?;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn update(
        &self,
        id: &str,
        expected_version: u64,
        mut sub: Subscription,
    ) -> Result<Subscription, StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        let current = records
            .get(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected_version,
            });
        }
        sub.version = expected_version + 1;
        records.insert(id.to_string(), sub.clone());
        self.write_all(records).await?;
        Ok(sub)
    }

    async fn list_due(&self, now: i64) -> Result<Vec<Subscription>, StoreError> {
        let _guard = self.lock.lock().await;
        let records = self.read_all().await?;
        let mut due: Vec<Subscription> = records
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_charge_at.cmp(&b.next_charge_at).then(a.id.cmp(&b.id)));
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DelegateSecret, SubscriptionStatus};
    use tempfile::TempDir;

    fn sub(id: &str) -> Subscription {
        Subscription {
            id: id.to_string(),
            owner_account: "owner".to_string(),
            owner_source_account: "owner-usdc".to_string(),
            delegate_secret: DelegateSecret([9u8; 32]),
            delegate_public: "cHVi".to_string(),
            periods_remaining: 1,
            period_amount: 5,
            approved_ceiling: 5,
            period_secs: 2_592_000,
            created_at: 0,
            next_charge_at: 50,
            status: SubscriptionStatus::Active,
            charge_history: Vec::new(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("subscriptions.json");

        let store = JsonFileStore::new(&path);
        store.create(sub("sub_a")).await.unwrap();
        drop(store);

        let reopened = JsonFileStore::new(&path);
        let got = reopened.get("sub_a").await.unwrap();
        assert_eq!(got.period_amount, 5);
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileStore::new(tmp.path().join("missing.json"));
        let err = store.get("sub_a").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.list_due(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_persists_new_version() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("subscriptions.json");
        let store = JsonFileStore::new(&path);
        store.create(sub("sub_a")).await.unwrap();

        let mut s = store.get("sub_a").await.unwrap();
        s.periods_remaining = 0;
        s.status = SubscriptionStatus::Expired;
        store.update("sub_a", 0, s).await.unwrap();

        let reopened = JsonFileStore::new(&path);
        let got = reopened.get("sub_a").await.unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.status, SubscriptionStatus::Expired);
    }

    #[tokio::test]
    async fn corrupt_file_reports_unavailable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("subscriptions.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonFileStore::new(&path);
        let err = store.get("sub_a").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
