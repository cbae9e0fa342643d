//! In-memory store backend, the test and demo default.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::record::Subscription;
use crate::traits::SubscriptionStore;

/// `SubscriptionStore` backed by a `HashMap` behind an async `RwLock`.
///
/// The write lock is held for the whole compare-and-swap in `update`,
/// which is what makes the CAS atomic here.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Subscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn create(&self, sub: Subscription) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&sub.id) {
            return Err(StoreError::AlreadyExists { id: sub.id });
        }
        records.insert(sub.id.clone(), sub);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Subscription, StoreError> {
        let records = self.records.read().await;
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
        let mut records = self.records.write().await;
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
        Ok(sub)
    }

    async fn list_due(&self, now: i64) -> Result<Vec<Subscription>, StoreError> {
        let records = self.records.read().await;
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

    fn sub(id: &str, next_charge_at: i64) -> Subscription {
        Subscription {
            id: id.to_string(),
            owner_account: "owner".to_string(),
            owner_source_account: "owner-usdc".to_string(),
            delegate_secret: DelegateSecret([1u8; 32]),
            delegate_public: "cHVi".to_string(),
            periods_remaining: 2,
            period_amount: 10_000,
            approved_ceiling: 20_000,
            period_secs: 2_592_000,
            created_at: 0,
            next_charge_at,
            status: SubscriptionStatus::Active,
            charge_history: Vec::new(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = MemoryStore::new();
        store.create(sub("sub_a", 100)).await.unwrap();
        let got = store.get("sub_a").await.unwrap();
        assert_eq!(got.next_charge_at, 100);
        assert_eq!(got.version, 0);
    }

    #[tokio::test]
    async fn create_duplicate_rejected() {
        let store = MemoryStore::new();
        store.create(sub("sub_a", 100)).await.unwrap();
        let err = store.create(sub("sub_a", 200)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("sub_zzz").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let store = MemoryStore::new();
        store.create(sub("sub_a", 100)).await.unwrap();
        let mut s = store.get("sub_a").await.unwrap();
        s.periods_remaining = 1;
        let committed = store.update("sub_a", 0, s).await.unwrap();
        assert_eq!(committed.version, 1);
        assert_eq!(store.get("sub_a").await.unwrap().periods_remaining, 1);
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        store.create(sub("sub_a", 100)).await.unwrap();
        let s = store.get("sub_a").await.unwrap();
        store.update("sub_a", 0, s.clone()).await.unwrap();

        // Second writer still holds version 0.
        let err = store.update("sub_a", 0, s).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn list_due_filters_and_orders() {
        let store = MemoryStore::new();
        store.create(sub("sub_late", 300)).await.unwrap();
        store.create(sub("sub_early", 100)).await.unwrap();
        let mut pending = sub("sub_pending", 100);
        pending.status = SubscriptionStatus::Pending;
        store.create(pending).await.unwrap();
        let mut spent = sub("sub_spent", 100);
        spent.periods_remaining = 0;
        store.create(spent).await.unwrap();

        let due = store.list_due(200).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["sub_early"]);

        let due = store.list_due(300).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["sub_early", "sub_late"]);
    }
}
