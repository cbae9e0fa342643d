use async_trait::async_trait;

use crate::error::StoreError;
use crate::record::Subscription;

/// Durable store for subscription capability records.
///
/// ## Update Semantics
///
/// `update` is the only mutation primitive and is an atomic per-record
/// compare-and-swap: the write succeeds only if the stored record still
/// carries `expected_version`, and the committed record carries
/// `expected_version + 1`. Concurrent writers therefore never interleave
/// partial field writes; the loser observes
/// `Err(StoreError::VersionConflict)` and must re-read.
///
/// ## Snapshot Semantics
///
/// `list_due` is a point-in-time snapshot, not a live cursor. Time passes
/// between listing and acting, so callers must re-check `status`,
/// `periods_remaining`, and `next_charge_at` (via a fresh `get`) before
/// mutating anything.
///
/// ## Retention
///
/// Records are never physically deleted. Terminal subscriptions
/// (`Expired`, `Revoked`) are retained for audit.
///
/// Implementations must be `Send + Sync + 'static` to be shared in axum
/// application state and across async task boundaries.
#[async_trait]
pub trait SubscriptionStore: Send + Sync + 'static {
    /// Insert a new record at its creation version.
    ///
    /// Returns `Err(StoreError::AlreadyExists)` if the id is taken.
    async fn create(&self, sub: Subscription) -> Result<(), StoreError>;

    /// Read a record by id.
    ///
    /// Returns `Err(StoreError::NotFound)` if no record exists.
    async fn get(&self, id: &str) -> Result<Subscription, StoreError>;

    /// Compare-and-swap replace of a record.
    ///
    /// Stores `sub` with `version = expected_version + 1` and returns the
    /// committed record. Fails with `VersionConflict` if the stored
    /// version is not `expected_version`, with `NotFound` if the id does
    /// not exist.
    async fn update(
        &self,
        id: &str,
        expected_version: u64,
        sub: Subscription,
    ) -> Result<Subscription, StoreError>;

    /// Snapshot of records that are chargeable at `now` (unix seconds):
    /// `Active`, `next_charge_at <= now`, `periods_remaining > 0`.
    /// Ordered by `next_charge_at` ascending for deterministic sweeps.
    async fn list_due(&self, now: i64) -> Result<Vec<Subscription>, StoreError>;
}
