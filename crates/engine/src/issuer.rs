//! Grant issuance: minting delegate credentials and recording grants.

use std::sync::Arc;

use rand::RngCore;
use remit_ledger::{DelegateKeypair, DelegatePublic};
use remit_store::{
    DelegateSecret, StoreError, Subscription, SubscriptionStatus, SubscriptionStore,
};
use time::OffsetDateTime;

use crate::error::IssueError;

/// How many times a lifecycle transition retries its compare-and-swap
/// before giving up. Conflicts here are rare (operator actions racing
/// each other), so a small budget is enough.
const CAS_ATTEMPTS: u32 = 3;

/// Parameters for a new grant.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    /// The payer's identity account.
    pub owner_account: String,
    /// The payer's asset-holding sub-account funds are pulled from.
    pub source_account: String,
    /// Fixed amount per billing period, in smallest units.
    pub period_amount: u64,
    /// Number of prepaid periods.
    pub periods: u32,
}

/// One-time grant setup plus the lifecycle transitions that are driven
/// from outside the charge path (activation, revocation).
///
/// The issuer never submits ledger transactions: it prepares the
/// capability record and mints the delegate identity that a separate,
/// owner-signed approval transaction authorizes on-ledger.
pub struct GrantIssuer {
    store: Arc<dyn SubscriptionStore>,
    /// Billing period length applied to new grants, in seconds.
    period_secs: i64,
}

impl GrantIssuer {
    pub fn new(store: Arc<dyn SubscriptionStore>, period_secs: i64) -> Self {
        Self { store, period_secs }
    }

    /// Record a new grant in `pending` status and return its id together
    /// with the delegate's public credential.
    ///
    /// The record (including the private delegate seed) is durable
    /// before this returns, so an approval observed on-ledger can always
    /// be matched to a grant; a grant is never orphaned. The private
    /// seed never leaves the store.
    pub async fn issue(
        &self,
        req: GrantRequest,
        now: OffsetDateTime,
    ) -> Result<(String, DelegatePublic), IssueError> {
        if req.periods == 0 {
            return Err(IssueError::InvalidRequest {
                message: "periods must be at least 1".to_string(),
            });
        }
        if req.period_amount == 0 {
            return Err(IssueError::InvalidRequest {
                message: "period_amount must be positive".to_string(),
            });
        }
        if req.owner_account.is_empty() || req.source_account.is_empty() {
            return Err(IssueError::InvalidRequest {
                message: "owner_account and source_account are required".to_string(),
            });
        }

        let approved_ceiling = req
            .period_amount
            .checked_mul(u64::from(req.periods))
            .ok_or(IssueError::CeilingOverflow {
                period_amount: req.period_amount,
                periods: req.periods,
            })?;

        let delegate = DelegateKeypair::generate();
        let delegate_public = delegate.public();
        let id = new_subscription_id();

        let sub = Subscription {
            id: id.clone(),
            owner_account: req.owner_account,
            owner_source_account: req.source_account,
            delegate_secret: DelegateSecret(delegate.seed()),
            delegate_public: delegate_public.0.clone(),
            periods_remaining: req.periods,
            period_amount: req.period_amount,
            approved_ceiling,
            period_secs: self.period_secs,
            created_at: now.unix_timestamp(),
            // Set on activation; a pending grant has no schedule yet.
            next_charge_at: 0,
            status: SubscriptionStatus::Pending,
            charge_history: Vec::new(),
            version: 0,
        };

        self.store.create(sub).await.map_err(IssueError::Store)?;
        Ok((id, delegate_public))
    }

    /// Transition `pending → active` once the owner's approval has been
    /// independently confirmed, and set the first charge time.
    ///
    /// Idempotent: activating an already-active subscription is a no-op
    /// that returns the current record unchanged.
    pub async fn activate(
        &self,
        id: &str,
        now: OffsetDateTime,
    ) -> Result<Subscription, IssueError> {
        for _ in 0..CAS_ATTEMPTS {
            let sub = self.get(id).await?;
            match sub.status {
                SubscriptionStatus::Active => return Ok(sub),
                SubscriptionStatus::Expired | SubscriptionStatus::Revoked => {
                    return Err(IssueError::InvalidStatus {
                        id: id.to_string(),
                        status: sub.status,
                    })
                }
                SubscriptionStatus::Pending => {}
            }

            let mut updated = sub.clone();
            updated.status = SubscriptionStatus::Active;
            updated.next_charge_at = now.unix_timestamp() + sub.period_secs;
            match self.store.update(id, sub.version, updated).await {
                Ok(committed) => return Ok(committed),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(map_store(id, e)),
            }
        }
        Err(IssueError::Store(StoreError::VersionConflict {
            id: id.to_string(),
            expected_version: 0,
        }))
    }

    /// Cancel a grant. Allowed from `pending` and `active`; idempotent on
    /// an already-revoked subscription.
    pub async fn revoke(&self, id: &str) -> Result<Subscription, IssueError> {
        for _ in 0..CAS_ATTEMPTS {
            let sub = self.get(id).await?;
            match sub.status {
                SubscriptionStatus::Revoked => return Ok(sub),
                SubscriptionStatus::Expired => {
                    return Err(IssueError::InvalidStatus {
                        id: id.to_string(),
                        status: sub.status,
                    })
                }
                SubscriptionStatus::Pending | SubscriptionStatus::Active => {}
            }

            let mut updated = sub.clone();
            updated.status = SubscriptionStatus::Revoked;
            match self.store.update(id, sub.version, updated).await {
                Ok(committed) => return Ok(committed),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(map_store(id, e)),
            }
        }
        Err(IssueError::Store(StoreError::VersionConflict {
            id: id.to_string(),
            expected_version: 0,
        }))
    }

    async fn get(&self, id: &str) -> Result<Subscription, IssueError> {
        self.store.get(id).await.map_err(|e| map_store(id, e))
    }
}

fn map_store(id: &str, e: StoreError) -> IssueError {
    match e {
        StoreError::NotFound { .. } => IssueError::NotFound { id: id.to_string() },
        other => IssueError::Store(other),
    }
}

/// Mint an opaque subscription id: `sub_` plus 96 random bits, hex.
fn new_subscription_id() -> String {
    let mut bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sub_{}", hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remit_store::MemoryStore;

    const PERIOD: i64 = 2_592_000; // 30 days

    fn issuer() -> (GrantIssuer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (GrantIssuer::new(store.clone(), PERIOD), store)
    }

    fn request() -> GrantRequest {
        GrantRequest {
            owner_account: "owner".to_string(),
            source_account: "owner-usdc".to_string(),
            period_amount: 10_000,
            periods: 3,
        }
    }

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[tokio::test]
    async fn issue_records_pending_grant() {
        let (issuer, store) = issuer();
        let (id, public) = issuer.issue(request(), t0()).await.unwrap();

        let sub = store.get(&id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Pending);
        assert_eq!(sub.periods_remaining, 3);
        assert_eq!(sub.approved_ceiling, 30_000);
        assert_eq!(sub.next_charge_at, 0);
        assert_eq!(sub.delegate_public, public.0);
        // The stored seed reconstructs the same credential.
        let restored = DelegateKeypair::from_seed(&sub.delegate_secret.0);
        assert_eq!(restored.public(), public);
    }

    #[tokio::test]
    async fn issue_rejects_zero_periods_and_zero_amount() {
        let (issuer, _) = issuer();
        let mut req = request();
        req.periods = 0;
        assert!(matches!(
            issuer.issue(req, t0()).await,
            Err(IssueError::InvalidRequest { .. })
        ));

        let mut req = request();
        req.period_amount = 0;
        assert!(matches!(
            issuer.issue(req, t0()).await,
            Err(IssueError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn issue_rejects_ceiling_overflow() {
        let (issuer, _) = issuer();
        let mut req = request();
        req.period_amount = u64::MAX;
        req.periods = 2;
        assert!(matches!(
            issuer.issue(req, t0()).await,
            Err(IssueError::CeilingOverflow { .. })
        ));
    }

    #[tokio::test]
    async fn delegate_credentials_are_never_reused() {
        let (issuer, store) = issuer();
        let (id_a, _) = issuer.issue(request(), t0()).await.unwrap();
        let (id_b, _) = issuer.issue(request(), t0()).await.unwrap();
        assert_ne!(id_a, id_b);

        let a = store.get(&id_a).await.unwrap();
        let b = store.get(&id_b).await.unwrap();
        assert_ne!(a.delegate_secret, b.delegate_secret);
    }

    #[tokio::test]
    async fn activate_sets_first_charge_time() {
        let (issuer, _) = issuer();
        let (id, _) = issuer.issue(request(), t0()).await.unwrap();

        let sub = issuer.activate(&id, t0()).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.next_charge_at, t0().unix_timestamp() + PERIOD);
    }

    #[tokio::test]
    async fn activate_is_idempotent() {
        let (issuer, _) = issuer();
        let (id, _) = issuer.issue(request(), t0()).await.unwrap();

        let first = issuer.activate(&id, t0()).await.unwrap();
        // A later second activation must not move the schedule.
        let later = t0() + time::Duration::days(7);
        let second = issuer.activate(&id, later).await.unwrap();
        assert_eq!(second.status, SubscriptionStatus::Active);
        assert_eq!(second.next_charge_at, first.next_charge_at);
    }

    #[tokio::test]
    async fn activate_unknown_id_is_not_found() {
        let (issuer, _) = issuer();
        assert!(matches!(
            issuer.activate("sub_missing", t0()).await,
            Err(IssueError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn revoke_from_pending_and_active() {
        let (issuer, _) = issuer();
        let (id, _) = issuer.issue(request(), t0()).await.unwrap();
        let revoked = issuer.revoke(&id).await.unwrap();
        assert_eq!(revoked.status, SubscriptionStatus::Revoked);

        // Idempotent.
        let again = issuer.revoke(&id).await.unwrap();
        assert_eq!(again.status, SubscriptionStatus::Revoked);

        // A revoked grant cannot be activated.
        assert!(matches!(
            issuer.activate(&id, t0()).await,
            Err(IssueError::InvalidStatus { .. })
        ));
    }
}
