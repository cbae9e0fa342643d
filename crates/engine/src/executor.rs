//! The charge executor: one state machine run per charge attempt.
//!
//! `Scheduled → Submitting → Submitted → Verifying → {Settled | Failed}`,
//! with the balance-delta verification as the only acceptance rule. The
//! executor keeps no in-memory notion of "already submitted" across
//! invocations. Instead, every attempt writes an open `pending` history
//! entry (carrying the pre-submission balance) durably before the
//! transfer is submitted; a crash between any two later steps leaves
//! that marker behind, and the next invocation reconciles it against
//! live ledger state before it will submit anything new.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remit_ledger::{Confirmation, DelegateKeypair, LedgerClient, LedgerError, TxRef};
use remit_store::{
    ChargeAttempt, ChargeOutcome, StoreError, Subscription, SubscriptionStatus, SubscriptionStore,
};
use time::OffsetDateTime;

use crate::error::{ChargeError, ChargeFailure, NotDueReason};

/// Compare-and-swap retries for history/schedule commits. The in-flight
/// guard keeps other charges out, so a conflict can only be a racing
/// lifecycle transition (revoke); one re-read resolves it.
const CAS_ATTEMPTS: u32 = 3;

/// Executor knobs. `merchant_account` is the destination of every
/// charge; the confirmation window bounds how long a charge waits for
/// finality before falling through to balance verification.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub merchant_account: String,
    pub confirm_attempts: u32,
    pub confirm_interval: Duration,
}

impl ExecutorConfig {
    pub fn new(merchant_account: impl Into<String>) -> Self {
        Self {
            merchant_account: merchant_account.into(),
            confirm_attempts: 5,
            confirm_interval: Duration::from_millis(500),
        }
    }
}

/// Outcome of a verified, settled charge.
///
/// `tx_ref` is `None` only when the attempt was recovered after an
/// interruption that lost the submission reference; settlement was
/// still verified from the balance delta.
#[derive(Debug, Clone)]
pub struct ChargeReceipt {
    pub id: String,
    pub amount_charged: u64,
    pub tx_ref: Option<TxRef>,
    pub periods_remaining: u32,
    pub next_charge_at: i64,
    pub status: SubscriptionStatus,
}

/// What became of an open marker left by an interrupted attempt.
enum Reconciled {
    /// The prior attempt settled on-ledger; it was committed as the
    /// charge for this period.
    Settled(ChargeReceipt),
    /// The prior attempt never settled; its marker was finalized as
    /// failed and a fresh attempt may proceed on the returned record.
    Discarded(Subscription),
}

/// Executes due charges against the ledger.
///
/// Safe to share behind an `Arc`; charges for different subscription ids
/// run concurrently, while the per-id in-flight set keeps a second
/// attempt for the same id out (`AlreadyInProgress`).
pub struct ChargeExecutor {
    store: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn LedgerClient>,
    config: ExecutorConfig,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes the id from the in-flight set when the attempt ends, on every
/// exit path.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

impl ChargeExecutor {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn LedgerClient>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run one charge attempt for `id` at time `now`.
    ///
    /// Due-ness is re-checked here even when the caller already filtered
    /// via `list_due`, since time passes between listing and execution.
    pub async fn charge(
        &self,
        id: &str,
        now: OffsetDateTime,
    ) -> Result<ChargeReceipt, ChargeError> {
        let _guard = self.acquire(id)?;
        let now_ts = now.unix_timestamp();

        let mut sub = self.store.get(id).await.map_err(|e| map_store(id, e))?;

        // An interrupted attempt must be reconciled before anything else,
        // even ahead of the due guards: if its transfer settled, that IS
        // this period's charge, and submitting again would double-charge.
        if let Some(idx) = sub.open_attempt() {
            match self.reconcile(sub, idx).await? {
                Reconciled::Settled(receipt) => return Ok(receipt),
                Reconciled::Discarded(fresh) => sub = fresh,
            }
        }

        if sub.status != SubscriptionStatus::Active {
            return Err(ChargeError::NotDue {
                id: id.to_string(),
                reason: NotDueReason::NotActive { status: sub.status },
            });
        }
        if sub.periods_remaining == 0 {
            return Err(ChargeError::NotDue {
                id: id.to_string(),
                reason: NotDueReason::NoPeriodsRemaining,
            });
        }
        if now_ts < sub.next_charge_at {
            return Err(ChargeError::NotDue {
                id: id.to_string(),
                reason: NotDueReason::NotYetDue {
                    next_charge_at: sub.next_charge_at,
                },
            });
        }

        // Pre-charge balance snapshot. Without it there is nothing to
        // verify against, so a failed read aborts the attempt.
        let pre_balance = match self.ledger.balance(&sub.owner_source_account).await {
            Ok(b) => b,
            Err(e) => {
                self.record_failure(
                    &sub,
                    now_ts,
                    None,
                    format!("pre-charge balance read failed: {}", e),
                )
                .await?;
                return Err(ChargeError::Failed {
                    id: id.to_string(),
                    reason: ChargeFailure::BalanceRead(e),
                });
            }
        };

        // Audit the live allowance against what this charge needs. The
        // approved ceiling exists for exactly this comparison; catching
        // an exhausted or missing delegation here means no doomed
        // submission ever leaves the engine.
        let allowance = match self
            .ledger
            .allowance(&sub.owner_source_account, &sub.delegate_public)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                self.record_failure(&sub, now_ts, None, format!("allowance read failed: {}", e))
                    .await?;
                return Err(ChargeError::Failed {
                    id: id.to_string(),
                    reason: ChargeFailure::Ledger(e),
                });
            }
        };
        if allowance < sub.period_amount {
            self.record_failure(
                &sub,
                now_ts,
                None,
                format!(
                    "allowance {} below period amount {} (approved ceiling {})",
                    allowance, sub.period_amount, sub.approved_ceiling
                ),
            )
            .await?;
            return Err(ChargeError::Failed {
                id: id.to_string(),
                reason: ChargeFailure::Ledger(LedgerError::InsufficientAllowance),
            });
        }

        // Persist the attempt marker BEFORE submitting. From here on a
        // crash is recoverable: the marker carries the amount and the
        // pre-submission balance the next invocation needs.
        let (sub, attempt_idx) = self.append_pending(sub, now_ts, pre_balance).await?;

        // Submit exactly one period's amount. Transient-retry happens
        // inside the ledger client; a permanent error lands here at once.
        let delegate = DelegateKeypair::from_seed(&sub.delegate_secret.0);
        let tx_ref = match self
            .ledger
            .submit_delegated_transfer(
                &sub.owner_source_account,
                &self.config.merchant_account,
                &delegate,
                sub.period_amount,
            )
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                self.finalize_failed(&sub, attempt_idx, None, format!("submission failed: {}", e))
                    .await?;
                return Err(ChargeError::Failed {
                    id: id.to_string(),
                    reason: ChargeFailure::Ledger(e),
                });
            }
        };

        // Stash the reference on the open marker so a crash from here on
        // can reconcile by confirming the actual transaction.
        let sub = self.stash_tx_ref(sub, attempt_idx, &tx_ref).await?;

        // Wait for finality. The answer is advisory: a window that ends
        // still-Pending falls through to balance verification, which is
        // the actual acceptance rule.
        let mut confirmation = Confirmation::Pending;
        for attempt in 0..self.config.confirm_attempts {
            confirmation = match self.ledger.confirm(&tx_ref).await {
                Ok(c) => c,
                Err(e) => {
                    self.finalize_failed(
                        &sub,
                        attempt_idx,
                        Some(&tx_ref),
                        format!("confirmation query failed: {}", e),
                    )
                    .await?;
                    return Err(ChargeError::Failed {
                        id: id.to_string(),
                        reason: ChargeFailure::Ledger(e),
                    });
                }
            };
            match confirmation {
                Confirmation::Finalized | Confirmation::Failed => break,
                Confirmation::Pending => {
                    if attempt + 1 < self.config.confirm_attempts {
                        tokio::time::sleep(self.config.confirm_interval).await;
                    }
                }
            }
        }
        if confirmation == Confirmation::Failed {
            self.finalize_failed(
                &sub,
                attempt_idx,
                Some(&tx_ref),
                "transfer failed on ledger".to_string(),
            )
            .await?;
            return Err(ChargeError::Failed {
                id: id.to_string(),
                reason: ChargeFailure::ConfirmationFailed,
            });
        }

        // Verification: the charge settled only if the source balance
        // dropped by at least the charged amount. A tx_ref alone proves
        // nothing.
        let post_balance = match self.ledger.balance(&sub.owner_source_account).await {
            Ok(b) => b,
            Err(e) => {
                self.finalize_failed(
                    &sub,
                    attempt_idx,
                    Some(&tx_ref),
                    format!("post-charge balance read failed: {}", e),
                )
                .await?;
                return Err(ChargeError::Failed {
                    id: id.to_string(),
                    reason: ChargeFailure::BalanceRead(e),
                });
            }
        };
        let observed = pre_balance.saturating_sub(post_balance);
        if observed < sub.period_amount {
            self.finalize_failed(
                &sub,
                attempt_idx,
                Some(&tx_ref),
                format!(
                    "verification mismatch: balance moved {} of {} units",
                    observed, sub.period_amount
                ),
            )
            .await?;
            return Err(ChargeError::Failed {
                id: id.to_string(),
                reason: ChargeFailure::VerificationMismatch {
                    expected: sub.period_amount,
                    observed,
                },
            });
        }

        let committed = self
            .commit_success(&sub, attempt_idx, Some(&tx_ref), None)
            .await?;
        Ok(ChargeReceipt {
            id: committed.id.clone(),
            amount_charged: sub.period_amount,
            tx_ref: Some(tx_ref),
            periods_remaining: committed.periods_remaining,
            next_charge_at: committed.next_charge_at,
            status: committed.status,
        })
    }

    fn acquire(&self, id: &str) -> Result<InFlightGuard<'_>, ChargeError> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id.to_string()) {
            return Err(ChargeError::AlreadyInProgress { id: id.to_string() });
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            id: id.to_string(),
        })
    }

    /// Decide what an open marker left by an interrupted attempt means,
    /// from live ledger state.
    ///
    /// The finality query is advisory (a reported `Failed` is decisive);
    /// otherwise the balance delta since the marker's snapshot is the
    /// single source of truth, exactly as in the happy path. A settled
    /// prior attempt is committed as this period's charge rather than
    /// charging again.
    async fn reconcile(
        &self,
        sub: Subscription,
        idx: usize,
    ) -> Result<Reconciled, ChargeError> {
        let marker = sub.charge_history[idx].clone();

        if let Some(tx) = &marker.tx_ref {
            let tx_ref = TxRef(tx.clone());
            if let Ok(Confirmation::Failed) = self.ledger.confirm(&tx_ref).await {
                let fresh = self
                    .finalize_failed(
                        &sub,
                        idx,
                        Some(&tx_ref),
                        "interrupted transfer failed on ledger".to_string(),
                    )
                    .await?;
                return Ok(Reconciled::Discarded(fresh));
            }
        }

        let Some(pre_balance) = marker.pre_balance else {
            // No snapshot to verify against; nothing provable settled.
            let fresh = self
                .finalize_failed(
                    &sub,
                    idx,
                    None,
                    "interrupted attempt carried no balance snapshot".to_string(),
                )
                .await?;
            return Ok(Reconciled::Discarded(fresh));
        };

        let current = match self.ledger.balance(&sub.owner_source_account).await {
            Ok(b) => b,
            // Leave the marker open: with no balance read there is no
            // basis to either settle or discard the attempt.
            Err(e) => {
                return Err(ChargeError::Failed {
                    id: sub.id.clone(),
                    reason: ChargeFailure::BalanceRead(e),
                })
            }
        };

        let moved = pre_balance.saturating_sub(current);
        if moved >= marker.amount {
            let tx_ref = marker.tx_ref.clone().map(TxRef);
            let committed = self
                .commit_success(
                    &sub,
                    idx,
                    tx_ref.as_ref(),
                    Some("recovered after interruption: settlement verified from balance delta"),
                )
                .await?;
            return Ok(Reconciled::Settled(ChargeReceipt {
                id: committed.id.clone(),
                amount_charged: marker.amount,
                tx_ref,
                periods_remaining: committed.periods_remaining,
                next_charge_at: committed.next_charge_at,
                status: committed.status,
            }));
        }

        let fresh = self
            .finalize_failed(
                &sub,
                idx,
                marker.tx_ref.clone().map(TxRef).as_ref(),
                format!(
                    "interrupted attempt did not settle: balance moved {} of {} units",
                    moved, marker.amount
                ),
            )
            .await?;
        Ok(Reconciled::Discarded(fresh))
    }

    /// Durably open this attempt's marker before any submission.
    ///
    /// Returns the committed record and the marker's history index. A
    /// CAS conflict means a lifecycle transition raced in; the record is
    /// re-read and the due guards re-checked so a persisted revocation
    /// always wins before money moves.
    async fn append_pending(
        &self,
        loaded: Subscription,
        now_ts: i64,
        pre_balance: u64,
    ) -> Result<(Subscription, usize), ChargeError> {
        let mut current = loaded;

        for _ in 0..CAS_ATTEMPTS {
            if current.status != SubscriptionStatus::Active {
                return Err(ChargeError::NotDue {
                    id: current.id.clone(),
                    reason: NotDueReason::NotActive {
                        status: current.status,
                    },
                });
            }

            let mut updated = current.clone();
            updated.charge_history.push(ChargeAttempt {
                at: now_ts,
                amount: current.period_amount,
                outcome: ChargeOutcome::Pending,
                tx_ref: None,
                pre_balance: Some(pre_balance),
                detail: None,
            });
            let idx = updated.charge_history.len() - 1;

            match self.store.update(&current.id, current.version, updated).await {
                Ok(committed) => return Ok((committed, idx)),
                Err(StoreError::VersionConflict { .. }) => {
                    current = self
                        .store
                        .get(&current.id)
                        .await
                        .map_err(|e| map_store(&current.id, e))?;
                }
                Err(e) => return Err(ChargeError::Store(e)),
            }
        }

        Err(ChargeError::Store(StoreError::VersionConflict {
            id: current.id,
            expected_version: current.version,
        }))
    }

    /// Record the submission reference on the open marker, keeping it
    /// open. If this write is lost to a crash, reconciliation still
    /// works from the balance snapshot alone.
    async fn stash_tx_ref(
        &self,
        loaded: Subscription,
        idx: usize,
        tx_ref: &TxRef,
    ) -> Result<Subscription, ChargeError> {
        let mut current = loaded;

        for _ in 0..CAS_ATTEMPTS {
            let mut updated = current.clone();
            updated.charge_history[idx].tx_ref = Some(tx_ref.0.clone());

            match self.store.update(&current.id, current.version, updated).await {
                Ok(committed) => return Ok(committed),
                Err(StoreError::VersionConflict { .. }) => {
                    current = self
                        .store
                        .get(&current.id)
                        .await
                        .map_err(|e| map_store(&current.id, e))?;
                }
                Err(e) => return Err(ChargeError::Store(e)),
            }
        }

        Err(ChargeError::Store(StoreError::VersionConflict {
            id: current.id,
            expected_version: current.version,
        }))
    }

    /// Finalize the open marker as a verified success and advance the
    /// schedule, as one atomic update.
    ///
    /// `next_charge_at` advances from the *scheduled* time, not from
    /// `now`, so execution delay never accumulates into schedule drift.
    /// A CAS conflict means a lifecycle transition (revoke) raced in;
    /// the funds moved, so the attempt is re-applied on the fresh record
    /// with any terminal status preserved.
    async fn commit_success(
        &self,
        loaded: &Subscription,
        idx: usize,
        tx_ref: Option<&TxRef>,
        note: Option<&str>,
    ) -> Result<Subscription, ChargeError> {
        let scheduled_next = loaded.next_charge_at + loaded.period_secs;
        let mut current = loaded.clone();

        for _ in 0..CAS_ATTEMPTS {
            let mut updated = current.clone();
            {
                let entry = &mut updated.charge_history[idx];
                entry.outcome = ChargeOutcome::Success;
                if let Some(tx) = tx_ref {
                    entry.tx_ref = Some(tx.0.clone());
                }
                entry.detail = note.map(|n| n.to_string());
            }
            updated.periods_remaining = current.periods_remaining.saturating_sub(1);
            updated.next_charge_at = scheduled_next.max(current.next_charge_at);
            updated.status = match current.status {
                SubscriptionStatus::Revoked => SubscriptionStatus::Revoked,
                SubscriptionStatus::Expired => SubscriptionStatus::Expired,
                _ if updated.periods_remaining == 0 => SubscriptionStatus::Expired,
                _ => SubscriptionStatus::Active,
            };

            match self.store.update(&current.id, current.version, updated).await {
                Ok(committed) => return Ok(committed),
                Err(StoreError::VersionConflict { .. }) => {
                    current = self
                        .store
                        .get(&current.id)
                        .await
                        .map_err(|e| map_store(&current.id, e))?;
                }
                Err(e) => return Err(ChargeError::Store(e)),
            }
        }

        Err(ChargeError::Store(StoreError::VersionConflict {
            id: loaded.id.clone(),
            expected_version: loaded.version,
        }))
    }

    /// Finalize the open marker as failed without touching schedule
    /// state.
    async fn finalize_failed(
        &self,
        loaded: &Subscription,
        idx: usize,
        tx_ref: Option<&TxRef>,
        detail: String,
    ) -> Result<Subscription, ChargeError> {
        let mut current = loaded.clone();

        for _ in 0..CAS_ATTEMPTS {
            let mut updated = current.clone();
            {
                let entry = &mut updated.charge_history[idx];
                entry.outcome = ChargeOutcome::Failed;
                if let Some(tx) = tx_ref {
                    entry.tx_ref = Some(tx.0.clone());
                }
                entry.detail = Some(detail.clone());
            }

            match self.store.update(&current.id, current.version, updated).await {
                Ok(committed) => return Ok(committed),
                Err(StoreError::VersionConflict { .. }) => {
                    current = self
                        .store
                        .get(&current.id)
                        .await
                        .map_err(|e| map_store(&current.id, e))?;
                }
                Err(e) => return Err(ChargeError::Store(e)),
            }
        }

        Err(ChargeError::Store(StoreError::VersionConflict {
            id: loaded.id.clone(),
            expected_version: loaded.version,
        }))
    }

    /// Append an already-failed history entry for attempts that never
    /// got far enough to open a marker (pre-flight read failures).
    async fn record_failure(
        &self,
        loaded: &Subscription,
        now_ts: i64,
        tx_ref: Option<TxRef>,
        detail: String,
    ) -> Result<(), ChargeError> {
        let mut current = loaded.clone();

        for _ in 0..CAS_ATTEMPTS {
            let mut updated = current.clone();
            updated.charge_history.push(ChargeAttempt {
                at: now_ts,
                amount: loaded.period_amount,
                outcome: ChargeOutcome::Failed,
                tx_ref: tx_ref.as_ref().map(|t| t.0.clone()),
                pre_balance: None,
                detail: Some(detail.clone()),
            });

            match self.store.update(&current.id, current.version, updated).await {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => {
                    current = self
                        .store
                        .get(&current.id)
                        .await
                        .map_err(|e| map_store(&current.id, e))?;
                }
                Err(e) => return Err(ChargeError::Store(e)),
            }
        }

        Err(ChargeError::Store(StoreError::VersionConflict {
            id: loaded.id.clone(),
            expected_version: loaded.version,
        }))
    }
}

fn map_store(id: &str, e: StoreError) -> ChargeError {
    match e {
        StoreError::NotFound { .. } => ChargeError::NotFound { id: id.to_string() },
        other => ChargeError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use remit_ledger::MockLedger;
    use remit_store::{DelegateSecret, MemoryStore};
    use tokio::sync::Notify;

    const PERIOD: i64 = 2_592_000;
    const AMOUNT: u64 = 10_000;
    const T0: i64 = 1_700_000_000;

    fn at(ts: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(ts).unwrap()
    }

    fn active_record(delegate: &DelegateKeypair, id: &str, periods: u32) -> Subscription {
        Subscription {
            id: id.to_string(),
            owner_account: "owner".to_string(),
            owner_source_account: "owner-usdc".to_string(),
            delegate_secret: DelegateSecret(delegate.seed()),
            delegate_public: delegate.public().0,
            periods_remaining: periods,
            period_amount: AMOUNT,
            approved_ceiling: AMOUNT * u64::from(periods),
            period_secs: PERIOD,
            created_at: T0,
            next_charge_at: T0 + PERIOD,
            status: SubscriptionStatus::Active,
            charge_history: Vec::new(),
            version: 0,
        }
    }

    async fn seed_active(
        store: &MemoryStore,
        ledger: &MockLedger,
        id: &str,
        periods: u32,
    ) -> Subscription {
        let delegate = DelegateKeypair::generate();
        let sub = active_record(&delegate, id, periods);
        store.create(sub.clone()).await.unwrap();
        ledger.credit("owner-usdc", AMOUNT * u64::from(periods) * 2).await;
        ledger
            .approve_delegate("owner-usdc", &sub.delegate_public, sub.approved_ceiling)
            .await;
        sub
    }

    fn executor(store: Arc<MemoryStore>, ledger: Arc<MockLedger>) -> ChargeExecutor {
        let mut config = ExecutorConfig::new("merchant");
        config.confirm_interval = Duration::ZERO;
        ChargeExecutor::new(store, ledger, config)
    }

    #[tokio::test]
    async fn due_charge_settles_and_advances_schedule() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let sub = seed_active(&store, &ledger, "sub_a", 3).await;
        let exec = executor(store.clone(), ledger.clone());

        // Executed two days late: the schedule still advances from the
        // scheduled date, not from now.
        let late = sub.next_charge_at + 2 * 86_400;
        let receipt = exec.charge("sub_a", at(late)).await.unwrap();

        assert_eq!(receipt.amount_charged, AMOUNT);
        assert_eq!(receipt.periods_remaining, 2);
        assert_eq!(receipt.next_charge_at, sub.next_charge_at + PERIOD);
        assert_eq!(receipt.status, SubscriptionStatus::Active);
        assert!(receipt.tx_ref.is_some());

        let stored = store.get("sub_a").await.unwrap();
        assert_eq!(stored.charge_history.len(), 1);
        assert_eq!(stored.charge_history[0].outcome, ChargeOutcome::Success);
        assert!(stored.charge_history[0].tx_ref.is_some());
        assert_eq!(stored.charge_history[0].pre_balance, Some(AMOUNT * 6));
        assert!(stored.open_attempt().is_none());
        assert_eq!(ledger.balance("merchant").await.unwrap(), AMOUNT);
    }

    #[tokio::test]
    async fn charge_before_schedule_is_not_due_and_mutates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let sub = seed_active(&store, &ledger, "sub_a", 3).await;
        let exec = executor(store.clone(), ledger.clone());

        let err = exec.charge("sub_a", at(sub.next_charge_at - 1)).await.unwrap_err();
        assert!(matches!(
            err,
            ChargeError::NotDue {
                reason: NotDueReason::NotYetDue { .. },
                ..
            }
        ));

        let stored = store.get("sub_a").await.unwrap();
        assert!(stored.charge_history.is_empty());
        assert_eq!(stored.periods_remaining, 3);
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn pending_subscription_is_not_chargeable() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let sub = seed_active(&store, &ledger, "sub_a", 3).await;
        let mut pending = store.get("sub_a").await.unwrap();
        pending.status = SubscriptionStatus::Pending;
        store.update("sub_a", 0, pending).await.unwrap();
        let exec = executor(store.clone(), ledger);

        let err = exec.charge("sub_a", at(sub.next_charge_at)).await.unwrap_err();
        assert!(matches!(
            err,
            ChargeError::NotDue {
                reason: NotDueReason::NotActive { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let exec = executor(store, ledger);
        let err = exec.charge("sub_missing", at(T0)).await.unwrap_err();
        assert!(matches!(err, ChargeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn settlement_shortfall_fails_verification_and_freezes_schedule() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let sub = seed_active(&store, &ledger, "sub_a", 3).await;
        // The ledger will "finalize" while moving 1 unit short.
        ledger.set_settlement_shortfall(1).await;
        let exec = executor(store.clone(), ledger);

        let err = exec.charge("sub_a", at(sub.next_charge_at)).await.unwrap_err();
        assert!(matches!(
            err,
            ChargeError::Failed {
                reason: ChargeFailure::VerificationMismatch {
                    expected: AMOUNT,
                    observed,
                },
                ..
            } if observed == AMOUNT - 1
        ));

        let stored = store.get("sub_a").await.unwrap();
        assert_eq!(stored.periods_remaining, 3);
        assert_eq!(stored.next_charge_at, sub.next_charge_at);
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.charge_history.len(), 1);
        assert_eq!(stored.charge_history[0].outcome, ChargeOutcome::Failed);
        // The tx_ref is kept for the audit trail even though the charge failed.
        assert!(stored.charge_history[0].tx_ref.is_some());
        assert!(stored.open_attempt().is_none());
    }

    #[tokio::test]
    async fn exhausted_allowance_fails_the_preflight_audit() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let sub = seed_active(&store, &ledger, "sub_a", 3).await;
        // The on-ledger delegation no longer covers a period.
        ledger.approve_delegate("owner-usdc", &sub.delegate_public, 0).await;
        let exec = executor(store.clone(), ledger.clone());

        let err = exec.charge("sub_a", at(sub.next_charge_at)).await.unwrap_err();
        assert!(matches!(
            err,
            ChargeError::Failed {
                reason: ChargeFailure::Ledger(LedgerError::InsufficientAllowance),
                ..
            }
        ));

        // Nothing was submitted, and the subscription is flagged for an
        // operator rather than auto-revoked.
        let stored = store.get("sub_a").await.unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.charge_history.len(), 1);
        assert_eq!(stored.charge_history[0].outcome, ChargeOutcome::Failed);
        assert!(stored.charge_history[0].tx_ref.is_none());
        assert_eq!(ledger.balance("owner-usdc").await.unwrap(), AMOUNT * 6);
    }

    #[tokio::test]
    async fn failed_confirmation_records_failure() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let sub = seed_active(&store, &ledger, "sub_a", 3).await;
        ledger.fail_confirmations(true).await;
        let exec = executor(store.clone(), ledger);

        let err = exec.charge("sub_a", at(sub.next_charge_at)).await.unwrap_err();
        assert!(matches!(
            err,
            ChargeError::Failed {
                reason: ChargeFailure::ConfirmationFailed,
                ..
            }
        ));
        let stored = store.get("sub_a").await.unwrap();
        assert_eq!(stored.periods_remaining, 3);
        assert!(stored.open_attempt().is_none());
    }

    #[tokio::test]
    async fn slow_finality_still_settles_via_balance_verification() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let sub = seed_active(&store, &ledger, "sub_a", 3).await;
        // More pending answers than the executor will poll for.
        ledger.set_pending_confirmations(100).await;
        let exec = executor(store.clone(), ledger);

        let receipt = exec.charge("sub_a", at(sub.next_charge_at)).await.unwrap();
        assert_eq!(receipt.periods_remaining, 2);
    }

    #[tokio::test]
    async fn balance_read_failure_aborts_before_submission() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let delegate = DelegateKeypair::generate();
        // Record exists, but its source account does not exist on-ledger.
        let mut sub = active_record(&delegate, "sub_a", 1);
        sub.owner_source_account = "ghost-account".to_string();
        sub.next_charge_at = T0;
        store.create(sub).await.unwrap();
        let exec = executor(store.clone(), ledger);

        let err = exec.charge("sub_a", at(T0)).await.unwrap_err();
        assert!(matches!(
            err,
            ChargeError::Failed {
                reason: ChargeFailure::BalanceRead(_),
                ..
            }
        ));
        let stored = store.get("sub_a").await.unwrap();
        assert_eq!(stored.charge_history.len(), 1);
        assert_eq!(stored.charge_history[0].outcome, ChargeOutcome::Failed);
        assert_eq!(stored.periods_remaining, 1);
    }

    #[tokio::test]
    async fn settled_interrupted_attempt_is_reconciled_without_double_charge() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let delegate = DelegateKeypair::generate();

        ledger.credit("owner-usdc", AMOUNT * 4).await;
        ledger
            .approve_delegate("owner-usdc", &delegate.public().0, AMOUNT * 2)
            .await;

        // Replay the crashed process: its transfer settled on-ledger,
        // but it died before finalizing the marker or the schedule.
        let pre_balance = ledger.balance("owner-usdc").await.unwrap();
        let tx = ledger
            .submit_delegated_transfer("owner-usdc", "merchant", &delegate, AMOUNT)
            .await
            .unwrap();

        let mut sub = active_record(&delegate, "sub_a", 2);
        sub.next_charge_at = T0;
        sub.charge_history.push(ChargeAttempt {
            at: T0,
            amount: AMOUNT,
            outcome: ChargeOutcome::Pending,
            tx_ref: Some(tx.0.clone()),
            pre_balance: Some(pre_balance),
            detail: None,
        });
        store.create(sub).await.unwrap();

        let exec = executor(store.clone(), ledger.clone());
        let receipt = exec.charge("sub_a", at(T0 + 60)).await.unwrap();

        // The prior transfer IS this period's charge: one period
        // consumed, schedule advanced, and no second transfer happened.
        assert_eq!(receipt.periods_remaining, 1);
        assert_eq!(receipt.tx_ref, Some(tx.clone()));
        assert_eq!(receipt.next_charge_at, T0 + PERIOD);
        assert_eq!(ledger.balance("merchant").await.unwrap(), AMOUNT);
        assert_eq!(ledger.balance("owner-usdc").await.unwrap(), AMOUNT * 3);

        let stored = store.get("sub_a").await.unwrap();
        assert_eq!(stored.charge_history.len(), 1);
        assert_eq!(stored.charge_history[0].outcome, ChargeOutcome::Success);
        assert_eq!(stored.charge_history[0].tx_ref, Some(tx.0));
        assert!(stored.open_attempt().is_none());
    }

    #[tokio::test]
    async fn unsettled_interrupted_attempt_is_discarded_then_recharged() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let delegate = DelegateKeypair::generate();

        ledger.credit("owner-usdc", AMOUNT * 4).await;
        ledger
            .approve_delegate("owner-usdc", &delegate.public().0, AMOUNT * 2)
            .await;

        // The crashed process opened its marker but never submitted.
        let mut sub = active_record(&delegate, "sub_a", 2);
        sub.next_charge_at = T0;
        sub.charge_history.push(ChargeAttempt {
            at: T0,
            amount: AMOUNT,
            outcome: ChargeOutcome::Pending,
            tx_ref: None,
            pre_balance: Some(AMOUNT * 4),
            detail: None,
        });
        store.create(sub).await.unwrap();

        let exec = executor(store.clone(), ledger.clone());
        let receipt = exec.charge("sub_a", at(T0 + 60)).await.unwrap();
        assert_eq!(receipt.periods_remaining, 1);

        // The stale marker was closed as failed, then one fresh attempt
        // charged the period: exactly one transfer total.
        let stored = store.get("sub_a").await.unwrap();
        assert_eq!(stored.charge_history.len(), 2);
        assert_eq!(stored.charge_history[0].outcome, ChargeOutcome::Failed);
        assert!(stored.charge_history[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("did not settle"));
        assert_eq!(stored.charge_history[1].outcome, ChargeOutcome::Success);
        assert_eq!(ledger.balance("merchant").await.unwrap(), AMOUNT);
        assert_eq!(stored.periods_remaining, 1);
    }

    /// Ledger wrapper that parks the Nth balance read until released,
    /// holding a charge mid-flight deterministically.
    struct ParkedLedger {
        inner: MockLedger,
        entered: Notify,
        release: Notify,
        /// 1-based balance-call index to park on.
        park_on_call: u32,
        calls: std::sync::atomic::AtomicU32,
    }

    impl ParkedLedger {
        fn new(inner: MockLedger, park_on_call: u32) -> Self {
            Self {
                inner,
                entered: Notify::new(),
                release: Notify::new(),
                park_on_call,
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl remit_ledger::LedgerClient for ParkedLedger {
        async fn balance(&self, account: &str) -> Result<u64, LedgerError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if n == self.park_on_call {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.balance(account).await
        }

        async fn allowance(
            &self,
            source_account: &str,
            delegate_public: &str,
        ) -> Result<u64, LedgerError> {
            self.inner.allowance(source_account, delegate_public).await
        }

        async fn submit_delegated_transfer(
            &self,
            source_account: &str,
            destination_account: &str,
            delegate: &DelegateKeypair,
            amount: u64,
        ) -> Result<TxRef, LedgerError> {
            self.inner
                .submit_delegated_transfer(source_account, destination_account, delegate, amount)
                .await
        }

        async fn confirm(&self, tx_ref: &TxRef) -> Result<Confirmation, LedgerError> {
            self.inner.confirm(tx_ref).await
        }
    }

    #[tokio::test]
    async fn concurrent_charge_for_same_id_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        let mock = MockLedger::new();
        let delegate = DelegateKeypair::generate();
        let mut sub = active_record(&delegate, "sub_a", 2);
        sub.next_charge_at = T0;
        store.create(sub).await.unwrap();
        mock.credit("owner-usdc", AMOUNT * 4).await;
        mock.approve_delegate("owner-usdc", &delegate.public().0, AMOUNT * 2)
            .await;

        let ledger = Arc::new(ParkedLedger::new(mock, 1));
        let mut config = ExecutorConfig::new("merchant");
        config.confirm_interval = Duration::ZERO;
        let exec = Arc::new(ChargeExecutor::new(store.clone(), ledger.clone(), config));

        // First charge parks inside its pre-charge balance read.
        let first = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.charge("sub_a", at(T0)).await })
        };
        ledger.entered.notified().await;

        // Second charge must observe the in-flight attempt and fail fast.
        let err = exec.charge("sub_a", at(T0)).await.unwrap_err();
        assert!(matches!(err, ChargeError::AlreadyInProgress { .. }));

        ledger.release.notify_one();
        let receipt = first.await.unwrap().unwrap();
        assert_eq!(receipt.periods_remaining, 1);

        // Exactly one success entry; one period consumed, never two.
        let stored = store.get("sub_a").await.unwrap();
        assert_eq!(stored.charge_history.len(), 1);
        assert_eq!(stored.periods_remaining, 1);
    }

    #[tokio::test]
    async fn revoke_racing_a_charge_wins_the_status() {
        let store = Arc::new(MemoryStore::new());
        let mock = MockLedger::new();
        let delegate = DelegateKeypair::generate();
        let mut sub = active_record(&delegate, "sub_a", 2);
        sub.next_charge_at = T0;
        store.create(sub).await.unwrap();
        mock.credit("owner-usdc", AMOUNT * 4).await;
        mock.approve_delegate("owner-usdc", &delegate.public().0, AMOUNT * 2)
            .await;

        // Park the charge inside its SECOND balance read: after the
        // transfer settled, before the success commit.
        let ledger = Arc::new(ParkedLedger::new(mock, 2));
        let mut config = ExecutorConfig::new("merchant");
        config.confirm_interval = Duration::ZERO;
        let exec = Arc::new(ChargeExecutor::new(store.clone(), ledger.clone(), config));

        let charging = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.charge("sub_a", at(T0)).await })
        };
        ledger.entered.notified().await;

        // Revoke commits while the charge is mid-flight.
        let mut revoked = store.get("sub_a").await.unwrap();
        let version = revoked.version;
        revoked.status = SubscriptionStatus::Revoked;
        store.update("sub_a", version, revoked).await.unwrap();

        ledger.release.notify_one();
        let receipt = charging.await.unwrap().unwrap();

        // The transfer settled (no rollback is possible), so the verified
        // charge is recorded, but the revocation holds.
        assert_eq!(receipt.status, SubscriptionStatus::Revoked);
        let stored = store.get("sub_a").await.unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Revoked);
        assert_eq!(stored.periods_remaining, 1);
        assert_eq!(stored.charge_history.len(), 1);
        assert_eq!(stored.charge_history[0].outcome, ChargeOutcome::Success);
    }
}
