use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a subscription.
///
/// `Pending` is the only entry state. The only transitions are:
/// `Pending → Active` (externally confirmed approval), `Active → Expired`
/// (periods exhausted), and `Pending|Active → Revoked` (cancellation).
/// `Expired` and `Revoked` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Grant recorded; payer approval not yet confirmed on-ledger.
    Pending,
    /// Approval confirmed; chargeable when due.
    Active,
    /// All prepaid periods consumed (terminal).
    Expired,
    /// Cancelled by the owner or an operator (terminal).
    Revoked,
}

/// Outcome of a single charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeOutcome {
    Success,
    Failed,
    /// The attempt's open marker, written durably before submission and
    /// finalized to `Success` or `Failed` exactly once. A crash leaves
    /// it open for the next invocation to reconcile against the ledger.
    Pending,
}

/// One entry in a subscription's append-only charge history.
///
/// Settled entries (`success`/`failed`) are immutable; a retried charge
/// appends a new entry rather than mutating a prior one. The single
/// open `pending` entry is the exception: it is the in-progress
/// attempt, finalized in place when that attempt resolves. At most one
/// entry is open at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeAttempt {
    /// Unix seconds.
    pub at: i64,
    /// Amount attempted, in the asset's smallest indivisible unit.
    pub amount: u64,
    pub outcome: ChargeOutcome,
    /// Ledger transaction reference, when a submission was made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<String>,
    /// Source balance observed immediately before submission. Lets a
    /// crash-retry decide from the balance delta alone whether the
    /// attempt settled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_balance: Option<u64>,
    /// Failure detail for operator review. Never credential material.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The private signing seed of a subscription's delegate credential.
///
/// Exclusively owned by the subscription record: generated once at grant
/// issuance, never rotated, never reused across subscriptions. Must not
/// appear on any response surface or in logs; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateSecret(pub [u8; 32]);

impl fmt::Debug for DelegateSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DelegateSecret(..)")
    }
}

/// A delegated-authority grant: the engine's record of one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Opaque unique identifier, immutable after creation.
    pub id: String,
    /// The payer's identity account (may be a smart-account address).
    pub owner_account: String,
    /// The asset-holding sub-account funds are pulled from.
    pub owner_source_account: String,
    /// Private delegate signing seed. See [`DelegateSecret`].
    pub delegate_secret: DelegateSecret,
    /// Base64-encoded delegate verifying key, safe to expose.
    pub delegate_public: String,
    /// Prepaid periods left. Decremented only on a verified charge.
    pub periods_remaining: u32,
    /// Fixed amount charged per period, in smallest units.
    pub period_amount: u64,
    /// Aggregate amount the delegate is authorized to move over the
    /// subscription's lifetime. Fixed at creation; audit-only.
    pub approved_ceiling: u64,
    /// Billing period length in seconds.
    pub period_secs: i64,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds. Zero while pending; set on activation; advanced by
    /// exactly one period per verified charge. Monotone non-decreasing.
    pub next_charge_at: i64,
    pub status: SubscriptionStatus,
    pub charge_history: Vec<ChargeAttempt>,
    /// Record version for compare-and-swap updates.
    pub version: u64,
}

impl Subscription {
    /// Whether a charge attempt is permitted at `now` (unix seconds).
    pub fn is_due(&self, now: i64) -> bool {
        self.status == SubscriptionStatus::Active
            && self.periods_remaining > 0
            && now >= self.next_charge_at
    }

    /// Index of the open (`pending`) history entry, if an attempt was
    /// interrupted before it could be finalized.
    pub fn open_attempt(&self) -> Option<usize> {
        self.charge_history
            .iter()
            .rposition(|a| a.outcome == ChargeOutcome::Pending)
    }
}
