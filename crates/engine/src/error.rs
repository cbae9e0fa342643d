use std::fmt;

use remit_ledger::LedgerError;
use remit_store::{StoreError, SubscriptionStatus};

/// Why a charge request was rejected before touching the ledger.
///
/// Not an alarm condition: sweeps hit these routinely when time passes
/// between listing and execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotDueReason {
    /// The subscription is not in `Active` status.
    NotActive { status: SubscriptionStatus },
    /// All prepaid periods have been consumed.
    NoPeriodsRemaining,
    /// The schedule has not been reached yet.
    NotYetDue { next_charge_at: i64 },
}

impl fmt::Display for NotDueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotDueReason::NotActive { status } => write!(f, "status is {:?}", status),
            NotDueReason::NoPeriodsRemaining => f.write_str("no periods remaining"),
            NotDueReason::NotYetDue { next_charge_at } => {
                write!(f, "next charge at {} has not been reached", next_charge_at)
            }
        }
    }
}

/// Why a charge attempt that reached the ledger did not settle.
///
/// Every variant here corresponds to a `failed` entry appended to the
/// subscription's charge history.
#[derive(Debug)]
pub enum ChargeFailure {
    /// Submission failed: a permanent ledger error, or a transient one
    /// after the retry budget was exhausted.
    Ledger(LedgerError),
    /// A pre- or post-charge balance read failed.
    BalanceRead(LedgerError),
    /// The ledger reported the submitted transfer as failed.
    ConfirmationFailed,
    /// The transfer was accepted but the source balance did not drop by
    /// at least the charged amount. Never treated as success.
    VerificationMismatch { expected: u64, observed: u64 },
}

impl fmt::Display for ChargeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargeFailure::Ledger(e) => write!(f, "ledger error: {}", e),
            ChargeFailure::BalanceRead(e) => write!(f, "balance read failed: {}", e),
            ChargeFailure::ConfirmationFailed => f.write_str("transfer failed on ledger"),
            ChargeFailure::VerificationMismatch { expected, observed } => write!(
                f,
                "balance moved {} of expected {} units",
                observed, expected
            ),
        }
    }
}

/// Errors surfaced by [`ChargeExecutor::charge`](crate::ChargeExecutor::charge).
///
/// Callers always get a definitive outcome: nothing escapes as an
/// unhandled ledger fault, and no variant leaves the record in a silent
/// partial state.
#[derive(Debug, thiserror::Error)]
pub enum ChargeError {
    #[error("subscription not found: {id}")]
    NotFound { id: String },

    #[error("subscription {id} is not due: {reason}")]
    NotDue { id: String, reason: NotDueReason },

    /// Another charge attempt for the same id is in flight.
    #[error("charge already in progress for {id}")]
    AlreadyInProgress { id: String },

    /// The attempt failed; a `failed` history entry was recorded and no
    /// schedule state advanced.
    #[error("charge failed for {id}: {reason}")]
    Failed { id: String, reason: ChargeFailure },

    #[error(transparent)]
    Store(StoreError),
}

/// Errors surfaced by the [`GrantIssuer`](crate::GrantIssuer).
#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("invalid grant request: {message}")]
    InvalidRequest { message: String },

    #[error("approved ceiling overflows: {period_amount} x {periods}")]
    CeilingOverflow { period_amount: u64, periods: u32 },

    #[error("subscription not found: {id}")]
    NotFound { id: String },

    #[error("subscription {id} is {status:?}; transition not allowed")]
    InvalidStatus {
        id: String,
        status: SubscriptionStatus,
    },

    #[error(transparent)]
    Store(StoreError),
}
