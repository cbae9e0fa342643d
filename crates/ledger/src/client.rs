use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credential::DelegateKeypair;
use crate::error::LedgerError;

/// Reference to a submitted ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef(pub String);

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Finality state of a submitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Irreversibly applied by the ledger.
    Finalized,
    /// Accepted but not yet final.
    Pending,
    /// Dropped or rejected after submission.
    Failed,
}

/// The narrow interface the engine needs against the external ledger.
///
/// Implementations wrap transport details; they make no durability
/// promises beyond what the ledger itself reports. Submission acceptance
/// is NOT proof of transfer: the charge executor independently verifies
/// balance movement, so nothing here may be treated as authoritative for
/// state transitions.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current balance of `account`, in smallest units.
    async fn balance(&self, account: &str) -> Result<u64, LedgerError>;

    /// Remaining delegated allowance granted by `source_account` to the
    /// delegate identified by `delegate_public` (base64 verifying key).
    async fn allowance(
        &self,
        source_account: &str,
        delegate_public: &str,
    ) -> Result<u64, LedgerError>;

    /// Build, sign, and submit a delegate-authorized transfer of `amount`
    /// from `source_account` to `destination_account`.
    ///
    /// Implementations must fetch a fresh finality anchor immediately
    /// before signing. A stale anchor makes the submission rejected as
    /// expired, so anchor fetch and submission belong to the same
    /// attempt, never cached across attempts.
    async fn submit_delegated_transfer(
        &self,
        source_account: &str,
        destination_account: &str,
        delegate: &DelegateKeypair,
        amount: u64,
    ) -> Result<TxRef, LedgerError>;

    /// Finality state of a previously submitted transfer.
    async fn confirm(&self, tx_ref: &TxRef) -> Result<Confirmation, LedgerError>;
}
