/// All errors a `LedgerClient` can return.
///
/// Two families: transient failures (network, timeout) that callers may
/// retry with backoff, and permanent failures that must surface
/// immediately. `is_transient` is the split the retry policy keys on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// Network-level failure reaching the ledger. Retryable.
    #[error("ledger transport error: {message}")]
    Transport { message: String },

    /// The ledger did not answer within the deadline. Retryable.
    #[error("ledger request timed out: {message}")]
    Timeout { message: String },

    /// The delegate credential was rejected (unknown, revoked on-ledger,
    /// or bad signature). Not retried.
    #[error("delegate credential rejected")]
    InvalidCredential,

    /// The delegated allowance cannot cover the requested amount.
    #[error("insufficient delegated allowance")]
    InsufficientAllowance,

    /// The source account holds less than the requested amount.
    #[error("insufficient funds in source account")]
    InsufficientFunds,

    /// The addressed account does not exist on the ledger.
    #[error("account not found: {account}")]
    AccountNotFound { account: String },

    /// The ledger rejected the submission for another permanent reason
    /// (expired anchor, malformed instruction).
    #[error("submission rejected: {message}")]
    Rejected { message: String },

    /// The gateway answered with something we cannot interpret.
    #[error("ledger protocol error: {message}")]
    Protocol { message: String },
}

impl LedgerError {
    /// Whether the retry policy may re-attempt the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Transport { .. } | LedgerError::Timeout { .. }
        )
    }
}
