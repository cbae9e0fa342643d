/// All errors that can be returned by a SubscriptionStore implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No subscription with the given id exists.
    #[error("subscription not found: {id}")]
    NotFound { id: String },

    /// A subscription with this id already exists.
    #[error("subscription already exists: {id}")]
    AlreadyExists { id: String },

    /// Compare-and-swap conflict: another caller updated the record
    /// concurrently. The expected version was not found.
    #[error("version conflict on subscription {id}: expected version {expected_version}")]
    VersionConflict { id: String, expected_version: u64 },

    /// A backend I/O error (file read/write, serialization). Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
