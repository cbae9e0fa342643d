mod client;
mod credential;
mod error;
mod http;
mod mock;
mod retry;
mod units;

pub use client::{Confirmation, LedgerClient, TxRef};
pub use credential::{decode_public, DelegateKeypair, DelegatePublic};
pub use error::LedgerError;
pub use http::HttpLedgerClient;
pub use mock::MockLedger;
pub use retry::RetryPolicy;
pub use units::{from_base_units, to_base_units};
