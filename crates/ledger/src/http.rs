//! HTTP ledger gateway client.
//!
//! Talks to a REST gateway in front of the ledger using `ureq` (sync)
//! wrapped in `tokio::task::spawn_blocking` to avoid blocking the async
//! runtime. One `ureq::Agent` is shared across calls for connection
//! reuse. Every operation runs under the configured [`RetryPolicy`].
//!
//! Gateway endpoints:
//! - `GET  {base}/v1/accounts/{account}/balance` → `{"balance": u64}`
//! - `GET  {base}/v1/accounts/{account}/allowances/{delegate}` → `{"allowance": u64}`
//! - `GET  {base}/v1/anchor` → `{"reference": "..."}`
//! - `POST {base}/v1/transfers` → `{"tx_ref": "..."}`
//! - `GET  {base}/v1/transfers/{tx_ref}` → `{"status": "finalized"|"pending"|"failed"}`

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::client::{Confirmation, LedgerClient, TxRef};
use crate::credential::DelegateKeypair;
use crate::error::LedgerError;
use crate::retry::RetryPolicy;

/// A finality anchor is only valid for a short window after it is
/// fetched; the network rejects submissions built on older anchors as
/// expired.
const ANCHOR_MAX_AGE: Duration = Duration::from_secs(30);

/// A recent block reference to anchor a submission to.
struct FinalityAnchor {
    reference: String,
    fetched_at: Instant,
}

impl FinalityAnchor {
    fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() > ANCHOR_MAX_AGE
    }
}

/// `LedgerClient` backed by an HTTP gateway.
///
/// Fee policy: the delegate key is the fee payer for submitted
/// transfers (`"fee_payer": "delegate"` in the submission body), so each
/// delegate needs a small native-asset balance.
pub struct HttpLedgerClient {
    base_url: String,
    agent: ureq::Agent,
    retry: RetryPolicy,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_retry(base_url, RetryPolicy::default())
    }

    pub fn with_retry(base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: ureq::Agent::new_with_defaults(),
            retry,
        }
    }

    /// Single-attempt JSON GET, run on the blocking pool.
    async fn get_json(&self, url: String) -> Result<serde_json::Value, LedgerError> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || {
            let response = agent.get(&url).call().map_err(map_ureq_error)?;
            response
                .into_body()
                .read_json()
                .map_err(|e| LedgerError::Protocol {
                    message: format!("invalid JSON from gateway: {}", e),
                })
        })
        .await
        .map_err(|e| LedgerError::Transport {
            message: format!("task join error: {}", e),
        })?
    }

    /// Read a required unsigned integer field out of a gateway response.
    fn require_u64(value: &serde_json::Value, field: &str) -> Result<u64, LedgerError> {
        value
            .get(field)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| LedgerError::Protocol {
                message: format!("gateway response missing '{}'", field),
            })
    }
}

/// Map a `ureq` failure into the ledger error taxonomy.
///
/// Non-2xx statuses surface as `ureq::Error::StatusCode`; everything
/// else (DNS, connect, TLS, timeout) is transport-level and transient.
fn map_ureq_error(e: ureq::Error) -> LedgerError {
    match e {
        ureq::Error::StatusCode(code) => map_status(code),
        other => LedgerError::Transport {
            message: other.to_string(),
        },
    }
}

fn map_status(code: u16) -> LedgerError {
    match code {
        401 | 403 => LedgerError::InvalidCredential,
        404 => LedgerError::AccountNotFound {
            account: "(from gateway 404)".to_string(),
        },
        409 => LedgerError::InsufficientAllowance,
        402 => LedgerError::InsufficientFunds,
        408 | 429 => LedgerError::Timeout {
            message: format!("gateway status {}", code),
        },
        500..=599 => LedgerError::Transport {
            message: format!("gateway status {}", code),
        },
        other => LedgerError::Rejected {
            message: format!("gateway status {}", other),
        },
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn balance(&self, account: &str) -> Result<u64, LedgerError> {
        let url = format!("{}/v1/accounts/{}/balance", self.base_url, account);
        self.retry
            .run(|| async {
                let body = self.get_json(url.clone()).await.map_err(|e| match e {
                    LedgerError::AccountNotFound { .. } => LedgerError::AccountNotFound {
                        account: account.to_string(),
                    },
                    other => other,
                })?;
                Self::require_u64(&body, "balance")
            })
            .await
    }

    async fn allowance(
        &self,
        source_account: &str,
        delegate_public: &str,
    ) -> Result<u64, LedgerError> {
        let url = format!(
            "{}/v1/accounts/{}/allowances/{}",
            self.base_url, source_account, delegate_public
        );
        self.retry
            .run(|| async {
                let body = self.get_json(url.clone()).await?;
                Self::require_u64(&body, "allowance")
            })
            .await
    }

    async fn submit_delegated_transfer(
        &self,
        source_account: &str,
        destination_account: &str,
        delegate: &DelegateKeypair,
        amount: u64,
    ) -> Result<TxRef, LedgerError> {
        let url = format!("{}/v1/transfers", self.base_url);
        let anchor_url = format!("{}/v1/anchor", self.base_url);

        self.retry
            .run(|| async {
                // Fresh anchor for every attempt: anchors must never be
                // reused across attempts, let alone cached.
                let anchor_body = self.get_json(anchor_url.clone()).await?;
                let reference = anchor_body
                    .get("reference")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| LedgerError::Protocol {
                        message: "gateway anchor response missing 'reference'".to_string(),
                    })?
                    .to_string();
                let anchor = FinalityAnchor {
                    reference,
                    fetched_at: Instant::now(),
                };

                let message = format!(
                    "transfer|{}|{}|{}|{}",
                    source_account, destination_account, amount, anchor.reference
                );
                let signature = delegate.sign_base64(message.as_bytes());

                if anchor.is_expired() {
                    // The blocking pool stalled long enough that the
                    // network would reject this as expired anyway.
                    return Err(LedgerError::Transport {
                        message: "finality anchor expired before submission".to_string(),
                    });
                }

                let body = serde_json::json!({
                    "source": source_account,
                    "destination": destination_account,
                    "amount": amount,
                    "anchor": anchor.reference,
                    "delegate": delegate.public().0,
                    "signature": signature,
                    "fee_payer": "delegate",
                });

                let agent = self.agent.clone();
                let url = url.clone();
                let response = tokio::task::spawn_blocking(move || {
                    let response = agent.post(&url).send_json(&body).map_err(map_ureq_error)?;
                    response
                        .into_body()
                        .read_json::<serde_json::Value>()
                        .map_err(|e| LedgerError::Protocol {
                            message: format!("invalid JSON from gateway: {}", e),
                        })
                })
                .await
                .map_err(|e| LedgerError::Transport {
                    message: format!("task join error: {}", e),
                })??;

                let tx_ref = response
                    .get("tx_ref")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| LedgerError::Protocol {
                        message: "gateway transfer response missing 'tx_ref'".to_string(),
                    })?;
                Ok(TxRef(tx_ref.to_string()))
            })
            .await
    }

    async fn confirm(&self, tx_ref: &TxRef) -> Result<Confirmation, LedgerError> {
        let url = format!("{}/v1/transfers/{}", self.base_url, tx_ref.0);
        self.retry
            .run(|| async {
                let body = self.get_json(url.clone()).await?;
                let status = body
                    .get("status")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| LedgerError::Protocol {
                        message: "gateway transfer status missing 'status'".to_string(),
                    })?;
                match status {
                    "finalized" => Ok(Confirmation::Finalized),
                    "pending" => Ok(Confirmation::Pending),
                    "failed" => Ok(Confirmation::Failed),
                    other => Err(LedgerError::Protocol {
                        message: format!("unknown transfer status '{}'", other),
                    }),
                }
            })
            .await
    }
}
