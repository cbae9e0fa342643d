//! In-process mock ledger.
//!
//! Backs the engine test suite and the CLI's `--ledger mock` demo mode.
//! Holds balances and delegated allowances in memory and supports fault
//! injection: transient submission failures, delayed finality, failed
//! confirmations, and settlement shortfalls (the transfer "finalizes"
//! but moves less than requested, the case the executor's balance
//! verification exists to catch).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::client::{Confirmation, LedgerClient, TxRef};
use crate::credential::DelegateKeypair;
use crate::error::LedgerError;

#[derive(Default)]
struct MockState {
    balances: HashMap<String, u64>,
    /// (source_account, delegate_public) → remaining allowance.
    allowances: HashMap<(String, String), u64>,
    /// tx_ref → remaining `Pending` confirmations before `Finalized`.
    transfers: HashMap<String, u32>,
    next_ref: u64,
    transient_submit_failures: u32,
    settlement_shortfall: u64,
    pending_confirmations: u32,
    fail_confirmations: bool,
}

/// `LedgerClient` over in-memory state.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add funds to an account.
    pub async fn credit(&self, account: &str, amount: u64) {
        let mut state = self.state.lock().await;
        *state.balances.entry(account.to_string()).or_insert(0) += amount;
    }

    /// Record a delegated allowance, as the payer's approval transaction
    /// would on the real ledger.
    pub async fn approve_delegate(&self, source_account: &str, delegate_public: &str, ceiling: u64) {
        let mut state = self.state.lock().await;
        state
            .allowances
            .insert((source_account.to_string(), delegate_public.to_string()), ceiling);
    }

    /// Make the next `n` submissions fail with a transport error.
    pub async fn fail_next_submissions(&self, n: u32) {
        self.state.lock().await.transient_submit_failures = n;
    }

    /// Finalize transfers while silently moving `shortfall` fewer units
    /// than requested.
    pub async fn set_settlement_shortfall(&self, shortfall: u64) {
        self.state.lock().await.settlement_shortfall = shortfall;
    }

    /// Answer `Pending` this many times per transfer before `Finalized`.
    pub async fn set_pending_confirmations(&self, n: u32) {
        self.state.lock().await.pending_confirmations = n;
    }

    /// Make every confirmation report `Failed`.
    pub async fn fail_confirmations(&self, fail: bool) {
        self.state.lock().await.fail_confirmations = fail;
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn balance(&self, account: &str) -> Result<u64, LedgerError> {
        let state = self.state.lock().await;
        state
            .balances
            .get(account)
            .copied()
            .ok_or_else(|| LedgerError::AccountNotFound {
                account: account.to_string(),
            })
    }

    async fn allowance(
        &self,
        source_account: &str,
        delegate_public: &str,
    ) -> Result<u64, LedgerError> {
        let state = self.state.lock().await;
        state
            .allowances
            .get(&(source_account.to_string(), delegate_public.to_string()))
            .copied()
            .ok_or(LedgerError::InvalidCredential)
    }

    async fn submit_delegated_transfer(
        &self,
        source_account: &str,
        destination_account: &str,
        delegate: &DelegateKeypair,
        amount: u64,
    ) -> Result<TxRef, LedgerError> {
        let mut state = self.state.lock().await;

        if state.transient_submit_failures > 0 {
            state.transient_submit_failures -= 1;
            return Err(LedgerError::Transport {
                message: "injected transport failure".to_string(),
            });
        }

        let allowance_key = (source_account.to_string(), delegate.public().0);
        let allowance = *state
            .allowances
            .get(&allowance_key)
            .ok_or(LedgerError::InvalidCredential)?;
        if allowance < amount {
            return Err(LedgerError::InsufficientAllowance);
        }

        let balance = *state.balances.get(source_account).ok_or_else(|| {
            LedgerError::AccountNotFound {
                account: source_account.to_string(),
            }
        })?;
        if balance < amount {
            return Err(LedgerError::InsufficientFunds);
        }

        // Settle. A configured shortfall models a transfer the network
        // "accepts" while moving less than requested.
        let moved = amount.saturating_sub(state.settlement_shortfall);
        state
            .balances
            .insert(source_account.to_string(), balance - moved);
        *state
            .balances
            .entry(destination_account.to_string())
            .or_insert(0) += moved;
        state.allowances.insert(allowance_key, allowance - amount);

        state.next_ref += 1;
        let tx_ref = format!("mtx-{:06}", state.next_ref);
        let pending = state.pending_confirmations;
        state.transfers.insert(tx_ref.clone(), pending);
        Ok(TxRef(tx_ref))
    }

    async fn confirm(&self, tx_ref: &TxRef) -> Result<Confirmation, LedgerError> {
        let mut state = self.state.lock().await;
        if state.fail_confirmations {
            return Ok(Confirmation::Failed);
        }
        match state.transfers.get_mut(&tx_ref.0) {
            Some(0) => Ok(Confirmation::Finalized),
            Some(remaining) => {
                *remaining -= 1;
                Ok(Confirmation::Pending)
            }
            None => Err(LedgerError::Rejected {
                message: format!("unknown tx_ref: {}", tx_ref),
            }),
        }
    }
}
