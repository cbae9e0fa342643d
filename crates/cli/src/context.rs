//! Wires configuration into engine components.

use std::sync::Arc;

use remit_engine::{ChargeExecutor, ExecutorConfig, GrantIssuer};
use remit_ledger::{HttpLedgerClient, LedgerClient, MockLedger};
use remit_store::{JsonFileStore, MemoryStore, SubscriptionStore};

use crate::config::RemitConfig;

/// Shared engine components built from one config.
pub(crate) struct EngineContext {
    pub store: Arc<dyn SubscriptionStore>,
    pub issuer: GrantIssuer,
    pub executor: ChargeExecutor,
    /// Present when running against the in-process mock ledger; used to
    /// seed demo balances and stand in for the external approval flow.
    pub mock: Option<Arc<MockLedger>>,
}

impl EngineContext {
    pub fn build(config: &RemitConfig) -> Self {
        let store: Arc<dyn SubscriptionStore> = match &config.store_path {
            Some(path) => Arc::new(JsonFileStore::new(path.clone())),
            None => Arc::new(MemoryStore::new()),
        };

        let mut mock = None;
        let ledger: Arc<dyn LedgerClient> = match &config.ledger_url {
            Some(url) => Arc::new(HttpLedgerClient::new(url)),
            None => {
                let m = Arc::new(MockLedger::new());
                mock = Some(m.clone());
                m
            }
        };

        let issuer = GrantIssuer::new(store.clone(), config.period_secs);
        let executor = ChargeExecutor::new(
            store.clone(),
            ledger,
            ExecutorConfig::new(config.merchant_account.clone()),
        );

        Self {
            store,
            issuer,
            executor,
            mock,
        }
    }
}
