//! Engine configuration: a TOML file with `REMIT_*` environment
//! overrides.
//!
//! ```toml
//! [ledger]
//! url = "https://ledger-gateway.example.com"
//! asset_decimals = 6
//!
//! [billing]
//! merchant_account = "merchant-usdc"
//! period_secs = 2592000
//! default_rate = "0.01"
//!
//! [store]
//! path = "data/subscriptions.json"
//! ```
//!
//! `[ledger] mock = true` (or omitting `url`) runs against the
//! in-process mock ledger, the self-contained demo mode.

use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Deserialize;

use remit_ledger::to_base_units;

/// Default billing period: 30 days, matching the monthly cadence the
/// engine was built for.
pub const DEFAULT_PERIOD_SECS: i64 = 30 * 24 * 60 * 60;

const DEFAULT_ASSET_DECIMALS: u32 = 6;

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    ledger: RawLedger,
    #[serde(default)]
    billing: RawBilling,
    #[serde(default)]
    store: RawStore,
}

#[derive(Debug, Default, Deserialize)]
struct RawLedger {
    url: Option<String>,
    mock: Option<bool>,
    asset_decimals: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBilling {
    merchant_account: Option<String>,
    period_secs: Option<i64>,
    /// Decimal per-period rate used when a create-grant request does not
    /// carry an explicit amount.
    default_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStore {
    path: Option<PathBuf>,
}

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct RemitConfig {
    /// Gateway URL; `None` means mock ledger.
    pub ledger_url: Option<String>,
    pub asset_decimals: u32,
    pub merchant_account: String,
    pub period_secs: i64,
    /// Default per-period amount in base units, from `default_rate`.
    pub default_period_amount: Option<u64>,
    /// JSON store path; `None` means in-memory.
    pub store_path: Option<PathBuf>,
}

impl RemitConfig {
    pub fn is_mock(&self) -> bool {
        self.ledger_url.is_none()
    }

    /// Load from an optional TOML file, then apply environment
    /// overrides (`REMIT_LEDGER_URL`, `REMIT_MERCHANT_ACCOUNT`,
    /// `REMIT_STORE_PATH`).
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let raw: RawConfig = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .map_err(|e| format!("error reading config '{}': {}", p.display(), e))?;
                toml::from_str(&text)
                    .map_err(|e| format!("error parsing config '{}': {}", p.display(), e))?
            }
            None => RawConfig::default(),
        };
        Self::resolve(raw)
    }

    fn resolve(raw: RawConfig) -> Result<Self, String> {
        let mock = raw.ledger.mock.unwrap_or(false);
        let ledger_url = std::env::var("REMIT_LEDGER_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .or(raw.ledger.url)
            .filter(|_| !mock);

        let merchant_account = std::env::var("REMIT_MERCHANT_ACCOUNT")
            .ok()
            .filter(|v| !v.is_empty())
            .or(raw.billing.merchant_account)
            .ok_or_else(|| {
                "merchant account required: set [billing] merchant_account or REMIT_MERCHANT_ACCOUNT"
                    .to_string()
            })?;

        let asset_decimals = raw.ledger.asset_decimals.unwrap_or(DEFAULT_ASSET_DECIMALS);

        let period_secs = raw.billing.period_secs.unwrap_or(DEFAULT_PERIOD_SECS);
        if period_secs < 0 {
            return Err("billing period_secs must not be negative".to_string());
        }

        let default_period_amount = match raw.billing.default_rate {
            Some(rate) => {
                let decimal: Decimal = rate
                    .parse()
                    .map_err(|e| format!("invalid default_rate '{}': {}", rate, e))?;
                Some(to_base_units(decimal, asset_decimals).ok_or_else(|| {
                    format!(
                        "default_rate '{}' cannot be expressed in {} decimals",
                        rate, asset_decimals
                    )
                })?)
            }
            None => None,
        };

        let store_path = std::env::var("REMIT_STORE_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or(raw.store.path);

        Ok(Self {
            ledger_url,
            asset_decimals,
            merchant_account,
            period_secs,
            default_period_amount,
            store_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(text: &str) -> Result<RemitConfig, String> {
        RemitConfig::resolve(toml::from_str(text).unwrap())
    }

    #[test]
    fn minimal_config_defaults_to_mock_ledger() {
        let config = resolve(
            r#"
            [billing]
            merchant_account = "merchant-usdc"
            "#,
        )
        .unwrap();
        assert!(config.is_mock());
        assert_eq!(config.period_secs, DEFAULT_PERIOD_SECS);
        assert_eq!(config.asset_decimals, 6);
        assert!(config.store_path.is_none());
    }

    #[test]
    fn default_rate_converts_to_base_units() {
        let config = resolve(
            r#"
            [billing]
            merchant_account = "merchant-usdc"
            default_rate = "0.01"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_period_amount, Some(10_000));
    }

    #[test]
    fn missing_merchant_account_is_an_error() {
        let err = resolve("[billing]\n").unwrap_err();
        assert!(err.contains("merchant account required"));
    }

    #[test]
    fn mock_flag_overrides_url() {
        let config = resolve(
            r#"
            [ledger]
            url = "https://gw.example.com"
            mock = true

            [billing]
            merchant_account = "merchant-usdc"
            "#,
        )
        .unwrap();
        assert!(config.is_mock());
    }

    #[test]
    fn unrepresentable_rate_is_rejected() {
        let err = resolve(
            r#"
            [ledger]
            asset_decimals = 2

            [billing]
            merchant_account = "merchant-usdc"
            default_rate = "0.001"
            "#,
        )
        .unwrap_err();
        assert!(err.contains("cannot be expressed"));
    }
}
