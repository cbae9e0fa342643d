//! `remit sweep` -- one pass over every due subscription.
//!
//! Intended to run from cron (daily or hourly); each run is independent
//! and crash-safe, since the executor re-verifies everything against the
//! ledger.

use remit_engine::{run_sweep, ChargeError};
use time::OffsetDateTime;

use crate::config::RemitConfig;
use crate::context::EngineContext;

pub async fn run(config: RemitConfig) -> Result<(), Box<dyn std::error::Error>> {
    let context = EngineContext::build(&config);
    let now = OffsetDateTime::now_utc();

    eprintln!("Sweep starting at {}", now);
    let report = run_sweep(&context.store, &context.executor, now).await?;

    for (id, outcome) in &report.results {
        match outcome {
            Ok(receipt) => {
                let tx = receipt
                    .tx_ref
                    .as_ref()
                    .map(|t| t.0.as_str())
                    .unwrap_or("recovered");
                eprintln!(
                    "  {} charged {} units (tx {}), {} periods left",
                    id, receipt.amount_charged, tx, receipt.periods_remaining
                )
            }
            Err(ChargeError::NotDue { reason, .. }) => {
                eprintln!("  {} skipped: {}", id, reason)
            }
            Err(e) => eprintln!("  {} failed: {}", id, e),
        }
    }

    eprintln!(
        "Sweep complete: {} due, {} charged, {} failed, {} skipped",
        report.due,
        report.charged(),
        report.failed(),
        report.skipped()
    );
    Ok(())
}
