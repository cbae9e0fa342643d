//! Periodic sweep: drive every due subscription through one charge.

use std::sync::Arc;

use remit_store::SubscriptionStore;
use time::OffsetDateTime;

use crate::error::ChargeError;
use crate::executor::{ChargeExecutor, ChargeReceipt};

/// Outcome of one sweep pass.
///
/// `results` holds the per-subscription outcomes in execution order.
/// Skips (`NotDue`, `AlreadyInProgress`, `NotFound`) are benign: the
/// due-list is a snapshot, and state legitimately moves under it.
pub struct SweepReport {
    /// Number of subscriptions the due-list snapshot returned.
    pub due: usize,
    pub results: Vec<(String, Result<ChargeReceipt, ChargeError>)>,
}

impl SweepReport {
    pub fn charged(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| {
                matches!(
                    r,
                    Err(ChargeError::Failed { .. }) | Err(ChargeError::Store(_))
                )
            })
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.results.len() - self.charged() - self.failed()
    }
}

/// Charge every subscription that is due at `now`.
///
/// Each id is re-validated inside `charge`; a record that stopped being
/// due between listing and execution is skipped, not failed. Failures
/// are isolated per subscription: one bad record never stops the sweep.
pub async fn run_sweep(
    store: &Arc<dyn SubscriptionStore>,
    executor: &ChargeExecutor,
    now: OffsetDateTime,
) -> Result<SweepReport, ChargeError> {
    let due = store
        .list_due(now.unix_timestamp())
        .await
        .map_err(ChargeError::Store)?;

    let mut results = Vec::with_capacity(due.len());
    for sub in &due {
        let outcome = executor.charge(&sub.id, now).await;
        results.push((sub.id.clone(), outcome));
    }

    Ok(SweepReport {
        due: due.len(),
        results,
    })
}
