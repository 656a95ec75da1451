use tracing::{debug, info};

use crate::error::PaydayResult;
use crate::payday::snapshot::Snapshot;
use crate::store::PaydayStore;

/// Pay accepted expense invoices out of the addressees' snapshot balances.
///
/// Only invoices accepted before the run started are considered. An
/// invoice the addressee cannot cover (or whose parties fell out of the
/// snapshot) is left untouched for a later run. Returns the ids of the
/// invoices paid, to be marked paid atomically with the plan.
pub async fn settle_invoices(
    store: &dyn PaydayStore,
    snapshot: &mut Snapshot,
) -> PaydayResult<Vec<i64>> {
    let mut paid = Vec::new();
    for invoice in store.accepted_invoices(snapshot.ts_start).await? {
        let balance = match snapshot.balance(invoice.addressee) {
            Some(balance) => balance,
            None => continue,
        };
        if snapshot.participant(invoice.sender).is_none() {
            continue;
        }
        if balance < invoice.amount {
            debug!(
                invoice = invoice.id,
                addressee = invoice.addressee,
                "addressee cannot cover invoice yet"
            );
            continue;
        }
        snapshot.transfer(
            invoice.addressee,
            invoice.sender,
            invoice.amount,
            invoice.nature.transfer_context(),
            None,
            Some(invoice.id),
        )?;
        paid.push(invoice.id);
    }
    if !paid.is_empty() {
        info!(npaid = paid.len(), "invoices settled");
    }
    Ok(paid)
}
