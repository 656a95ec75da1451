use std::collections::HashSet;

use rust_decimal::Decimal;
use tracing::debug;

use crate::error::{PaydayError, PaydayResult};
use crate::ledger::models::{ExchangeStatus, RunStats, TransferContext, TransferStatus};
use crate::store::PaydayStore;

/// Recompute the aggregate statistics of one closed run from its raw
/// transfers and the exchanges of the week leading up to it. The whole
/// computation is a pure function of ledger rows, so running it twice
/// writes the same numbers twice.
pub async fn recompute_stats(store: &dyn PaydayStore, run_id: i64) -> PaydayResult<RunStats> {
    let run = store.run(run_id).await?;
    let ts_end = run.ts_end.ok_or(PaydayError::NoPayday)?;

    let mut stats = RunStats::default();

    // Only donation activity counts: debt and expense transfers move
    // money during the run but are not pledges.
    let transfers = store.transfers_between(run.ts_start, ts_end).await?;
    let mut tippers: HashSet<i64> = HashSet::new();
    let mut tippees: HashSet<i64> = HashSet::new();
    for transfer in transfers.iter().filter(|t| {
        t.status == TransferStatus::Succeeded
            && matches!(t.context, TransferContext::Tip | TransferContext::Take)
    }) {
        tippers.insert(transfer.tipper);
        tippees.insert(transfer.tippee);
        stats.ntransfers += 1;
        stats.transfer_volume += transfer.amount;
        if transfer.refund_ref.is_some() {
            stats.transfer_volume_refunded += transfer.amount;
        }
        if transfer.context == TransferContext::Take {
            stats.ntakes += 1;
            stats.take_volume += transfer.amount;
        } else {
            stats.ntips += 1;
        }
    }
    stats.ntippers = tippers.len() as i64;
    stats.ntippees = tippees.len() as i64;
    stats.nactive = tippers.union(&tippees).count() as i64;
    stats.nusers = store.eligible_user_count(run.ts_start).await?;

    // Platform in/out flows over the week preceding this run.
    let week_start = store.previous_ts_start(run_id).await?;
    for exchange in store
        .exchanges_between(week_start, run.ts_start)
        .await?
        .iter()
        .filter(|e| e.status == ExchangeStatus::Succeeded)
    {
        let refunded = exchange.refund_ref.is_some();
        if exchange.amount > Decimal::ZERO {
            if refunded {
                stats.week_deposits_refunded += exchange.amount;
            } else {
                stats.week_deposits += exchange.amount;
            }
        } else if refunded {
            stats.week_withdrawals_refunded += -exchange.amount;
        } else {
            stats.week_withdrawals += -exchange.amount;
        }
    }

    store.update_run_stats(run_id, &stats).await?;
    debug!(run_id, ?stats, "stats recomputed");
    Ok(stats)
}
