use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::adapters::{Notifier, NotifyEvent};
use crate::error::{PaydayError, PaydayResult};
use crate::ledger::models::{RunRow, TransferContext, TransferStatus};
use crate::store::PaydayStore;

#[derive(Default)]
struct IncomeAcc {
    total: Decimal,
    personal: Decimal,
    by_team: HashMap<i64, Decimal>,
}

/// End-of-run sweeps: income summaries for everyone who received money
/// since the previous run ended, then the two nag sweeps (missing
/// processor account, balance below pledges).
pub async fn notify_participants(
    store: &dyn PaydayStore,
    notifier: &dyn Notifier,
    run: &RunRow,
) -> PaydayResult<()> {
    let ts_end = run.ts_end.ok_or(PaydayError::NoPayday)?;
    let since = store
        .previous_ts_end(run.ts_start)
        .await?
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    // BTreeMap for a stable delivery order. Debt repayments and expense
    // reimbursements are money owed, not income.
    let mut incomes: BTreeMap<i64, IncomeAcc> = BTreeMap::new();
    for transfer in store.transfers_between(since, ts_end).await? {
        if transfer.status != TransferStatus::Succeeded {
            continue;
        }
        if !matches!(
            transfer.context,
            TransferContext::Tip | TransferContext::Take | TransferContext::FinalGift
        ) {
            continue;
        }
        let acc = incomes.entry(transfer.tippee).or_default();
        acc.total += transfer.amount;
        match transfer.team {
            Some(team) => *acc.by_team.entry(team).or_default() += transfer.amount,
            None => acc.personal += transfer.amount,
        }
    }
    let mut notified = 0usize;
    for (tippee, acc) in incomes {
        let participant = match store.participant(tippee).await? {
            Some(p) => p,
            None => continue,
        };
        if participant.kind.is_team() {
            continue;
        }
        notifier
            .notify(
                tippee,
                NotifyEvent::Income {
                    total: acc.total,
                    personal: acc.personal,
                    by_team: acc.by_team,
                    new_balance: participant.balance,
                },
            )
            .await?;
        notified += 1;
    }
    info!(notified, "income notifications sent");

    for participant in store.identity_required_participants().await? {
        notifier
            .notify(participant.id, NotifyEvent::IdentityRequired)
            .await?;
    }
    for participant in store.low_balance_participants(since, ts_end).await? {
        notifier
            .notify(participant.id, NotifyEvent::LowBalance)
            .await?;
    }
    Ok(())
}
