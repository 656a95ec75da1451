use tracing::debug;

use crate::error::PaydayResult;
use crate::store::{DebtSettlement, PaydayStore};

/// Settle due debts one by one against live balances.
///
/// The store settles one payable debt at a time (debtor can afford it,
/// creditor can receive), atomically from selection to the status flip.
/// A debt the store had to pass over is added to the skip list instead of
/// being retried, so the loop always terminates.
pub async fn settle_debts(store: &dyn PaydayStore) -> PaydayResult<u64> {
    let mut skip: Vec<i64> = Vec::new();
    let mut settled = 0u64;
    while let Some(outcome) = store.settle_next_due_debt(&skip).await? {
        match outcome {
            DebtSettlement::Paid { .. } => settled += 1,
            DebtSettlement::Skipped { debt_id } => {
                debug!(debt = debt_id, "debtor balance moved, skipping debt");
                skip.push(debt_id);
            }
        }
    }
    Ok(settled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{DebtStatus, Kind, TransferContext, TransferStatus};
    use crate::store::memory::MemoryStore;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_affordable_debt_is_paid_and_linked() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(10), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        let debt_id = store.add_debt(1, 2, dec!(6));

        assert_eq!(settle_debts(&store).await.unwrap(), 1);
        assert_eq!(store.balance(1), dec!(4));
        assert_eq!(store.balance(2), dec!(6));
        let debt = store.debt(debt_id);
        assert_eq!(debt.status, DebtStatus::Paid);
        let transfers = store.ledger_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(debt.settlement, Some(transfers[0].id));
        assert_eq!(transfers[0].context, TransferContext::Debt);
        assert_eq!(transfers[0].status, TransferStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unaffordable_debt_is_left_due() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(3), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        let debt_id = store.add_debt(1, 2, dec!(6));

        assert_eq!(settle_debts(&store).await.unwrap(), 0);
        assert_eq!(store.debt(debt_id).status, DebtStatus::Due);
        assert!(store.ledger_transfers().is_empty());
    }

    /// One store call settles the debt end to end: debit, credit, ledger
    /// row and the status flip all land together, and a settled debt is
    /// never handed out again.
    #[tokio::test]
    async fn test_settlement_is_one_atomic_store_operation() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(10), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        let debt_id = store.add_debt(1, 2, dec!(6));

        let outcome = store.settle_next_due_debt(&[]).await.unwrap();
        assert_eq!(
            outcome,
            Some(DebtSettlement::Paid {
                debt_id,
                transfer_id: 1
            })
        );
        assert_eq!(store.balance(1), dec!(4));
        assert_eq!(store.balance(2), dec!(6));
        assert_eq!(store.debt(debt_id).settlement, Some(1));
        assert_eq!(store.settle_next_due_debt(&[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_skip_list_excludes_a_debt_from_selection() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(10), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        let debt_id = store.add_debt(1, 2, dec!(6));

        assert_eq!(store.settle_next_due_debt(&[debt_id]).await.unwrap(), None);
        assert_eq!(store.debt(debt_id).status, DebtStatus::Due);
    }

    #[tokio::test]
    async fn test_incoming_settlement_funds_the_next_debt() {
        // 2 can only repay 3 once 1 has repaid 2.
        let store = MemoryStore::new();
        store.add_participant(1, dec!(5), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        store.add_participant(3, dec!(0), Kind::Individual);
        let first = store.add_debt(1, 2, dec!(5));
        let second = store.add_debt(2, 3, dec!(5));

        assert_eq!(settle_debts(&store).await.unwrap(), 2);
        assert_eq!(store.debt(first).status, DebtStatus::Paid);
        assert_eq!(store.debt(second).status, DebtStatus::Paid);
        assert_eq!(store.balance(3), dec!(5));
    }
}
