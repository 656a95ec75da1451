use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::info;

use crate::error::ConsistencyFault;
use crate::payday::snapshot::Snapshot;

/// Check that no balance is becoming (more) negative.
///
/// For every participant whose accumulator moved, the implied real-world
/// balance is `current_real_balance + delta`. It may legitimately be
/// negative (it already was) or lower than before (money was given away),
/// but never both at once: that would mean the run manufactured an
/// overdraft, which is a distribution bug.
pub fn check_balances(
    snapshot: &Snapshot,
    real_balances: &HashMap<i64, Decimal>,
) -> Result<(), ConsistencyFault> {
    for p in snapshot.changed_participants() {
        let cur_balance = real_balances.get(&p.id).copied().unwrap_or(p.old_balance);
        let new_balance = cur_balance + p.new_balance - p.old_balance;
        if new_balance < Decimal::ZERO && new_balance < cur_balance {
            return Err(ConsistencyFault::NegativeBalance {
                id: p.id,
                username: p.username.clone(),
                new_balance,
                cur_balance,
            });
        }
    }
    info!("Checked the balances.");
    Ok(())
}
