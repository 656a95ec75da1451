use rust_decimal::Decimal;
use tracing::debug;

use crate::error::ConsistencyFault;
use crate::ledger::models::TransferContext;
use crate::payday::snapshot::Snapshot;

/// Resolve one-to-one donations to a fixed point of affordability.
///
/// Each pass tries to mark every unresolved non-team tip as funded; the
/// funding rule fires on the transition and transfers the money when the
/// tipper's remaining balance covers the amount, otherwise the flag stays
/// unresolved and the tip is retried on the next pass (an incoming transfer
/// may have raised the balance in between). The loop converges when a pass
/// funds nothing. Flags only ever move towards resolved, so exceeding the
/// iteration cap means the data is inconsistent, not that more passes would
/// help.
pub fn settle_tip_graph(
    snapshot: &mut Snapshot,
    max_iterations: u32,
) -> Result<(), ConsistencyFault> {
    let mut iterations = 0u32;
    loop {
        iterations += 1;
        if iterations > max_iterations {
            return Err(ConsistencyFault::NonConvergence(max_iterations));
        }
        let mut funded = 0usize;
        for i in 0..snapshot.tips.len() {
            let tip = &snapshot.tips[i];
            if tip.is_funded == Some(true) || tip.to_team {
                continue;
            }
            let (tipper, tippee, amount) = (tip.tipper, tip.tippee, tip.amount);
            let balance = snapshot
                .balance(tipper)
                .ok_or(ConsistencyFault::MissingParticipant(tipper))?;
            if amount <= balance {
                snapshot.transfer(tipper, tippee, amount, TransferContext::Tip, None, None)?;
                snapshot.tips[i].is_funded = Some(true);
                funded += 1;
            }
        }
        debug!(iterations, funded, "settled tip graph pass");
        if funded == 0 {
            return Ok(());
        }
    }
}

/// Final pass: anything still unresolved is explicitly unfunded.
pub fn mark_unresolved_unfunded(snapshot: &mut Snapshot) -> usize {
    let mut marked = 0;
    for tip in &mut snapshot.tips {
        if tip.is_funded.is_none() {
            tip.is_funded = Some(false);
            marked += 1;
        }
    }
    marked
}

/// Sum of funded tip amounts per tipper, for the cached-amounts refresh.
pub fn giving_of(snapshot: &Snapshot, tipper: i64) -> Decimal {
    snapshot
        .tips
        .iter()
        .filter(|t| t.tipper == tipper && t.is_funded == Some(true))
        .map(|t| t.amount)
        .sum()
}
