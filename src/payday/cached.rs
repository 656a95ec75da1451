use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use crate::config::Config;
use crate::error::PaydayResult;
use crate::ledger::models::CachedAmounts;
use crate::payday::{resolver, takes};
use crate::store::PaydayStore;

/// Refresh the cached `giving`/`taking`/`receiving`/`npatrons` columns and
/// the tips' funded flags by replaying the whole distribution against
/// current balances, without moving any money. This is what keeps profile
/// pages honest between runs.
pub async fn update_cached_amounts(
    store: &dyn PaydayStore,
    config: &Config,
) -> PaydayResult<()> {
    let mut snapshot = store.load_snapshot(Utc::now()).await?;
    resolver::settle_tip_graph(&mut snapshot, config.max_resolve_iterations)?;
    for team in snapshot.team_ids() {
        takes::resolve_takes(&mut snapshot, team)?;
    }
    resolver::mark_unresolved_unfunded(&mut snapshot);

    let mut receiving: HashMap<i64, Decimal> = HashMap::new();
    let mut funded_patrons: HashMap<i64, i32> = HashMap::new();
    for tip in snapshot.tips.iter().filter(|t| t.is_funded == Some(true)) {
        *receiving.entry(tip.tippee).or_default() += tip.amount;
        *funded_patrons.entry(tip.tippee).or_default() += 1;
    }
    // Teams count funded pledges; people count the transfers the replay
    // would actually deliver to them (direct tips plus team shares).
    let mut incoming: HashMap<i64, i32> = HashMap::new();
    for transfer in snapshot.transfers() {
        *incoming.entry(transfer.tippee).or_default() += 1;
    }

    let rows: Vec<CachedAmounts> = snapshot
        .participants()
        .map(|p| {
            let taking = takes::taking_of(&snapshot, p.id);
            let npatrons = if p.kind.is_team() {
                funded_patrons.get(&p.id).copied().unwrap_or(0)
            } else {
                incoming.get(&p.id).copied().unwrap_or(0)
            };
            CachedAmounts {
                id: p.id,
                giving: resolver::giving_of(&snapshot, p.id),
                taking,
                receiving: receiving.get(&p.id).copied().unwrap_or(Decimal::ZERO) + taking,
                npatrons,
            }
        })
        .collect();
    let tip_flags: Vec<(i64, bool)> = snapshot
        .tips
        .iter()
        .map(|t| (t.id, t.is_funded == Some(true)))
        .collect();

    info!(nrows = rows.len(), "cached amounts refreshed");
    store.save_cached_amounts(&rows, &tip_flags).await
}
