use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::currency::round_up;
use crate::error::ConsistencyFault;
use crate::ledger::models::TransferContext;
use crate::payday::snapshot::Snapshot;

#[derive(Debug)]
struct TipPlan {
    id: i64,
    tipper: i64,
    amount: Decimal,
    full_amount: Decimal,
    past_take_sum: Decimal,
    weeks: Decimal,
    weeks_to_catch_up: Decimal,
    ratio: Decimal,
    leeway: Decimal,
}

#[derive(Debug)]
struct TakePlan {
    member: i64,
    amount: Decimal,
}

/// Resolve many-to-many donations: split a team's funded income among its
/// members in proportion to their declared takes.
pub fn resolve_takes(snapshot: &mut Snapshot, team: i64) -> Result<(), ConsistencyFault> {
    // Fund as many of the team's incoming tips as the payers' balances
    // allow. No money moves yet; the pair loop below pays members directly.
    let mut total_income = Decimal::ZERO;
    for i in 0..snapshot.tips.len() {
        let tip = &snapshot.tips[i];
        if tip.tippee != team {
            continue;
        }
        let balance = snapshot
            .balance(tip.tipper)
            .ok_or(ConsistencyFault::MissingParticipant(tip.tipper))?;
        if balance >= tip.amount {
            total_income += tip.amount;
            snapshot.tips[i].is_funded = Some(true);
        }
    }
    let total_takes: Decimal = snapshot
        .takes
        .iter()
        .filter(|t| t.team == team)
        .map(|t| t.amount)
        .sum();
    if total_income == Decimal::ZERO || total_takes == Decimal::ZERO {
        return Ok(());
    }
    let takes_ratio = (total_income / total_takes).min(Decimal::ONE);
    let tips_ratio = (total_takes / total_income).min(Decimal::ONE);
    debug!(team, %total_income, %total_takes, "distributing team income");

    let mut tips: Vec<TipPlan> = snapshot
        .tips
        .iter()
        .filter(|t| {
            t.tippee == team
                && snapshot
                    .balance(t.tipper)
                    .map_or(false, |balance| balance >= t.amount)
        })
        .map(|t| TipPlan {
            id: t.id,
            tipper: t.tipper,
            amount: round_up(t.amount * tips_ratio),
            full_amount: t.amount,
            past_take_sum: t.past_take_sum,
            weeks: Decimal::ZERO,
            weeks_to_catch_up: Decimal::ZERO,
            ratio: Decimal::ZERO,
            leeway: Decimal::ZERO,
        })
        .collect();
    let mut takes: Vec<TakePlan> = snapshot
        .takes
        .iter()
        .filter(|t| t.team == team)
        .map(|t| TakePlan {
            member: t.member,
            amount: round_up(t.amount * takes_ratio),
        })
        .collect();

    let mut adjust_tips = tips_ratio != Decimal::ONE;
    let mut leeway_ratio = Decimal::ZERO;
    if adjust_tips {
        // The team has a funding surplus relative to its pledges, so the
        // individual amounts can be adjusted for historical fairness. The
        // "weeks" count estimates how many pledge-periods worth of money a
        // donation has already delivered: 2.50 for a 10/week pledge that
        // has transferred 25 in the past.
        for tip in &mut tips {
            tip.weeks = round_up(tip.past_take_sum / tip.full_amount);
        }
        let max_weeks = tips.iter().map(|t| t.weeks).max().unwrap_or_default();
        let min_weeks = tips.iter().map(|t| t.weeks).min().unwrap_or_default();
        adjust_tips = max_weeks != min_weeks;
        if adjust_tips {
            // Donors who have delivered fewer weeks than the oldest donation
            // get boosted so the weeks counts eventually equalize.
            let min_tip_ratio = tips_ratio * dec!(0.1);
            for tip in &mut tips {
                tip.weeks_to_catch_up = max_weeks - tip.weeks;
                tip.ratio = (min_tip_ratio + tip.weeks_to_catch_up).min(Decimal::ONE);
                tip.amount = round_up(tip.full_amount * tip.ratio);
            }
            let naive_sum: Decimal = tips.iter().map(|t| t.amount).sum();
            let total_to_transfer = total_takes.min(total_income);
            let delta = total_to_transfer - naive_sum;
            if delta == Decimal::ZERO {
                adjust_tips = false;
            } else {
                // Compute each tip's leeway: how far it can move to absorb
                // the delta. Lowering only touches tips whose ratio is
                // still above the floor.
                if delta < Decimal::ZERO {
                    for tip in &mut tips {
                        tip.leeway = if tip.ratio > min_tip_ratio {
                            round_up(tip.full_amount * min_tip_ratio) - tip.amount
                        } else {
                            Decimal::ZERO
                        };
                    }
                } else {
                    for tip in &mut tips {
                        tip.leeway = tip.full_amount - tip.amount;
                    }
                }
                let total_leeway: Decimal = tips.iter().map(|t| t.leeway).sum();
                if total_leeway == Decimal::ZERO {
                    adjust_tips = false;
                } else {
                    leeway_ratio = (delta / total_leeway).min(Decimal::ONE);
                    tips.sort_by(|a, b| {
                        b.weeks_to_catch_up
                            .cmp(&a.weeks_to_catch_up)
                            .then(a.id.cmp(&b.id))
                    });
                }
            }
        }
    }

    for tip in &mut tips {
        if adjust_tips {
            let amount = round_up(tip.amount + tip.leeway * leeway_ratio);
            if amount == Decimal::ZERO {
                continue;
            }
            if amount < Decimal::ZERO || amount > tip.full_amount {
                return Err(ConsistencyFault::PayoutOutOfRange {
                    tip: tip.id,
                    amount,
                    full_amount: tip.full_amount,
                });
            }
            tip.amount = amount;
        }
        for take in &mut takes {
            // A member cannot pay their own take.
            if take.amount == Decimal::ZERO || tip.tipper == take.member {
                continue;
            }
            let transfer_amount = tip.amount.min(take.amount);
            snapshot.transfer(
                tip.tipper,
                take.member,
                transfer_amount,
                TransferContext::Take,
                Some(team),
                None,
            )?;
            tip.amount -= transfer_amount;
            take.amount -= transfer_amount;
            if tip.amount == Decimal::ZERO {
                break;
            }
        }
    }
    Ok(())
}

/// Sum of take transfers received per member, for the cached-amounts refresh.
pub fn taking_of(snapshot: &Snapshot, member: i64) -> Decimal {
    snapshot
        .transfers()
        .iter()
        .filter(|t| t.tippee == member && t.context == TransferContext::Take)
        .map(|t| t.amount)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{Kind, ParticipantRow, TakeRow, TipRow, VirtualTransfer};
    use crate::payday::snapshot::testutil::*;
    use std::collections::HashMap;

    const TEAM: i64 = 10;

    fn team_snapshot(
        mut participants: Vec<ParticipantRow>,
        tips: Vec<TipRow>,
        takes: Vec<TakeRow>,
        past: &HashMap<(i64, i64), Decimal>,
    ) -> Snapshot {
        participants.push(participant(TEAM, Decimal::ZERO, Kind::Group));
        Snapshot::build(ts(100), participants, tips, takes, past)
    }

    fn received(snapshot: &Snapshot, member: i64) -> Decimal {
        taking_of(snapshot, member)
    }

    #[test]
    fn test_income_split_equally_between_equal_takes() {
        // Income 100, two members claiming 100 each: 50/50 and nothing
        // over-delivered.
        let mut snapshot = team_snapshot(
            vec![
                participant(1, Decimal::ZERO, Kind::Individual),
                participant(2, Decimal::ZERO, Kind::Individual),
                participant(3, dec!(100), Kind::Individual),
            ],
            vec![tip(1, 3, TEAM, dec!(100))],
            vec![take(TEAM, 1, dec!(100)), take(TEAM, 2, dec!(100))],
            &HashMap::new(),
        );
        resolve_takes(&mut snapshot, TEAM).unwrap();
        assert_eq!(received(&snapshot, 1), dec!(50));
        assert_eq!(received(&snapshot, 2), dec!(50));
        assert!(received(&snapshot, 1) + received(&snapshot, 2) <= dec!(100));
        assert_eq!(snapshot.balance(3), Some(Decimal::ZERO));
    }

    #[test]
    fn test_no_distribution_without_income_or_takes() {
        let mut snapshot = team_snapshot(
            vec![participant(1, Decimal::ZERO, Kind::Individual)],
            vec![],
            vec![take(TEAM, 1, dec!(100))],
            &HashMap::new(),
        );
        resolve_takes(&mut snapshot, TEAM).unwrap();
        assert!(snapshot.transfers().is_empty());
    }

    #[test]
    fn test_unaffordable_incoming_tip_is_excluded() {
        let mut snapshot = team_snapshot(
            vec![
                participant(1, Decimal::ZERO, Kind::Individual),
                participant(3, dec!(5), Kind::Individual),
            ],
            vec![tip(1, 3, TEAM, dec!(100))],
            vec![take(TEAM, 1, dec!(100))],
            &HashMap::new(),
        );
        resolve_takes(&mut snapshot, TEAM).unwrap();
        assert!(snapshot.transfers().is_empty());
        assert_eq!(snapshot.tips[0].is_funded, None);
    }

    #[test]
    fn test_member_never_pays_their_own_take() {
        // Member 1 is also the only donor: their money goes to member 2.
        let mut snapshot = team_snapshot(
            vec![
                participant(1, dec!(10), Kind::Individual),
                participant(2, Decimal::ZERO, Kind::Individual),
            ],
            vec![tip(1, 1, TEAM, dec!(10))],
            vec![take(TEAM, 1, dec!(10)), take(TEAM, 2, dec!(10))],
            &HashMap::new(),
        );
        resolve_takes(&mut snapshot, TEAM).unwrap();
        assert_eq!(received(&snapshot, 1), Decimal::ZERO);
        // takes_ratio = 0.5, so member 2's take scales to 5.
        assert_eq!(received(&snapshot, 2), dec!(5));
    }

    #[test]
    fn test_surplus_boosts_donors_who_are_behind() {
        // Donor 3 has already delivered 3 weeks worth, donor 4 none.
        let mut past = HashMap::new();
        past.insert((3, TEAM), dec!(30));
        let mut snapshot = team_snapshot(
            vec![
                participant(1, Decimal::ZERO, Kind::Individual),
                participant(2, Decimal::ZERO, Kind::Individual),
                participant(3, dec!(100), Kind::Individual),
                participant(4, dec!(100), Kind::Individual),
            ],
            vec![tip(1, 3, TEAM, dec!(10)), tip(2, 4, TEAM, dec!(10))],
            vec![take(TEAM, 1, dec!(5)), take(TEAM, 2, dec!(5))],
            &past,
        );
        resolve_takes(&mut snapshot, TEAM).unwrap();
        // Members still receive their full scaled takes.
        assert_eq!(received(&snapshot, 1), dec!(5));
        assert_eq!(received(&snapshot, 2), dec!(5));
        // The donor who is behind carries almost the whole round.
        let paid_by_3 = dec!(100) - snapshot.balance(3).unwrap();
        let paid_by_4 = dec!(100) - snapshot.balance(4).unwrap();
        assert!(paid_by_4 > paid_by_3);
        assert!(paid_by_4 >= dec!(9));
        assert_eq!(paid_by_3 + paid_by_4, dec!(10));
    }

    #[test]
    fn test_distribution_is_deterministic() {
        let run = || -> Vec<VirtualTransfer> {
            let mut past = HashMap::new();
            past.insert((3, TEAM), dec!(20));
            past.insert((5, TEAM), dec!(10));
            let mut snapshot = team_snapshot(
                vec![
                    participant(1, Decimal::ZERO, Kind::Individual),
                    participant(2, Decimal::ZERO, Kind::Individual),
                    participant(3, dec!(50), Kind::Individual),
                    participant(4, dec!(50), Kind::Individual),
                    participant(5, dec!(50), Kind::Individual),
                ],
                vec![
                    tip(1, 3, TEAM, dec!(10)),
                    tip(2, 4, TEAM, dec!(10)),
                    tip(3, 5, TEAM, dec!(10)),
                ],
                vec![take(TEAM, 1, dec!(7)), take(TEAM, 2, dec!(6))],
                &past,
            );
            resolve_takes(&mut snapshot, TEAM).unwrap();
            snapshot.transfers().to_vec()
        };
        assert_eq!(run(), run());
    }
}
