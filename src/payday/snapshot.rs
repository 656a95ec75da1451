use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::ConsistencyFault;
use crate::ledger::models::{
    Kind, ParticipantRow, Status, TakeRow, TipRow, TransferContext, TransferKey, VirtualTransfer,
};

/// Immutable per-run copy of a participant, plus the mutable new-balance
/// accumulator the debit/credit contract is audited against.
#[derive(Debug, Clone)]
pub struct SnapshotParticipant {
    pub id: i64,
    pub username: String,
    pub join_time: DateTime<Utc>,
    pub old_balance: Decimal,
    pub new_balance: Decimal,
    pub goal: Option<Decimal>,
    pub kind: Kind,
}

/// One pledge, latest version as of run start. `is_funded` is mutated only
/// by the resolver: None is unresolved, Some(true)/Some(false) are final.
#[derive(Debug, Clone)]
pub struct TipSnapshot {
    pub id: i64,
    pub tipper: i64,
    pub tippee: i64,
    pub amount: Decimal,
    pub to_team: bool,
    pub is_funded: Option<bool>,
    /// Cumulative succeeded take transfers for this (tipper, team) relation,
    /// the input to the historical-fairness catch-up.
    pub past_take_sum: Decimal,
}

#[derive(Debug, Clone)]
pub struct TakeSnapshot {
    pub team: i64,
    pub member: i64,
    pub amount: Decimal,
}

/// Materialized view of everything the virtual phase operates on.
#[derive(Debug)]
pub struct Snapshot {
    pub ts_start: DateTime<Utc>,
    participants: BTreeMap<i64, SnapshotParticipant>,
    pub tips: Vec<TipSnapshot>,
    pub takes: Vec<TakeSnapshot>,
    transfers: Vec<VirtualTransfer>,
    recorded: HashSet<TransferKey>,
}

impl Snapshot {
    /// Build the snapshot from raw store rows, applying the eligibility
    /// rules: joined before run start, active, not suspended, and (for
    /// anyone but a team) a linked payment-processor account.
    pub fn build(
        ts_start: DateTime<Utc>,
        participants: Vec<ParticipantRow>,
        tips: Vec<TipRow>,
        takes: Vec<TakeRow>,
        past_take_sums: &HashMap<(i64, i64), Decimal>,
    ) -> Snapshot {
        let participants: BTreeMap<i64, SnapshotParticipant> = participants
            .into_iter()
            .filter(|p| {
                p.join_time < ts_start
                    && p.status == Status::Active
                    && !p.is_suspended
                    && (p.processor_account.is_some() || p.kind.is_team())
            })
            .map(|p| {
                (
                    p.id,
                    SnapshotParticipant {
                        id: p.id,
                        username: p.username,
                        join_time: p.join_time,
                        old_balance: p.balance,
                        new_balance: p.balance,
                        goal: p.goal,
                        kind: p.kind,
                    },
                )
            })
            .collect();

        // Latest declaration per (tipper, tippee) as of run start.
        let mut latest_tips: BTreeMap<(i64, i64), TipRow> = BTreeMap::new();
        for tip in tips.into_iter().filter(|t| t.mtime < ts_start) {
            match latest_tips.get(&(tip.tipper, tip.tippee)) {
                Some(prev) if (prev.mtime, prev.id) >= (tip.mtime, tip.id) => {}
                _ => {
                    latest_tips.insert((tip.tipper, tip.tippee), tip);
                }
            }
        }
        let mut tips: Vec<TipSnapshot> = latest_tips
            .into_values()
            .filter(|t| t.amount > Decimal::ZERO)
            .filter_map(|t| {
                participants.get(&t.tipper)?;
                let tippee = participants.get(&t.tippee)?;
                if matches!(tippee.goal, Some(goal) if goal < Decimal::ZERO) {
                    return None;
                }
                Some(TipSnapshot {
                    id: t.id,
                    tipper: t.tipper,
                    tippee: t.tippee,
                    amount: t.amount,
                    to_team: tippee.kind.is_team(),
                    is_funded: None,
                    past_take_sum: past_take_sums
                        .get(&(t.tipper, t.tippee))
                        .copied()
                        .unwrap_or(Decimal::ZERO),
                })
            })
            .collect();
        tips.sort_by_key(|t| t.id);

        let mut latest_takes: BTreeMap<(i64, i64), TakeRow> = BTreeMap::new();
        for take in takes.into_iter().filter(|t| t.mtime < ts_start) {
            match latest_takes.get(&(take.team, take.member)) {
                Some(prev) if prev.mtime >= take.mtime => {}
                _ => {
                    latest_takes.insert((take.team, take.member), take);
                }
            }
        }
        let takes: Vec<TakeSnapshot> = latest_takes
            .into_values()
            .filter(|t| {
                t.amount > Decimal::ZERO
                    && participants.contains_key(&t.team)
                    && participants.contains_key(&t.member)
            })
            .map(|t| TakeSnapshot {
                team: t.team,
                member: t.member,
                amount: t.amount,
            })
            .collect();

        Snapshot {
            ts_start,
            participants,
            tips,
            takes,
            transfers: Vec::new(),
            recorded: HashSet::new(),
        }
    }

    /// The transfer primitive: debit the tipper's accumulator, credit the
    /// tippee's, record one virtual transfer. A missing participant is a
    /// programmer-error guard that aborts the whole phase.
    pub fn transfer(
        &mut self,
        tipper: i64,
        tippee: i64,
        amount: Decimal,
        context: TransferContext,
        team: Option<i64>,
        invoice: Option<i64>,
    ) -> Result<(), ConsistencyFault> {
        if amount == Decimal::ZERO {
            return Ok(());
        }
        let transfer = VirtualTransfer {
            tipper,
            tippee,
            amount,
            context,
            team,
            invoice,
        };
        if !self.recorded.insert(transfer.signature()) {
            return Err(ConsistencyFault::DuplicateTransfer {
                tipper,
                tippee,
                context,
                team,
            });
        }
        {
            let payer = self
                .participants
                .get_mut(&tipper)
                .ok_or(ConsistencyFault::MissingParticipant(tipper))?;
            payer.new_balance -= amount;
        }
        {
            let payee = self
                .participants
                .get_mut(&tippee)
                .ok_or(ConsistencyFault::MissingParticipant(tippee))?;
            payee.new_balance += amount;
        }
        self.transfers.push(transfer);
        Ok(())
    }

    pub fn balance(&self, id: i64) -> Option<Decimal> {
        self.participants.get(&id).map(|p| p.new_balance)
    }

    pub fn participant(&self, id: i64) -> Option<&SnapshotParticipant> {
        self.participants.get(&id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &SnapshotParticipant> {
        self.participants.values()
    }

    /// Participants whose accumulator moved during this run.
    pub fn changed_participants(&self) -> impl Iterator<Item = &SnapshotParticipant> {
        self.participants
            .values()
            .filter(|p| p.new_balance != p.old_balance)
    }

    pub fn nparticipants(&self) -> i64 {
        self.participants.len() as i64
    }

    pub fn team_ids(&self) -> Vec<i64> {
        self.participants
            .values()
            .filter(|p| p.kind.is_team())
            .map(|p| p.id)
            .collect()
    }

    pub fn transfers(&self) -> &[VirtualTransfer] {
        &self.transfers
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use rust_decimal_macros::dec;

    fn build(
        participants: Vec<ParticipantRow>,
        tips: Vec<TipRow>,
        takes: Vec<TakeRow>,
    ) -> Snapshot {
        Snapshot::build(ts(100), participants, tips, takes, &HashMap::new())
    }

    #[test]
    fn test_ineligible_participants_are_dropped() {
        let mut suspended = participant(2, dec!(10), Kind::Individual);
        suspended.is_suspended = true;
        let mut closed = participant(3, dec!(10), Kind::Individual);
        closed.status = Status::Closed;
        let mut no_account = participant(4, dec!(10), Kind::Individual);
        no_account.processor_account = None;
        let mut late = participant(5, dec!(10), Kind::Individual);
        late.join_time = ts(200);
        let team = participant(6, dec!(0), Kind::Group);

        let snapshot = build(
            vec![
                participant(1, dec!(10), Kind::Individual),
                suspended,
                closed,
                no_account,
                late,
                team,
            ],
            vec![],
            vec![],
        );
        // Teams stay eligible without a processor account.
        assert_eq!(snapshot.nparticipants(), 2);
        assert!(snapshot.participant(1).is_some());
        assert!(snapshot.participant(6).is_some());
    }

    #[test]
    fn test_only_latest_tip_version_survives() {
        let mut old = tip(1, 1, 2, dec!(5));
        old.mtime = ts(10);
        let mut newer = tip(2, 1, 2, dec!(7));
        newer.mtime = ts(20);
        let mut future = tip(3, 1, 2, dec!(9));
        future.mtime = ts(150); // after run start, ignored

        let snapshot = build(
            vec![
                participant(1, dec!(10), Kind::Individual),
                participant(2, dec!(0), Kind::Individual),
            ],
            vec![old, newer, future],
            vec![],
        );
        assert_eq!(snapshot.tips.len(), 1);
        assert_eq!(snapshot.tips[0].amount, dec!(7));
    }

    #[test]
    fn test_tip_to_negative_goal_is_dropped() {
        let mut declined = participant(2, dec!(0), Kind::Individual);
        declined.goal = Some(dec!(-1));
        let snapshot = build(
            vec![participant(1, dec!(10), Kind::Individual), declined],
            vec![tip(1, 1, 2, dec!(5))],
            vec![],
        );
        assert!(snapshot.tips.is_empty());
    }

    #[test]
    fn test_transfer_moves_money_and_conserves_total() {
        let mut snapshot = build(
            vec![
                participant(1, dec!(10), Kind::Individual),
                participant(2, dec!(3), Kind::Individual),
            ],
            vec![],
            vec![],
        );
        snapshot
            .transfer(1, 2, dec!(4), TransferContext::Tip, None, None)
            .unwrap();
        assert_eq!(snapshot.balance(1), Some(dec!(6)));
        assert_eq!(snapshot.balance(2), Some(dec!(7)));
        let delta: Decimal = snapshot
            .participants()
            .map(|p| p.new_balance - p.old_balance)
            .sum();
        assert_eq!(delta, Decimal::ZERO);
        assert_eq!(snapshot.transfers().len(), 1);
    }

    #[test]
    fn test_zero_amount_transfer_is_a_noop() {
        let mut snapshot = build(vec![participant(1, dec!(10), Kind::Individual)], vec![], vec![]);
        snapshot
            .transfer(1, 99, Decimal::ZERO, TransferContext::Tip, None, None)
            .unwrap();
        assert!(snapshot.transfers().is_empty());
    }

    #[test]
    fn test_transfer_to_missing_participant_is_a_fault() {
        let mut snapshot = build(vec![participant(1, dec!(10), Kind::Individual)], vec![], vec![]);
        let err = snapshot
            .transfer(1, 99, dec!(1), TransferContext::Tip, None, None)
            .unwrap_err();
        assert!(matches!(err, ConsistencyFault::MissingParticipant(99)));
    }

    #[test]
    fn test_duplicate_signature_is_a_fault() {
        let mut snapshot = build(
            vec![
                participant(1, dec!(10), Kind::Individual),
                participant(2, dec!(0), Kind::Individual),
            ],
            vec![],
            vec![],
        );
        snapshot
            .transfer(1, 2, dec!(1), TransferContext::Tip, None, None)
            .unwrap();
        let err = snapshot
            .transfer(1, 2, dec!(1), TransferContext::Tip, None, None)
            .unwrap_err();
        assert!(matches!(err, ConsistencyFault::DuplicateTransfer { .. }));
    }
}
