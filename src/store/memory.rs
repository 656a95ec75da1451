use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::{DebtSettlement, PaydayStore, VirtualOutcome};
use crate::error::{PaydayError, PaydayResult};
use crate::ledger::models::{
    CachedAmounts, Debt, DebtStatus, Exchange, ExchangeStatus, Invoice, InvoiceEvent,
    InvoiceNature, InvoiceStatus, Kind, LedgerTransfer, ParticipantRow, RunRow, RunStats, Stage,
    Status, TakeRow, TipRow, TransferContext, TransferKey, TransferStatus, VirtualTransfer,
};
use crate::payday::snapshot::Snapshot;

#[derive(Default)]
struct MemoryState {
    participants: BTreeMap<i64, ParticipantRow>,
    tips: Vec<TipRow>,
    takes: Vec<TakeRow>,
    transfers: Vec<LedgerTransfer>,
    virtual_transfers: HashMap<i64, Vec<VirtualTransfer>>,
    debts: BTreeMap<i64, Debt>,
    invoices: BTreeMap<i64, Invoice>,
    invoice_events: Vec<InvoiceEvent>,
    exchanges: Vec<Exchange>,
    runs: BTreeMap<i64, RunRow>,
    stats: HashMap<i64, RunStats>,
    held_locks: HashSet<i64>,
    next_tip_id: i64,
    next_transfer_id: i64,
    next_debt_id: i64,
    next_invoice_id: i64,
    next_exchange_id: i64,
}

impl MemoryState {
    /// Latest declaration per (tipper, tippee), the "current tips" view.
    fn current_tips(&self) -> Vec<TipRow> {
        let mut latest: BTreeMap<(i64, i64), TipRow> = BTreeMap::new();
        for tip in &self.tips {
            match latest.get(&(tip.tipper, tip.tippee)) {
                Some(prev) if (prev.mtime, prev.id) >= (tip.mtime, tip.id) => {}
                _ => {
                    latest.insert((tip.tipper, tip.tippee), tip.clone());
                }
            }
        }
        latest.into_values().collect()
    }

    fn fundable(&self, id: i64) -> bool {
        self.participants.get(&id).map_or(false, |p| {
            p.processor_account.is_some() && p.status == Status::Active && !p.is_suspended
        })
    }
}

/// A store backed by plain structs under a mutex. Provides the same
/// atomicity guarantees as the Postgres store (the mutex plays the role of
/// the transaction) and backs the test suite.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn backdated() -> DateTime<Utc> {
        Utc::now() - Duration::hours(1)
    }

    pub fn add_participant(&self, id: i64, balance: Decimal, kind: Kind) {
        self.add_participant_row(ParticipantRow {
            id,
            username: format!("user{}", id),
            join_time: Self::backdated(),
            balance,
            goal: None,
            kind,
            status: Status::Active,
            is_suspended: false,
            processor_account: if kind.is_team() {
                None
            } else {
                Some(format!("acct-{}", id))
            },
            giving: Decimal::ZERO,
            taking: Decimal::ZERO,
            receiving: Decimal::ZERO,
            npatrons: 0,
        });
    }

    pub fn add_participant_row(&self, row: ParticipantRow) {
        self.state.lock().participants.insert(row.id, row);
    }

    pub fn add_tip(&self, tipper: i64, tippee: i64, amount: Decimal) -> i64 {
        let mut state = self.state.lock();
        state.next_tip_id += 1;
        let id = state.next_tip_id;
        state.tips.push(TipRow {
            id,
            tipper,
            tippee,
            amount,
            mtime: Self::backdated(),
            is_funded: None,
        });
        id
    }

    pub fn add_take(&self, team: i64, member: i64, amount: Decimal) {
        self.state.lock().takes.push(TakeRow {
            team,
            member,
            amount,
            mtime: Self::backdated(),
        });
    }

    pub fn add_debt(&self, debtor: i64, creditor: i64, amount: Decimal) -> i64 {
        let mut state = self.state.lock();
        state.next_debt_id += 1;
        let id = state.next_debt_id;
        state.debts.insert(
            id,
            Debt {
                id,
                debtor,
                creditor,
                amount,
                status: DebtStatus::Due,
                settlement: None,
            },
        );
        id
    }

    pub fn add_invoice(&self, addressee: i64, sender: i64, amount: Decimal) -> i64 {
        let mut state = self.state.lock();
        state.next_invoice_id += 1;
        let id = state.next_invoice_id;
        state.invoices.insert(
            id,
            Invoice {
                id,
                addressee,
                sender,
                amount,
                nature: InvoiceNature::Expense,
                status: InvoiceStatus::Accepted,
            },
        );
        state.invoice_events.push(InvoiceEvent {
            invoice: id,
            participant: addressee,
            status: InvoiceStatus::Accepted,
            ts: Self::backdated(),
        });
        id
    }

    pub fn add_exchange(&self, participant: i64, amount: Decimal, status: ExchangeStatus) -> i64 {
        let mut state = self.state.lock();
        state.next_exchange_id += 1;
        let id = state.next_exchange_id;
        state.exchanges.push(Exchange {
            id,
            participant,
            amount,
            refund_ref: None,
            status,
            timestamp: Self::backdated(),
        });
        id
    }

    // Inspection helpers for tests.

    pub fn balance(&self, id: i64) -> Decimal {
        self.state.lock().participants[&id].balance
    }

    pub fn participant_row(&self, id: i64) -> Option<ParticipantRow> {
        self.state.lock().participants.get(&id).cloned()
    }

    pub fn ledger_transfers(&self) -> Vec<LedgerTransfer> {
        self.state.lock().transfers.clone()
    }

    pub fn debt(&self, id: i64) -> Debt {
        self.state.lock().debts[&id].clone()
    }

    pub fn invoice(&self, id: i64) -> Invoice {
        self.state.lock().invoices[&id].clone()
    }

    pub fn run_row(&self, id: i64) -> Option<RunRow> {
        self.state.lock().runs.get(&id).cloned()
    }

    pub fn run_stats(&self, id: i64) -> Option<RunStats> {
        self.state.lock().stats.get(&id).cloned()
    }

    pub fn tip_rows(&self) -> Vec<TipRow> {
        self.state.lock().tips.clone()
    }
}

#[async_trait]
impl PaydayStore for MemoryStore {
    async fn try_acquire_job_lock(&self, key: i64) -> PaydayResult<bool> {
        Ok(self.state.lock().held_locks.insert(key))
    }

    async fn release_job_lock(&self, key: i64) -> PaydayResult<()> {
        self.state.lock().held_locks.remove(&key);
        Ok(())
    }

    async fn start_run(&self, cutoff: DateTime<Utc>) -> PaydayResult<Option<RunRow>> {
        let mut state = self.state.lock();
        if let Some(open) = state.runs.values().find(|r| r.stage.is_some()) {
            return Ok(Some(open.clone()));
        }
        if state.runs.values().any(|r| r.ts_start > cutoff) {
            return Ok(None);
        }
        let id = state.runs.keys().next_back().copied().unwrap_or(0) + 1;
        let run = RunRow {
            id,
            ts_start: Utc::now(),
            ts_end: None,
            stage: Some(Stage::first()),
            nparticipants: 0,
        };
        state.runs.insert(id, run.clone());
        Ok(Some(run))
    }

    async fn run(&self, run_id: i64) -> PaydayResult<RunRow> {
        self.state
            .lock()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(PaydayError::NoPayday)
    }

    async fn advance_stage(&self, run_id: i64, from: Stage) -> PaydayResult<Option<Stage>> {
        let mut state = self.state.lock();
        let run = state.runs.get_mut(&run_id).ok_or(PaydayError::NoPayday)?;
        if run.stage == Some(from) {
            run.stage = from.next();
        }
        Ok(run.stage)
    }

    async fn finish_run(&self, run_id: i64) -> PaydayResult<DateTime<Utc>> {
        let mut state = self.state.lock();
        let run = state.runs.get_mut(&run_id).ok_or(PaydayError::NoPayday)?;
        Ok(*run.ts_end.get_or_insert_with(Utc::now))
    }

    async fn load_snapshot(&self, ts_start: DateTime<Utc>) -> PaydayResult<Snapshot> {
        let state = self.state.lock();
        let mut past_take_sums: HashMap<(i64, i64), Decimal> = HashMap::new();
        for t in &state.transfers {
            if t.context == TransferContext::Take && t.status == TransferStatus::Succeeded {
                if let Some(team) = t.team {
                    *past_take_sums.entry((t.tipper, team)).or_default() += t.amount;
                }
            }
        }
        Ok(Snapshot::build(
            ts_start,
            state.participants.values().cloned().collect(),
            state.tips.clone(),
            state.takes.clone(),
            &past_take_sums,
        ))
    }

    async fn real_balances(&self, ids: &[i64]) -> PaydayResult<HashMap<i64, Decimal>> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.participants.get(id).map(|p| (*id, p.balance)))
            .collect())
    }

    async fn commit_virtual(&self, run_id: i64, outcome: &VirtualOutcome) -> PaydayResult<()> {
        let mut state = self.state.lock();
        state
            .virtual_transfers
            .insert(run_id, outcome.transfers.clone());
        if let Some(run) = state.runs.get_mut(&run_id) {
            run.nparticipants = outcome.nparticipants;
        }
        let now = Utc::now();
        for invoice_id in &outcome.paid_invoices {
            let addressee = match state.invoices.get_mut(invoice_id) {
                Some(invoice) => {
                    invoice.status = InvoiceStatus::Paid;
                    invoice.addressee
                }
                None => continue,
            };
            state.invoice_events.push(InvoiceEvent {
                invoice: *invoice_id,
                participant: addressee,
                status: InvoiceStatus::Paid,
                ts: now,
            });
        }
        Ok(())
    }

    async fn virtual_transfers(&self, run_id: i64) -> PaydayResult<Vec<VirtualTransfer>> {
        Ok(self
            .state
            .lock()
            .virtual_transfers
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn transfer_signatures_since(
        &self,
        ts: DateTime<Utc>,
    ) -> PaydayResult<HashSet<TransferKey>> {
        let state = self.state.lock();
        Ok(state
            .transfers
            .iter()
            .filter(|t| t.timestamp >= ts)
            .map(|t| (t.tipper, t.tippee, t.context, t.team))
            .collect())
    }

    async fn execute_transfer(&self, transfer: &VirtualTransfer) -> PaydayResult<i64> {
        let mut state = self.state.lock();
        let available = state
            .participants
            .get(&transfer.tipper)
            .map(|p| p.balance)
            .ok_or_else(|| PaydayError::from(sqlx::Error::RowNotFound))?;
        if available < transfer.amount {
            return Err(PaydayError::InsufficientFunds {
                required: transfer.amount,
                available,
            });
        }
        state
            .participants
            .get_mut(&transfer.tippee)
            .ok_or_else(|| PaydayError::from(sqlx::Error::RowNotFound))?
            .balance += transfer.amount;
        if let Some(payer) = state.participants.get_mut(&transfer.tipper) {
            payer.balance -= transfer.amount;
        }
        state.next_transfer_id += 1;
        let id = state.next_transfer_id;
        state.transfers.push(LedgerTransfer {
            id,
            timestamp: Utc::now(),
            tipper: transfer.tipper,
            tippee: transfer.tippee,
            amount: transfer.amount,
            context: transfer.context,
            team: transfer.team,
            invoice: transfer.invoice,
            refund_ref: None,
            status: TransferStatus::Succeeded,
        });
        Ok(id)
    }

    async fn record_transfer_failure(
        &self,
        transfer: &VirtualTransfer,
        _reason: &str,
    ) -> PaydayResult<()> {
        let mut state = self.state.lock();
        state.next_transfer_id += 1;
        let id = state.next_transfer_id;
        state.transfers.push(LedgerTransfer {
            id,
            timestamp: Utc::now(),
            tipper: transfer.tipper,
            tippee: transfer.tippee,
            amount: transfer.amount,
            context: transfer.context,
            team: transfer.team,
            invoice: transfer.invoice,
            refund_ref: None,
            status: TransferStatus::Failed,
        });
        Ok(())
    }

    async fn discard_virtual_transfers(&self, run_id: i64) -> PaydayResult<()> {
        self.state.lock().virtual_transfers.remove(&run_id);
        Ok(())
    }

    async fn settle_next_due_debt(
        &self,
        skip: &[i64],
    ) -> PaydayResult<Option<DebtSettlement>> {
        // One lock span covers selection, debit, credit, ledger insert and
        // the status flip, like the Postgres store's transaction.
        let mut state = self.state.lock();
        let debt = match state
            .debts
            .values()
            .find(|d| {
                d.status == DebtStatus::Due
                    && !skip.contains(&d.id)
                    && state
                        .participants
                        .get(&d.debtor)
                        .map_or(false, |p| p.balance >= d.amount)
                    && state
                        .participants
                        .get(&d.creditor)
                        .map_or(false, |p| p.status == Status::Active)
            })
            .cloned()
        {
            Some(debt) => debt,
            None => return Ok(None),
        };
        if let Some(debtor) = state.participants.get_mut(&debt.debtor) {
            debtor.balance -= debt.amount;
        }
        if let Some(creditor) = state.participants.get_mut(&debt.creditor) {
            creditor.balance += debt.amount;
        }
        state.next_transfer_id += 1;
        let transfer_id = state.next_transfer_id;
        state.transfers.push(LedgerTransfer {
            id: transfer_id,
            timestamp: Utc::now(),
            tipper: debt.debtor,
            tippee: debt.creditor,
            amount: debt.amount,
            context: TransferContext::Debt,
            team: None,
            invoice: None,
            refund_ref: None,
            status: TransferStatus::Succeeded,
        });
        if let Some(row) = state.debts.get_mut(&debt.id) {
            row.status = DebtStatus::Paid;
            row.settlement = Some(transfer_id);
        }
        Ok(Some(DebtSettlement::Paid {
            debt_id: debt.id,
            transfer_id,
        }))
    }

    async fn accepted_invoices(&self, before: DateTime<Utc>) -> PaydayResult<Vec<Invoice>> {
        let state = self.state.lock();
        Ok(state
            .invoices
            .values()
            .filter(|i| {
                i.status == InvoiceStatus::Accepted
                    && state
                        .invoice_events
                        .iter()
                        .filter(|e| e.invoice == i.id)
                        .map(|e| e.ts)
                        .max()
                        .map_or(false, |ts| ts < before)
            })
            .cloned()
            .collect())
    }

    async fn closed_runs(&self, limit: i64) -> PaydayResult<Vec<i64>> {
        let state = self.state.lock();
        Ok(state
            .runs
            .values()
            .rev()
            .filter(|r| r.ts_end.is_some())
            .map(|r| r.id)
            .take(limit as usize)
            .collect())
    }

    async fn previous_ts_start(&self, run_id: i64) -> PaydayResult<DateTime<Utc>> {
        let state = self.state.lock();
        Ok(state
            .runs
            .get(&(run_id - 1))
            .map(|r| r.ts_start)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    async fn previous_ts_end(
        &self,
        before: DateTime<Utc>,
    ) -> PaydayResult<Option<DateTime<Utc>>> {
        let state = self.state.lock();
        Ok(state
            .runs
            .values()
            .filter(|r| r.ts_start < before)
            .filter_map(|r| r.ts_end)
            .max())
    }

    async fn transfers_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PaydayResult<Vec<LedgerTransfer>> {
        let state = self.state.lock();
        Ok(state
            .transfers
            .iter()
            .filter(|t| t.timestamp > since && t.timestamp <= until)
            .cloned()
            .collect())
    }

    async fn exchanges_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PaydayResult<Vec<Exchange>> {
        let state = self.state.lock();
        Ok(state
            .exchanges
            .iter()
            .filter(|e| e.timestamp >= since && e.timestamp < until)
            .cloned()
            .collect())
    }

    async fn eligible_user_count(&self, before: DateTime<Utc>) -> PaydayResult<i64> {
        let state = self.state.lock();
        Ok(state
            .participants
            .values()
            .filter(|p| {
                matches!(p.kind, Kind::Individual | Kind::Organization)
                    && p.join_time < before
                    && p.status != Status::Closed
            })
            .count() as i64)
    }

    async fn update_run_stats(&self, run_id: i64, stats: &RunStats) -> PaydayResult<()> {
        self.state.lock().stats.insert(run_id, stats.clone());
        Ok(())
    }

    async fn participant(&self, id: i64) -> PaydayResult<Option<ParticipantRow>> {
        Ok(self.state.lock().participants.get(&id).cloned())
    }

    async fn identity_required_participants(&self) -> PaydayResult<Vec<ParticipantRow>> {
        let state = self.state.lock();
        let current_tips = state.current_tips();
        Ok(state
            .participants
            .values()
            .filter(|p| {
                p.processor_account.is_none()
                    && matches!(p.kind, Kind::Individual | Kind::Organization)
                    && !matches!(p.goal, Some(goal) if goal < Decimal::ZERO)
                    && current_tips.iter().any(|t| {
                        t.tippee == p.id
                            && t.amount > Decimal::ZERO
                            && state
                                .participants
                                .get(&t.tipper)
                                .map_or(false, |tipper| tipper.balance > t.amount)
                    })
            })
            .cloned()
            .collect())
    }

    async fn low_balance_participants(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PaydayResult<Vec<ParticipantRow>> {
        let state = self.state.lock();
        let current_tips = state.current_tips();
        Ok(state
            .participants
            .values()
            .filter(|p| {
                let outgoing: Vec<&TipRow> = current_tips
                    .iter()
                    .filter(|t| {
                        t.tipper == p.id && t.amount > Decimal::ZERO && state.fundable(t.tippee)
                    })
                    .collect();
                if outgoing.is_empty() {
                    return false;
                }
                let required: Decimal = outgoing.iter().map(|t| t.amount).sum();
                p.balance < required
                    && state.transfers.iter().any(|t| {
                        t.tipper == p.id
                            && t.status == TransferStatus::Succeeded
                            && t.timestamp > since
                            && t.timestamp <= until
                    })
            })
            .cloned()
            .collect())
    }

    async fn save_cached_amounts(
        &self,
        rows: &[CachedAmounts],
        tip_flags: &[(i64, bool)],
    ) -> PaydayResult<()> {
        let mut state = self.state.lock();
        for row in rows {
            if let Some(p) = state.participants.get_mut(&row.id) {
                p.giving = row.giving;
                p.taking = row.taking;
                p.receiving = row.receiving;
                p.npatrons = row.npatrons;
            }
        }
        for (tip_id, is_funded) in tip_flags {
            if let Some(tip) = state.tips.iter_mut().find(|t| t.id == *tip_id) {
                tip.is_funded = Some(*is_funded);
            }
        }
        Ok(())
    }
}
