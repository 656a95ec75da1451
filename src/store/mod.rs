pub mod memory;
pub mod postgres;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::PaydayResult;
use crate::ledger::models::{
    CachedAmounts, Exchange, Invoice, LedgerTransfer, ParticipantRow, RunRow, RunStats, Stage,
    TransferKey, VirtualTransfer,
};
use crate::payday::snapshot::Snapshot;

/// Everything the virtual phase produced, persisted in one transaction by
/// `commit_virtual`: either all of it commits or none of it does.
#[derive(Debug, Clone, Default)]
pub struct VirtualOutcome {
    pub nparticipants: i64,
    pub transfers: Vec<VirtualTransfer>,
    /// Invoices settled against snapshot balances; marked paid atomically
    /// with the virtual transfers that will pay them.
    pub paid_invoices: Vec<i64>,
}

/// Outcome of one atomic debt-settlement attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebtSettlement {
    /// The debt and the ledger transfer that paid it.
    Paid { debt_id: i64, transfer_id: i64 },
    /// The debtor's balance moved between selection and debit; the debt
    /// stays due.
    Skipped { debt_id: i64 },
}

/// The backing-store seam. The store provides transactions, durable rows
/// and row-level locking; the engine issues well-defined read/write
/// operations against it and never reimplements its machinery.
#[async_trait]
pub trait PaydayStore: Send + Sync {
    /// Process-wide advisory lock for the whole job. Non-blocking: a
    /// second invocation must fail fast, not wait.
    async fn try_acquire_job_lock(&self, key: i64) -> PaydayResult<bool>;
    async fn release_job_lock(&self, key: i64) -> PaydayResult<()>;

    /// Attach to the currently open run (stage not yet cleared),
    /// preserving its original start time; otherwise create a new run,
    /// but only if no previous run started after `cutoff`. `None` means
    /// the current period is already settled. Run ids are monotonically
    /// increasing.
    async fn start_run(&self, cutoff: DateTime<Utc>) -> PaydayResult<Option<RunRow>>;
    async fn run(&self, run_id: i64) -> PaydayResult<RunRow>;
    /// Advance the stage by exactly one, only if it still equals `from`;
    /// past the last stage the stage is cleared. Returns the new stage.
    async fn advance_stage(&self, run_id: i64, from: Stage) -> PaydayResult<Option<Stage>>;
    /// Set `ts_end` once; later calls return the recorded value.
    async fn finish_run(&self, run_id: i64) -> PaydayResult<DateTime<Utc>>;

    /// Raw rows for the snapshot builder, as of `ts_start`.
    async fn load_snapshot(&self, ts_start: DateTime<Utc>) -> PaydayResult<Snapshot>;
    async fn real_balances(&self, ids: &[i64]) -> PaydayResult<HashMap<i64, Decimal>>;
    async fn commit_virtual(&self, run_id: i64, outcome: &VirtualOutcome) -> PaydayResult<()>;

    async fn virtual_transfers(&self, run_id: i64) -> PaydayResult<Vec<VirtualTransfer>>;
    async fn transfer_signatures_since(
        &self,
        ts: DateTime<Utc>,
    ) -> PaydayResult<HashSet<TransferKey>>;
    /// Execute one transfer for real: an independent durable operation.
    /// Fails with `InsufficientFunds` when the debit would overdraw.
    async fn execute_transfer(&self, transfer: &VirtualTransfer) -> PaydayResult<i64>;
    async fn record_transfer_failure(
        &self,
        transfer: &VirtualTransfer,
        reason: &str,
    ) -> PaydayResult<()>;
    async fn discard_virtual_transfers(&self, run_id: i64) -> PaydayResult<()>;

    /// Settle one due debt whose debtor can afford it and whose creditor
    /// is active, in a single transaction: the debt row stays locked from
    /// selection until the paying transfer and the status flip commit
    /// together. `skip` holds debts already passed over this run; `None`
    /// means nothing is left to settle.
    async fn settle_next_due_debt(&self, skip: &[i64])
        -> PaydayResult<Option<DebtSettlement>>;

    /// Accepted invoices whose most recent status event predates `before`.
    async fn accepted_invoices(&self, before: DateTime<Utc>) -> PaydayResult<Vec<Invoice>>;

    /// Ids of closed runs, most recent first.
    async fn closed_runs(&self, limit: i64) -> PaydayResult<Vec<i64>>;
    async fn previous_ts_start(&self, run_id: i64) -> PaydayResult<DateTime<Utc>>;
    async fn previous_ts_end(&self, before: DateTime<Utc>)
        -> PaydayResult<Option<DateTime<Utc>>>;
    async fn transfers_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PaydayResult<Vec<LedgerTransfer>>;
    async fn exchanges_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PaydayResult<Vec<Exchange>>;
    async fn eligible_user_count(&self, before: DateTime<Utc>) -> PaydayResult<i64>;
    async fn update_run_stats(&self, run_id: i64, stats: &RunStats) -> PaydayResult<()>;

    async fn participant(&self, id: i64) -> PaydayResult<Option<ParticipantRow>>;
    /// Participants who receive affordable pledges but cannot accept money
    /// until they link a payment-processor account.
    async fn identity_required_participants(&self) -> PaydayResult<Vec<ParticipantRow>>;
    /// Participants whose balance no longer covers their outgoing pledges
    /// and who gave something during the window.
    async fn low_balance_participants(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PaydayResult<Vec<ParticipantRow>>;

    /// Refresh cached per-participant amounts and tip funded flags. Never
    /// moves money.
    async fn save_cached_amounts(
        &self,
        rows: &[CachedAmounts],
        tip_flags: &[(i64, bool)],
    ) -> PaydayResult<()>;
}
