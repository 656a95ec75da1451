use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::prelude::FromRow;
use sqlx::PgPool;
use tracing::info;

use super::{DebtSettlement, PaydayStore, VirtualOutcome};
use crate::error::{PaydayError, PaydayResult};
use crate::ledger::models::{
    CachedAmounts, Debt, Exchange, Invoice, LedgerTransfer, ParticipantRow, RunRow, RunStats,
    Stage, TakeRow, TipRow, TransferContext, TransferKey, VirtualTransfer,
};
use crate::payday::snapshot::Snapshot;

/// Postgres-backed store. The database is the source of truth for all
/// state; the engine only ever sees rows through this type.
pub struct PgStore {
    pub pool: PgPool,
}

/// `paydays` row with the stage as the raw stored integer.
#[derive(FromRow)]
struct PgRun {
    id: i64,
    ts_start: DateTime<Utc>,
    ts_end: Option<DateTime<Utc>>,
    stage: Option<i32>,
    nparticipants: i64,
}

impl PgRun {
    fn into_run(self) -> RunRow {
        RunRow {
            id: self.id,
            ts_start: self.ts_start,
            ts_end: self.ts_end,
            stage: self.stage.and_then(Stage::from_i32),
            nparticipants: self.nparticipants,
        }
    }
}

#[derive(FromRow)]
struct PgVirtualTransfer {
    tipper: i64,
    tippee: i64,
    amount: Decimal,
    context: TransferContext,
    team: Option<i64>,
    invoice: Option<i64>,
}

#[derive(FromRow)]
struct PgSignature {
    tipper: i64,
    tippee: i64,
    context: TransferContext,
    team: Option<i64>,
}

#[derive(FromRow)]
struct PgTakeSum {
    tipper: i64,
    team: i64,
    total: Decimal,
}

const PARTICIPANT_COLUMNS: &str = "id, username, join_time, balance, goal, kind, status, \
     is_suspended, processor_account, giving, taking, receiving, npatrons";

const TRANSFER_COLUMNS: &str =
    "id, timestamp, tipper, tippee, amount, context, team, invoice, refund_ref, status";

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> PaydayResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PaydayError::Database(e.into()))?;
        info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl PaydayStore for PgStore {
    async fn try_acquire_job_lock(&self, key: i64) -> PaydayResult<bool> {
        let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(acquired.0)
    }

    async fn release_job_lock(&self, key: i64) -> PaydayResult<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn start_run(&self, cutoff: DateTime<Utc>) -> PaydayResult<Option<RunRow>> {
        // The partial unique index on open runs makes this a no-op when a
        // run is already open, so a crashed run is resumed with its
        // original start time. The cutoff guard refuses to open a new run
        // for a period that has already been settled.
        sqlx::query(
            r#"
            INSERT INTO paydays (ts_start, stage)
            SELECT now(), $1
            WHERE NOT EXISTS (SELECT 1 FROM paydays WHERE stage IS NOT NULL)
              AND NOT EXISTS (SELECT 1 FROM paydays WHERE ts_start > $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(Stage::first().as_i32())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let run = sqlx::query_as::<_, PgRun>(
            r#"
            SELECT id, ts_start, ts_end, stage, nparticipants
            FROM paydays
            WHERE stage IS NOT NULL
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(run.map(PgRun::into_run))
    }

    async fn run(&self, run_id: i64) -> PaydayResult<RunRow> {
        let run = sqlx::query_as::<_, PgRun>(
            r#"
            SELECT id, ts_start, ts_end, stage, nparticipants
            FROM paydays
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PaydayError::NoPayday)?;
        Ok(run.into_run())
    }

    async fn advance_stage(&self, run_id: i64, from: Stage) -> PaydayResult<Option<Stage>> {
        sqlx::query(
            r#"
            UPDATE paydays
            SET stage = $1
            WHERE id = $2 AND stage = $3
            "#,
        )
        .bind(from.next().map(Stage::as_i32))
        .bind(run_id)
        .bind(from.as_i32())
        .execute(&self.pool)
        .await?;

        let stage: (Option<i32>,) = sqlx::query_as("SELECT stage FROM paydays WHERE id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(stage.0.and_then(Stage::from_i32))
    }

    async fn finish_run(&self, run_id: i64) -> PaydayResult<DateTime<Utc>> {
        sqlx::query(
            r#"
            UPDATE paydays
            SET ts_end = now()
            WHERE id = $1 AND ts_end IS NULL
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        let ts_end: (Option<DateTime<Utc>>,) =
            sqlx::query_as("SELECT ts_end FROM paydays WHERE id = $1")
                .bind(run_id)
                .fetch_one(&self.pool)
                .await?;
        ts_end.0.ok_or(PaydayError::NoPayday)
    }

    async fn load_snapshot(&self, ts_start: DateTime<Utc>) -> PaydayResult<Snapshot> {
        let participants = sqlx::query_as::<_, ParticipantRow>(&format!(
            "SELECT {} FROM participants WHERE join_time < $1",
            PARTICIPANT_COLUMNS
        ))
        .bind(ts_start)
        .fetch_all(&self.pool)
        .await?;

        let tips = sqlx::query_as::<_, TipRow>(
            r#"
            SELECT id, tipper, tippee, amount, mtime, is_funded
            FROM tips
            WHERE mtime < $1
            "#,
        )
        .bind(ts_start)
        .fetch_all(&self.pool)
        .await?;

        let takes = sqlx::query_as::<_, TakeRow>(
            r#"
            SELECT team, member, amount, mtime
            FROM takes
            WHERE mtime < $1
            "#,
        )
        .bind(ts_start)
        .fetch_all(&self.pool)
        .await?;

        let take_sums = sqlx::query_as::<_, PgTakeSum>(
            r#"
            SELECT tipper, team, sum(amount) AS total
            FROM transfers
            WHERE context = 'take' AND status = 'succeeded' AND team IS NOT NULL
            GROUP BY tipper, team
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let past_take_sums: HashMap<(i64, i64), Decimal> = take_sums
            .into_iter()
            .map(|row| ((row.tipper, row.team), row.total))
            .collect();

        Ok(Snapshot::build(
            ts_start,
            participants,
            tips,
            takes,
            &past_take_sums,
        ))
    }

    async fn real_balances(&self, ids: &[i64]) -> PaydayResult<HashMap<i64, Decimal>> {
        let rows: Vec<(i64, Decimal)> =
            sqlx::query_as("SELECT id, balance FROM participants WHERE id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn commit_virtual(&self, run_id: i64, outcome: &VirtualOutcome) -> PaydayResult<()> {
        let mut tx = self.pool.begin().await?;

        // Re-running the virtual stage replaces any previous plan wholesale.
        sqlx::query("DELETE FROM payday_transfers WHERE payday = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        for transfer in &outcome.transfers {
            sqlx::query(
                r#"
                INSERT INTO payday_transfers (payday, tipper, tippee, amount, context, team, invoice)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(run_id)
            .bind(transfer.tipper)
            .bind(transfer.tippee)
            .bind(transfer.amount)
            .bind(transfer.context)
            .bind(transfer.team)
            .bind(transfer.invoice)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE paydays SET nparticipants = $1 WHERE id = $2")
            .bind(outcome.nparticipants)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        for invoice_id in &outcome.paid_invoices {
            sqlx::query("UPDATE invoices SET status = 'paid' WHERE id = $1")
                .bind(invoice_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO invoice_events (invoice, participant, status, ts)
                SELECT id, addressee, 'paid', now() FROM invoices WHERE id = $1
                "#,
            )
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn virtual_transfers(&self, run_id: i64) -> PaydayResult<Vec<VirtualTransfer>> {
        let rows = sqlx::query_as::<_, PgVirtualTransfer>(
            r#"
            SELECT tipper, tippee, amount, context, team, invoice
            FROM payday_transfers
            WHERE payday = $1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| VirtualTransfer {
                tipper: row.tipper,
                tippee: row.tippee,
                amount: row.amount,
                context: row.context,
                team: row.team,
                invoice: row.invoice,
            })
            .collect())
    }

    async fn transfer_signatures_since(
        &self,
        ts: DateTime<Utc>,
    ) -> PaydayResult<HashSet<TransferKey>> {
        let rows = sqlx::query_as::<_, PgSignature>(
            r#"
            SELECT tipper, tippee, context, team
            FROM transfers
            WHERE timestamp >= $1
            "#,
        )
        .bind(ts)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.tipper, row.tippee, row.context, row.team))
            .collect())
    }

    async fn execute_transfer(&self, transfer: &VirtualTransfer) -> PaydayResult<i64> {
        let mut tx = self.pool.begin().await?;

        // The balance guard in the WHERE clause is what makes this safe to
        // run against live balances that may have moved since the snapshot.
        let debited = sqlx::query(
            r#"
            UPDATE participants
            SET balance = balance - $1
            WHERE id = $2 AND balance >= $1
            "#,
        )
        .bind(transfer.amount)
        .bind(transfer.tipper)
        .execute(&mut *tx)
        .await?;
        if debited.rows_affected() == 0 {
            let available: Option<(Decimal,)> =
                sqlx::query_as("SELECT balance FROM participants WHERE id = $1")
                    .bind(transfer.tipper)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Err(PaydayError::InsufficientFunds {
                required: transfer.amount,
                available: available.map(|row| row.0).unwrap_or(Decimal::ZERO),
            });
        }

        sqlx::query("UPDATE participants SET balance = balance + $1 WHERE id = $2")
            .bind(transfer.amount)
            .bind(transfer.tippee)
            .execute(&mut *tx)
            .await?;

        let id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO transfers (timestamp, tipper, tippee, amount, context, team, invoice, status)
            VALUES (now(), $1, $2, $3, $4, $5, $6, 'succeeded')
            RETURNING id
            "#,
        )
        .bind(transfer.tipper)
        .bind(transfer.tippee)
        .bind(transfer.amount)
        .bind(transfer.context)
        .bind(transfer.team)
        .bind(transfer.invoice)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id.0)
    }

    async fn record_transfer_failure(
        &self,
        transfer: &VirtualTransfer,
        reason: &str,
    ) -> PaydayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transfers (timestamp, tipper, tippee, amount, context, team, invoice, status, error)
            VALUES (now(), $1, $2, $3, $4, $5, $6, 'failed', $7)
            "#,
        )
        .bind(transfer.tipper)
        .bind(transfer.tippee)
        .bind(transfer.amount)
        .bind(transfer.context)
        .bind(transfer.team)
        .bind(transfer.invoice)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn discard_virtual_transfers(&self, run_id: i64) -> PaydayResult<()> {
        sqlx::query("DELETE FROM payday_transfers WHERE payday = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn settle_next_due_debt(
        &self,
        skip: &[i64],
    ) -> PaydayResult<Option<DebtSettlement>> {
        let mut tx = self.pool.begin().await?;

        let debt = sqlx::query_as::<_, Debt>(
            r#"
            SELECT d.id, d.debtor, d.creditor, d.amount, d.status, d.settlement
            FROM debts d
            JOIN participants debtor ON debtor.id = d.debtor
            JOIN participants creditor ON creditor.id = d.creditor
            WHERE d.status = 'due'
              AND NOT (d.id = ANY($1))
              AND debtor.balance >= d.amount
              AND creditor.status = 'active'
            ORDER BY d.id
            LIMIT 1
            FOR UPDATE OF d SKIP LOCKED
            "#,
        )
        .bind(skip)
        .fetch_optional(&mut *tx)
        .await?;
        let debt = match debt {
            Some(debt) => debt,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        // The selection predicate does not lock the debtor's row, so the
        // debit keeps its own balance guard.
        let debited = sqlx::query(
            r#"
            UPDATE participants
            SET balance = balance - $1
            WHERE id = $2 AND balance >= $1
            "#,
        )
        .bind(debt.amount)
        .bind(debt.debtor)
        .execute(&mut *tx)
        .await?;
        if debited.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(Some(DebtSettlement::Skipped { debt_id: debt.id }));
        }

        sqlx::query("UPDATE participants SET balance = balance + $1 WHERE id = $2")
            .bind(debt.amount)
            .bind(debt.creditor)
            .execute(&mut *tx)
            .await?;

        let transfer_id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO transfers (timestamp, tipper, tippee, amount, context, status)
            VALUES (now(), $1, $2, $3, 'debt', 'succeeded')
            RETURNING id
            "#,
        )
        .bind(debt.debtor)
        .bind(debt.creditor)
        .bind(debt.amount)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE debts SET status = 'paid', settlement = $1 WHERE id = $2")
            .bind(transfer_id.0)
            .bind(debt.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(DebtSettlement::Paid {
            debt_id: debt.id,
            transfer_id: transfer_id.0,
        }))
    }

    async fn accepted_invoices(&self, before: DateTime<Utc>) -> PaydayResult<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT i.id, i.addressee, i.sender, i.amount, i.nature, i.status
            FROM invoices i
            WHERE i.status = 'accepted'
              AND (SELECT max(e.ts) FROM invoice_events e WHERE e.invoice = i.id) < $1
            ORDER BY i.id
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    async fn closed_runs(&self, limit: i64) -> PaydayResult<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM paydays
            WHERE ts_end IS NOT NULL
            ORDER BY ts_start DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|row| row.0).collect())
    }

    async fn previous_ts_start(&self, run_id: i64) -> PaydayResult<DateTime<Utc>> {
        let ts: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT ts_start FROM paydays
            WHERE id < $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ts.map(|row| row.0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    async fn previous_ts_end(
        &self,
        before: DateTime<Utc>,
    ) -> PaydayResult<Option<DateTime<Utc>>> {
        let ts: (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            SELECT max(ts_end) FROM paydays
            WHERE ts_start < $1 AND ts_end IS NOT NULL
            "#,
        )
        .bind(before)
        .fetch_one(&self.pool)
        .await?;
        Ok(ts.0)
    }

    async fn transfers_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PaydayResult<Vec<LedgerTransfer>> {
        let transfers = sqlx::query_as::<_, LedgerTransfer>(&format!(
            "SELECT {} FROM transfers WHERE timestamp > $1 AND timestamp <= $2",
            TRANSFER_COLUMNS
        ))
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        Ok(transfers)
    }

    async fn exchanges_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PaydayResult<Vec<Exchange>> {
        let exchanges = sqlx::query_as::<_, Exchange>(
            r#"
            SELECT id, participant, amount, refund_ref, status, timestamp
            FROM exchanges
            WHERE timestamp >= $1 AND timestamp < $2
            "#,
        )
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        Ok(exchanges)
    }

    async fn eligible_user_count(&self, before: DateTime<Utc>) -> PaydayResult<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT count(*) FROM participants
            WHERE kind IN ('individual', 'organization')
              AND join_time < $1
              AND status <> 'closed'
            "#,
        )
        .bind(before)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    async fn update_run_stats(&self, run_id: i64, stats: &RunStats) -> PaydayResult<()> {
        sqlx::query(
            r#"
            UPDATE paydays
            SET nactive = $1, ntippers = $2, ntippees = $3, ntips = $4,
                ntakes = $5, ntransfers = $6, take_volume = $7,
                transfer_volume = $8, transfer_volume_refunded = $9,
                nusers = $10, week_deposits = $11, week_deposits_refunded = $12,
                week_withdrawals = $13, week_withdrawals_refunded = $14
            WHERE id = $15
            "#,
        )
        .bind(stats.nactive)
        .bind(stats.ntippers)
        .bind(stats.ntippees)
        .bind(stats.ntips)
        .bind(stats.ntakes)
        .bind(stats.ntransfers)
        .bind(stats.take_volume)
        .bind(stats.transfer_volume)
        .bind(stats.transfer_volume_refunded)
        .bind(stats.nusers)
        .bind(stats.week_deposits)
        .bind(stats.week_deposits_refunded)
        .bind(stats.week_withdrawals)
        .bind(stats.week_withdrawals_refunded)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn participant(&self, id: i64) -> PaydayResult<Option<ParticipantRow>> {
        let participant = sqlx::query_as::<_, ParticipantRow>(&format!(
            "SELECT {} FROM participants WHERE id = $1",
            PARTICIPANT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(participant)
    }

    async fn identity_required_participants(&self) -> PaydayResult<Vec<ParticipantRow>> {
        let participants = sqlx::query_as::<_, ParticipantRow>(&format!(
            r#"
            WITH current_tips AS (
                SELECT DISTINCT ON (tipper, tippee) tipper, tippee, amount
                FROM tips
                ORDER BY tipper, tippee, mtime DESC, id DESC
            )
            SELECT {}
            FROM participants p
            WHERE p.processor_account IS NULL
              AND p.kind IN ('individual', 'organization')
              AND (p.goal IS NULL OR p.goal >= 0)
              AND EXISTS (
                  SELECT 1
                  FROM current_tips t
                  JOIN participants tipper ON tipper.id = t.tipper
                  WHERE t.tippee = p.id
                    AND t.amount > 0
                    AND tipper.balance > t.amount
              )
            "#,
            PARTICIPANT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(participants)
    }

    async fn low_balance_participants(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PaydayResult<Vec<ParticipantRow>> {
        let participants = sqlx::query_as::<_, ParticipantRow>(&format!(
            r#"
            WITH current_tips AS (
                SELECT DISTINCT ON (tipper, tippee) tipper, tippee, amount
                FROM tips
                ORDER BY tipper, tippee, mtime DESC, id DESC
            )
            SELECT {}
            FROM participants p
            WHERE p.balance < (
                  SELECT sum(t.amount)
                  FROM current_tips t
                  JOIN participants tippee ON tippee.id = t.tippee
                  WHERE t.tipper = p.id
                    AND t.amount > 0
                    AND tippee.processor_account IS NOT NULL
                    AND tippee.status = 'active'
                    AND NOT tippee.is_suspended
              )
              AND EXISTS (
                  SELECT 1 FROM transfers tr
                  WHERE tr.tipper = p.id
                    AND tr.status = 'succeeded'
                    AND tr.timestamp > $1
                    AND tr.timestamp <= $2
              )
            "#,
            PARTICIPANT_COLUMNS
        ))
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        Ok(participants)
    }

    async fn save_cached_amounts(
        &self,
        rows: &[CachedAmounts],
        tip_flags: &[(i64, bool)],
    ) -> PaydayResult<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                UPDATE participants
                SET giving = $1, taking = $2, receiving = $3, npatrons = $4
                WHERE id = $5
                "#,
            )
            .bind(row.giving)
            .bind(row.taking)
            .bind(row.receiving)
            .bind(row.npatrons)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;
        }
        for (tip_id, is_funded) in tip_flags {
            sqlx::query("UPDATE tips SET is_funded = $1 WHERE id = $2")
                .bind(is_funded)
                .bind(tip_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
