use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use std::fmt;

/// Participant kind - teams are "group" participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "participant_kind", rename_all = "lowercase")]
pub enum Kind {
    Individual,
    Organization,
    Group,
}

impl Kind {
    pub fn is_team(&self) -> bool {
        matches!(self, Kind::Group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "participant_status", rename_all = "lowercase")]
pub enum Status {
    Active,
    Closed,
    Stub,
}

/// Participant entity as stored - the snapshot keeps its own copy
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ParticipantRow {
    pub id: i64,
    pub username: String,
    pub join_time: DateTime<Utc>,
    pub balance: Decimal,
    pub goal: Option<Decimal>,
    pub kind: Kind,
    pub status: Status,
    pub is_suspended: bool,
    /// Payment-processor account reference; individuals and organizations
    /// need one to receive money, teams do not.
    pub processor_account: Option<String>,
    pub giving: Decimal,
    pub taking: Decimal,
    pub receiving: Decimal,
    pub npatrons: i32,
}

/// Latest pledge declaration per (tipper, tippee) pair
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TipRow {
    pub id: i64,
    pub tipper: i64,
    pub tippee: i64,
    pub amount: Decimal,
    pub mtime: DateTime<Utc>,
    /// Cached affordability flag, refreshed outside of settlement runs.
    pub is_funded: Option<bool>,
}

/// Latest take declaration per (team, member) pair
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TakeRow {
    pub team: i64,
    pub member: i64,
    pub amount: Decimal,
    pub mtime: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transfer_context", rename_all = "kebab-case")]
pub enum TransferContext {
    Tip,
    Take,
    Debt,
    Expense,
    FinalGift,
}

impl fmt::Display for TransferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferContext::Tip => "tip",
            TransferContext::Take => "take",
            TransferContext::Debt => "debt",
            TransferContext::Expense => "expense",
            TransferContext::FinalGift => "final-gift",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transfer_status", rename_all = "lowercase")]
pub enum TransferStatus {
    Succeeded,
    Failed,
}

/// Dedup key for transfers: at most one transfer per signature per run.
pub type TransferKey = (i64, i64, TransferContext, Option<i64>);

/// A proposed movement of funds, computed during the virtual phase and
/// never mutated after creation. Becomes at most one ledger transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualTransfer {
    pub tipper: i64,
    pub tippee: i64,
    pub amount: Decimal,
    pub context: TransferContext,
    pub team: Option<i64>,
    pub invoice: Option<i64>,
}

impl VirtualTransfer {
    pub fn signature(&self) -> TransferKey {
        (self.tipper, self.tippee, self.context, self.team)
    }
}

/// The durable, externally visible record of an executed transfer
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerTransfer {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub tipper: i64,
    pub tippee: i64,
    pub amount: Decimal,
    pub context: TransferContext,
    pub team: Option<i64>,
    pub invoice: Option<i64>,
    /// Points back at the transfer this one refunds, if any.
    pub refund_ref: Option<i64>,
    pub status: TransferStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "debt_status", rename_all = "lowercase")]
pub enum DebtStatus {
    Due,
    Paid,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Debt {
    pub id: i64,
    pub debtor: i64,
    pub creditor: i64,
    pub amount: Decimal,
    pub status: DebtStatus,
    /// Ledger transfer that settled this debt, once paid.
    pub settlement: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "invoice_status", rename_all = "lowercase")]
pub enum InvoiceStatus {
    Accepted,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "invoice_nature", rename_all = "lowercase")]
pub enum InvoiceNature {
    Expense,
}

impl InvoiceNature {
    pub fn transfer_context(&self) -> TransferContext {
        match self {
            InvoiceNature::Expense => TransferContext::Expense,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: i64,
    /// The participant who owes the money.
    pub addressee: i64,
    pub sender: i64,
    pub amount: Decimal,
    pub nature: InvoiceNature,
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceEvent {
    pub invoice: i64,
    pub participant: i64,
    pub status: InvoiceStatus,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "exchange_status", rename_all = "lowercase")]
pub enum ExchangeStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Money moving in or out of the platform; positive amounts are deposits,
/// negative amounts withdrawals. Read-only input to the stats aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Exchange {
    pub id: i64,
    pub participant: i64,
    pub amount: Decimal,
    pub refund_ref: Option<i64>,
    pub status: ExchangeStatus,
    pub timestamp: DateTime<Utc>,
}

/// Settlement stages, persisted as a small integer on the run row.
///
/// A phase method is a no-op when the persisted stage is already past it
/// and advances the stage by exactly one on success; this is the whole
/// crash-recovery mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Virtual,
    Transfers,
    Debts,
    Close,
    Stats,
    Notify,
}

impl Stage {
    pub fn first() -> Stage {
        Stage::Virtual
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Virtual => Some(Stage::Transfers),
            Stage::Transfers => Some(Stage::Debts),
            Stage::Debts => Some(Stage::Close),
            Stage::Close => Some(Stage::Stats),
            Stage::Stats => Some(Stage::Notify),
            Stage::Notify => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Stage::Virtual => 1,
            Stage::Transfers => 2,
            Stage::Debts => 3,
            Stage::Close => 4,
            Stage::Stats => 5,
            Stage::Notify => 6,
        }
    }

    pub fn from_i32(raw: i32) -> Option<Stage> {
        match raw {
            1 => Some(Stage::Virtual),
            2 => Some(Stage::Transfers),
            3 => Some(Stage::Debts),
            4 => Some(Stage::Close),
            5 => Some(Stage::Stats),
            6 => Some(Stage::Notify),
            _ => None,
        }
    }
}

/// One settlement run. `stage` is None only once the run has fully
/// completed; `ts_end` is set when the money-moving phases are done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub id: i64,
    pub ts_start: DateTime<Utc>,
    pub ts_end: Option<DateTime<Utc>>,
    pub stage: Option<Stage>,
    pub nparticipants: i64,
}

/// Aggregate statistics recomputed idempotently per closed run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub nactive: i64,
    pub ntippers: i64,
    pub ntippees: i64,
    pub ntips: i64,
    pub ntakes: i64,
    pub ntransfers: i64,
    pub take_volume: Decimal,
    pub transfer_volume: Decimal,
    pub transfer_volume_refunded: Decimal,
    pub nusers: i64,
    pub week_deposits: Decimal,
    pub week_deposits_refunded: Decimal,
    pub week_withdrawals: Decimal,
    pub week_withdrawals_refunded: Decimal,
}

/// Refreshed cached amounts for one participant
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAmounts {
    pub id: i64,
    pub giving: Decimal,
    pub taking: Decimal,
    pub receiving: Decimal,
    pub npatrons: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_sequence_is_linear() {
        let mut stage = Stage::first();
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            seen.push(next);
            stage = next;
        }
        assert_eq!(
            seen,
            vec![
                Stage::Virtual,
                Stage::Transfers,
                Stage::Debts,
                Stage::Close,
                Stage::Stats,
                Stage::Notify,
            ]
        );
    }

    #[test]
    fn test_stage_roundtrips_through_storage() {
        for raw in 1..=6 {
            let stage = Stage::from_i32(raw).unwrap();
            assert_eq!(stage.as_i32(), raw);
        }
        assert_eq!(Stage::from_i32(0), None);
        assert_eq!(Stage::from_i32(7), None);
    }

    #[test]
    fn test_transfer_signature_ignores_amount() {
        let a = VirtualTransfer {
            tipper: 1,
            tippee: 2,
            amount: Decimal::new(100, 2),
            context: TransferContext::Tip,
            team: None,
            invoice: None,
        };
        let mut b = a.clone();
        b.amount = Decimal::new(500, 2);
        assert_eq!(a.signature(), b.signature());
    }
}
