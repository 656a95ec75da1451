use rust_decimal::Decimal;
use thiserror::Error;

use crate::ledger::models::TransferContext;

/// Top-level error type for the settlement job
#[derive(Error, Debug)]
pub enum PaydayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Consistency fault: {0}")]
    Consistency(#[from] ConsistencyFault),

    /// Recoverable: the prospective transfer is skipped, the underlying
    /// record stays untouched for a future run.
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    /// Another invocation holds the job lock. Expected under concurrent
    /// scheduling; the caller exits non-fatally.
    #[error("Another payday is already running")]
    AlreadyRunning,

    #[error("No payday found where one was expected")]
    NoPayday,

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Fatal data-integrity or logic faults. Never retried: the current
/// transactional phase is aborted and operator intervention is required.
#[derive(Error, Debug)]
pub enum ConsistencyFault {
    #[error("Funding graph did not converge within {0} iterations")]
    NonConvergence(u32),

    #[error("Participant {0} is missing from the payday snapshot")]
    MissingParticipant(i64),

    #[error(
        "Balance of {username} (id {id}) would become more negative: \
         {new_balance} < {cur_balance}"
    )]
    NegativeBalance {
        id: i64,
        username: String,
        new_balance: Decimal,
        cur_balance: Decimal,
    },

    #[error("Duplicate transfer ({tipper} -> {tippee}, {context:?}, team {team:?})")]
    DuplicateTransfer {
        tipper: i64,
        tippee: i64,
        context: TransferContext,
        team: Option<i64>,
    },

    #[error("Computed payout {amount} out of range for tip {tip} (full amount {full_amount})")]
    PayoutOutOfRange {
        tip: i64,
        amount: Decimal,
        full_amount: Decimal,
    },
}

pub type PaydayResult<T> = Result<T, PaydayError>;
