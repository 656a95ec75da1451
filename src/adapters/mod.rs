use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::PaydayResult;

/// A notification owed to one participant at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyEvent {
    /// Money arrived this run: the personal portion plus per-team shares.
    Income {
        total: Decimal,
        personal: Decimal,
        by_team: HashMap<i64, Decimal>,
        new_balance: Decimal,
    },
    /// Donors are waiting but the participant cannot receive money until
    /// they link a payment-processor account.
    IdentityRequired,
    /// The balance no longer covers the participant's outgoing pledges.
    LowBalance,
}

/// Delivery seam for end-of-run notifications. The engine computes who is
/// owed which event; delivery (email, web, queue) lives behind this trait.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, participant: i64, event: NotifyEvent) -> PaydayResult<()>;
}

/// Logs the events it would deliver. Used when no delivery backend is
/// configured and by the test suite's recording double.
#[derive(Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, participant: i64, event: NotifyEvent) -> PaydayResult<()> {
        debug!(participant, ?event, "notification suppressed");
        Ok(())
    }
}

/// Pre-run hook for pulling fresh account state from the payment processor.
/// The engine calls it once before starting a run; failures abort the run
/// before any money has moved.
#[async_trait]
pub trait ProcessorSync: Send + Sync {
    async fn sync_accounts(&self) -> PaydayResult<()>;
}

#[derive(Default)]
pub struct NullProcessorSync;

#[async_trait]
impl ProcessorSync for NullProcessorSync {
    async fn sync_accounts(&self) -> PaydayResult<()> {
        Ok(())
    }
}
