pub mod cached;
pub mod checks;
pub mod debts;
pub mod invoices;
pub mod notify;
pub mod resolver;
pub mod snapshot;
pub mod stats;
pub mod takes;

use tracing::info;

use crate::adapters::Notifier;
use crate::config::Config;
use crate::error::PaydayResult;
use crate::ledger::models::{RunRow, Stage};
use crate::store::{PaydayStore, VirtualOutcome};

/// One settlement run, driven stage by stage.
///
/// Every stage is guarded by the persisted stage marker: a stage runs only
/// when the marker points at it and advances the marker on success, so a
/// crashed process can simply be restarted and picks up where it left off.
pub struct Payday<'a> {
    store: &'a dyn PaydayStore,
    config: &'a Config,
    run: RunRow,
}

impl<'a> Payday<'a> {
    /// Create a new run, or attach to the one still open. Returns `None`
    /// when the latest run is more recent than the settlement period:
    /// the period is already settled, a second invocation has nothing to
    /// do.
    pub async fn start(
        store: &'a dyn PaydayStore,
        config: &'a Config,
    ) -> PaydayResult<Option<Payday<'a>>> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(config.period_days);
        let run = match store.start_run(cutoff).await? {
            Some(run) => run,
            None => {
                info!("the current period is already settled");
                return Ok(None);
            }
        };
        match run.stage {
            Some(Stage::Virtual) => info!(run.id, %run.ts_start, "starting payday"),
            stage => info!(run.id, %run.ts_start, ?stage, "resuming payday"),
        }
        Ok(Some(Payday { store, config, run }))
    }

    pub fn run_id(&self) -> i64 {
        self.run.id
    }

    pub async fn run(&mut self, notifier: &dyn Notifier) -> PaydayResult<()> {
        self.run_until(notifier, Stage::Notify).await?;
        info!(run_id = self.run.id, "payday complete");
        Ok(())
    }

    /// Run stages up to and including `last`, then stop. A later
    /// invocation picks the run up from the persisted stage marker.
    pub async fn run_until(&mut self, notifier: &dyn Notifier, last: Stage) -> PaydayResult<()> {
        self.run_virtual().await?;
        if last == Stage::Virtual {
            return Ok(());
        }
        self.execute_transfers().await?;
        if last == Stage::Transfers {
            return Ok(());
        }
        self.settle_debts().await?;
        if last == Stage::Debts {
            return Ok(());
        }
        self.close().await?;
        if last == Stage::Close {
            return Ok(());
        }
        self.recompute_stats().await?;
        if last == Stage::Stats {
            return Ok(());
        }
        self.notify(notifier).await
    }

    fn at(&self, stage: Stage) -> bool {
        self.run.stage == Some(stage)
    }

    async fn advance(&mut self, from: Stage) -> PaydayResult<()> {
        self.run.stage = self.store.advance_stage(self.run.id, from).await?;
        Ok(())
    }

    /// Compute the full distribution against an in-memory snapshot, audit
    /// it, and persist the resulting plan in one transaction. No real
    /// balance moves here.
    async fn run_virtual(&mut self) -> PaydayResult<()> {
        if !self.at(Stage::Virtual) {
            return Ok(());
        }
        let mut snapshot = self.store.load_snapshot(self.run.ts_start).await?;
        info!(
            nparticipants = snapshot.nparticipants(),
            ntips = snapshot.tips.len(),
            ntakes = snapshot.takes.len(),
            "snapshot loaded"
        );

        resolver::settle_tip_graph(&mut snapshot, self.config.max_resolve_iterations)?;
        for team in snapshot.team_ids() {
            takes::resolve_takes(&mut snapshot, team)?;
        }
        resolver::mark_unresolved_unfunded(&mut snapshot);
        let paid_invoices = invoices::settle_invoices(self.store, &mut snapshot).await?;

        let changed: Vec<i64> = snapshot.changed_participants().map(|p| p.id).collect();
        let real_balances = self.store.real_balances(&changed).await?;
        checks::check_balances(&snapshot, &real_balances)?;

        let outcome = VirtualOutcome {
            nparticipants: snapshot.nparticipants(),
            transfers: snapshot.transfers().to_vec(),
            paid_invoices,
        };
        info!(ntransfers = outcome.transfers.len(), "virtual phase committed");
        self.store.commit_virtual(self.run.id, &outcome).await?;
        self.advance(Stage::Virtual).await
    }

    /// Replay the committed plan against real balances. Each transfer is
    /// durable on its own; transfers already present in the ledger since
    /// run start (failed ones included) are skipped, which is what makes
    /// a rerun of this stage safe.
    async fn execute_transfers(&mut self) -> PaydayResult<()> {
        if !self.at(Stage::Transfers) {
            return Ok(());
        }
        let plan = self.store.virtual_transfers(self.run.id).await?;
        let done = self
            .store
            .transfer_signatures_since(self.run.ts_start)
            .await?;
        let mut executed = 0usize;
        for transfer in &plan {
            if done.contains(&transfer.signature()) {
                continue;
            }
            match self.store.execute_transfer(transfer).await {
                Ok(_) => executed += 1,
                Err(crate::error::PaydayError::InsufficientFunds {
                    required,
                    available,
                }) => {
                    tracing::warn!(
                        tipper = transfer.tipper,
                        tippee = transfer.tippee,
                        %required,
                        %available,
                        "transfer failed, balance moved since snapshot"
                    );
                    self.store
                        .record_transfer_failure(transfer, "insufficient funds")
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
        info!(executed, planned = plan.len(), "transfers executed");
        self.advance(Stage::Transfers).await
    }

    async fn settle_debts(&mut self) -> PaydayResult<()> {
        if !self.at(Stage::Debts) {
            return Ok(());
        }
        let settled = debts::settle_debts(self.store).await?;
        info!(settled, "debts settled");
        self.advance(Stage::Debts).await
    }

    /// Money has stopped moving: stamp the end time, drop the plan, and
    /// refresh the cached amounts the rest of the system reads.
    async fn close(&mut self) -> PaydayResult<()> {
        if !self.at(Stage::Close) {
            return Ok(());
        }
        self.run.ts_end = Some(self.store.finish_run(self.run.id).await?);
        self.store.discard_virtual_transfers(self.run.id).await?;
        if self.config.update_cached_amounts {
            cached::update_cached_amounts(self.store, self.config).await?;
        }
        self.advance(Stage::Close).await
    }

    async fn recompute_stats(&mut self) -> PaydayResult<()> {
        if !self.at(Stage::Stats) {
            return Ok(());
        }
        for run_id in self
            .store
            .closed_runs(self.config.recompute_stats_limit)
            .await?
        {
            stats::recompute_stats(self.store, run_id).await?;
        }
        self.advance(Stage::Stats).await
    }

    async fn notify(&mut self, notifier: &dyn Notifier) -> PaydayResult<()> {
        if !self.at(Stage::Notify) {
            return Ok(());
        }
        // finish_run already ran; refresh our copy in case we resumed here.
        let run = self.store.run(self.run.id).await?;
        notify::notify_participants(self.store, notifier, &run).await?;
        self.advance(Stage::Notify).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{NotifyEvent, NullNotifier};
    use crate::ledger::models::{
        DebtStatus, ExchangeStatus, InvoiceStatus, Kind, ParticipantRow, TransferContext,
        TransferStatus,
    };
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(i64, NotifyEvent)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, participant: i64, event: NotifyEvent) -> PaydayResult<()> {
            self.events.lock().push((participant, event));
            Ok(())
        }
    }

    async fn start_payday<'a>(store: &'a MemoryStore, config: &'a Config) -> Payday<'a> {
        Payday::start(store, config)
            .await
            .unwrap()
            .expect("a run should start")
    }

    async fn run_payday(store: &MemoryStore) {
        let config = Config::for_tests();
        let mut payday = start_payday(store, &config).await;
        payday.run(&NullNotifier).await.unwrap();
    }

    /// A donor, a direct recipient, and a funded team: the run moves money
    /// around but the total across all participants never changes, and
    /// nobody is pushed (further) below zero.
    #[tokio::test]
    async fn test_full_run_conserves_total_balance() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(100), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        store.add_participant(3, dec!(0), Kind::Individual);
        store.add_participant(10, dec!(0), Kind::Group);
        store.add_tip(1, 2, dec!(10));
        store.add_tip(1, 10, dec!(20));
        store.add_take(10, 2, dec!(5));
        store.add_take(10, 3, dec!(15));

        let ids = [1, 2, 3, 10];
        let before: Decimal = ids.iter().map(|id| store.balance(*id)).sum();
        run_payday(&store).await;
        let after: Decimal = ids.iter().map(|id| store.balance(*id)).sum();
        assert_eq!(before, after);
        for id in ids {
            assert!(store.balance(id) >= Decimal::ZERO);
        }
        // The team itself holds nothing: its income went straight to members.
        assert_eq!(store.balance(10), dec!(0));
        assert_eq!(store.balance(2), dec!(15));
        assert_eq!(store.balance(3), dec!(15));
    }

    #[tokio::test]
    async fn test_completed_run_clears_stage_and_sets_ts_end() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(10), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        store.add_tip(1, 2, dec!(5));

        run_payday(&store).await;
        let run = store.run_row(1).unwrap();
        assert_eq!(run.stage, None);
        assert!(run.ts_end.is_some());
        assert_eq!(run.nparticipants, 2);
        // The committed plan is gone once the run has closed.
        assert!(store.virtual_transfers(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_starting_twice_attaches_to_the_open_run() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(10), Kind::Individual);
        let config = Config::for_tests();

        let first = start_payday(&store, &config).await;
        let ts_start = first.run.ts_start;
        drop(first);
        let second = start_payday(&store, &config).await;
        assert_eq!(second.run_id(), 1);
        assert_eq!(second.run.ts_start, ts_start);
    }

    /// Running the whole job again right away must not move any more
    /// money: the period is already settled.
    #[tokio::test]
    async fn test_rerun_within_the_period_is_a_noop() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(20), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        store.add_tip(1, 2, dec!(10));
        let config = Config::for_tests();

        run_payday(&store).await;
        let transfers = store.ledger_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].context, TransferContext::Tip);
        assert_eq!(store.tip_rows()[0].is_funded, Some(true));

        assert!(Payday::start(&store, &config).await.unwrap().is_none());
        assert_eq!(store.ledger_transfers().len(), 1);
        assert_eq!(store.balance(1), dec!(10));
        assert_eq!(store.balance(2), dec!(10));
    }

    #[tokio::test]
    async fn test_next_period_gets_a_new_run() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(10), Kind::Individual);
        let mut config = Config::for_tests();
        config.period_days = 0;

        run_payday(&store).await;
        let next = start_payday(&store, &config).await;
        assert_eq!(next.run_id(), 2);
    }

    /// Crash after the transfer stage started: one planned transfer already
    /// hit the ledger. The resumed run must not execute it a second time.
    #[tokio::test]
    async fn test_resume_skips_already_executed_transfers() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(20), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        store.add_tip(1, 2, dec!(10));
        let config = Config::for_tests();

        let mut payday = start_payday(&store, &config).await;
        payday
            .run_until(&NullNotifier, Stage::Virtual)
            .await
            .unwrap();
        let run_id = payday.run_id();
        let plan = store.virtual_transfers(run_id).await.unwrap();
        assert_eq!(plan.len(), 1);
        store.execute_transfer(&plan[0]).await.unwrap();
        drop(payday);

        let mut resumed = start_payday(&store, &config).await;
        assert_eq!(resumed.run_id(), run_id);
        resumed.run(&NullNotifier).await.unwrap();

        assert_eq!(store.ledger_transfers().len(), 1);
        assert_eq!(store.balance(1), dec!(10));
        assert_eq!(store.balance(2), dec!(10));
    }

    #[tokio::test]
    async fn test_invoices_settle_during_the_run() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(40), Kind::Organization);
        store.add_participant(2, dec!(0), Kind::Individual);
        let covered = store.add_invoice(1, 2, dec!(30));
        let uncovered = store.add_invoice(1, 2, dec!(100));

        run_payday(&store).await;
        assert_eq!(store.invoice(covered).status, InvoiceStatus::Paid);
        assert_eq!(store.invoice(uncovered).status, InvoiceStatus::Accepted);
        assert_eq!(store.balance(2), dec!(30));
        let transfers = store.ledger_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].context, TransferContext::Expense);
        assert_eq!(transfers[0].invoice, Some(covered));
    }

    /// The debt stage runs after transfers, so a debtor can repay out of
    /// the money the same run just brought in.
    #[tokio::test]
    async fn test_debt_paid_out_of_incoming_tips() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(20), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        store.add_participant(3, dec!(0), Kind::Individual);
        store.add_tip(1, 2, dec!(10));
        let debt_id = store.add_debt(2, 3, dec!(8));

        run_payday(&store).await;
        assert_eq!(store.debt(debt_id).status, DebtStatus::Paid);
        assert_eq!(store.balance(2), dec!(2));
        assert_eq!(store.balance(3), dec!(8));
    }

    #[tokio::test]
    async fn test_stats_are_written_and_recomputable() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(50), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        store.add_participant(3, dec!(0), Kind::Individual);
        store.add_tip(1, 2, dec!(10));
        // Settled during the same run, but not donation activity.
        store.add_debt(2, 3, dec!(8));
        store.add_exchange(1, dec!(50), ExchangeStatus::Succeeded);
        store.add_exchange(2, dec!(-20), ExchangeStatus::Succeeded);

        run_payday(&store).await;
        let written = store.run_stats(1).unwrap();
        assert_eq!(written.ntransfers, 1);
        assert_eq!(written.ntips, 1);
        assert_eq!(written.transfer_volume, dec!(10));
        assert_eq!(written.nactive, 2);
        assert_eq!(written.ntippers, 1);
        assert_eq!(written.ntippees, 1);
        assert_eq!(written.nusers, 3);
        assert_eq!(written.week_deposits, dec!(50));
        assert_eq!(written.week_withdrawals, dec!(20));

        // Recomputing from the ledger lands on the same numbers.
        let again = stats::recompute_stats(&store, 1).await.unwrap();
        assert_eq!(again, written);
        assert_eq!(store.run_stats(1).unwrap(), written);
    }

    #[tokio::test]
    async fn test_income_notifications_split_personal_and_team_shares() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(30), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        store.add_participant(10, dec!(0), Kind::Group);
        store.add_tip(1, 2, dec!(10));
        store.add_tip(1, 10, dec!(10));
        store.add_take(10, 2, dec!(10));

        let config = Config::for_tests();
        let notifier = RecordingNotifier::default();
        let mut payday = start_payday(&store, &config).await;
        payday.run(&notifier).await.unwrap();

        let events = notifier.events.lock();
        let income = events
            .iter()
            .find(|(id, _)| *id == 2)
            .map(|(_, event)| event.clone())
            .unwrap();
        match income {
            NotifyEvent::Income {
                total,
                personal,
                by_team,
                new_balance,
            } => {
                assert_eq!(total, dec!(20));
                assert_eq!(personal, dec!(10));
                assert_eq!(by_team.get(&10), Some(&dec!(10)));
                assert_eq!(new_balance, dec!(20));
            }
            other => panic!("expected an income event, got {:?}", other),
        }
        // The team is an intermediary, not a recipient.
        assert!(!events.iter().any(|(id, _)| *id == 10));
    }

    /// A settled debt credits the creditor but is not income: no summary
    /// for them, and the tip recipient's total excludes the repayment.
    #[tokio::test]
    async fn test_debt_repayment_is_not_reported_as_income() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(20), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        store.add_participant(3, dec!(0), Kind::Individual);
        store.add_tip(1, 2, dec!(10));
        store.add_debt(1, 3, dec!(8));

        let config = Config::for_tests();
        let notifier = RecordingNotifier::default();
        let mut payday = start_payday(&store, &config).await;
        payday.run(&notifier).await.unwrap();

        assert_eq!(store.balance(3), dec!(8));
        let events = notifier.events.lock();
        assert!(!events
            .iter()
            .any(|(id, event)| *id == 3 && matches!(event, NotifyEvent::Income { .. })));
        let income = events
            .iter()
            .find(|(id, _)| *id == 2)
            .map(|(_, event)| event.clone())
            .unwrap();
        match income {
            NotifyEvent::Income { total, .. } => assert_eq!(total, dec!(10)),
            other => panic!("expected an income event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identity_required_notification() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(20), Kind::Individual);
        store.add_participant_row(ParticipantRow {
            id: 5,
            username: "unverified".to_string(),
            join_time: Utc::now() - Duration::hours(1),
            balance: Decimal::ZERO,
            goal: None,
            kind: Kind::Individual,
            status: crate::ledger::models::Status::Active,
            is_suspended: false,
            processor_account: None,
            giving: Decimal::ZERO,
            taking: Decimal::ZERO,
            receiving: Decimal::ZERO,
            npatrons: 0,
        });
        store.add_tip(1, 5, dec!(5));

        let config = Config::for_tests();
        let notifier = RecordingNotifier::default();
        let mut payday = start_payday(&store, &config).await;
        payday.run(&notifier).await.unwrap();

        // No money moved: the recipient is not part of the snapshot.
        assert!(store.ledger_transfers().is_empty());
        let events = notifier.events.lock();
        assert!(events.contains(&(5, NotifyEvent::IdentityRequired)));
    }

    #[tokio::test]
    async fn test_low_balance_notification_after_partial_funding() {
        let store = MemoryStore::new();
        store.add_participant(1, dec!(10), Kind::Individual);
        store.add_participant(2, dec!(0), Kind::Individual);
        store.add_participant(3, dec!(0), Kind::Individual);
        store.add_tip(1, 2, dec!(8));
        store.add_tip(1, 3, dec!(8));

        let config = Config::for_tests();
        let notifier = RecordingNotifier::default();
        let mut payday = start_payday(&store, &config).await;
        payday.run(&notifier).await.unwrap();

        // Only one of the two pledges could be funded; what is left does
        // not cover next week.
        let succeeded: Vec<_> = store
            .ledger_transfers()
            .into_iter()
            .filter(|t| t.status == TransferStatus::Succeeded)
            .collect();
        assert_eq!(succeeded.len(), 1);
        let events = notifier.events.lock();
        assert!(events.contains(&(1, NotifyEvent::LowBalance)));
    }
}
