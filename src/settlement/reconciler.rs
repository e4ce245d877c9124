use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::retry::with_retry;
use crate::error::AppResult;
use crate::events::{EventBus, IncomeEvent};
use crate::ledger::models::{amount_string, normalize_tx_ref};
use crate::ledger::IncomeStore;

/// What a batch transfer did to the ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Records the transfer was distributed over
    pub matched: usize,
    #[serde(with = "amount_string")]
    pub expected_total: u128,
    /// Sum of all `value_received` increments
    #[serde(with = "amount_string")]
    pub distributed: u128,
    /// Subtasks whose outstanding balance reached zero
    pub confirmed: Vec<String>,
}

impl BatchOutcome {
    /// Nothing outstanding matched; the event was most likely handled already
    pub fn is_duplicate(&self) -> bool {
        self.expected_total == 0
    }
}

/// Matches on-chain transfers to outstanding income expectations
pub struct IncomeReconciler {
    store: Arc<dyn IncomeStore>,
    bus: Arc<dyn EventBus>,
    retry_attempts: u32,
}

impl IncomeReconciler {
    pub fn new(store: Arc<dyn IncomeStore>, bus: Arc<dyn EventBus>, retry_attempts: u32) -> Self {
        Self {
            store,
            bus,
            retry_attempts,
        }
    }

    /// Distribute one transfer from `payer_address` over every accepted,
    /// unpaid, unsettled expectation accepted no later than `closure_time`,
    /// oldest first.
    pub async fn process_batch_transfer(
        &self,
        tx_ref: &str,
        payer_address: &str,
        amount: u128,
        closure_time: i64,
    ) -> AppResult<BatchOutcome> {
        let outcome = with_retry("batch transfer", self.retry_attempts, move || {
            self.apply_batch_transfer(tx_ref, payer_address, amount, closure_time)
        })
        .await?;

        for subtask_id in &outcome.confirmed {
            self.bus.publish(IncomeEvent::Confirmed {
                subtask_id: subtask_id.clone(),
            });
        }

        Ok(outcome)
    }

    /// Forced payments reconcile exactly like voluntary batch transfers
    pub async fn process_forced_payment(
        &self,
        tx_ref: &str,
        payer_address: &str,
        amount: u128,
        closure_time: i64,
    ) -> AppResult<BatchOutcome> {
        info!("Received forced payment from {}", payer_address);
        self.process_batch_transfer(tx_ref, payer_address, amount, closure_time)
            .await
    }

    /// Attach a forced single-subtask payment to its expectation. The paid
    /// value is authoritative and replaces `value_expected` when they differ.
    ///
    /// Returns `false` when no expectation exists for the subtask.
    pub async fn process_forced_subtask_payment(
        &self,
        tx_ref: &str,
        payer_address: &str,
        subtask_id: &str,
        value: u128,
    ) -> AppResult<bool> {
        with_retry("forced subtask payment", self.retry_attempts, move || {
            self.apply_forced_subtask_payment(tx_ref, payer_address, subtask_id, value)
        })
        .await
    }

    async fn apply_batch_transfer(
        &self,
        tx_ref: &str,
        payer_address: &str,
        amount: u128,
        closure_time: i64,
    ) -> AppResult<BatchOutcome> {
        let mut tx = self.store.begin().await?;
        let expected = tx.by_payer_and_window(payer_address, closure_time).await?;

        let expected_total = expected
            .iter()
            .fold(0u128, |total, income| total.saturating_add(income.value_expected));

        if expected_total == 0 {
            debug!(
                "Batch transfer {} from {} matches nothing outstanding, probably already handled",
                tx_ref, payer_address
            );
            return Ok(BatchOutcome::default());
        }

        if expected_total != amount {
            warn!(
                "Batch transfer amount does not match, expected {}, got {} (tx {}, payer {})",
                expected_total, amount, tx_ref, payer_address
            );
        }

        let transaction_ref = normalize_tx_ref(tx_ref);
        let mut remaining = amount;
        let mut outcome = BatchOutcome {
            matched: expected.len(),
            expected_total,
            ..BatchOutcome::default()
        };

        for mut income in expected {
            let received = remaining.min(income.value_expected);
            income.value_received = income.value_received.saturating_add(received);
            remaining -= received;
            outcome.distributed += received;
            income.transaction_ref = Some(transaction_ref.clone());
            tx.save(&income).await?;

            if income.is_paid_in_full() {
                outcome.confirmed.push(income.subtask_id);
            }
        }

        tx.commit().await?;

        info!(
            "💰 Batch transfer {} from {} distributed {} over {} incomes ({} confirmed)",
            transaction_ref,
            payer_address,
            outcome.distributed,
            outcome.matched,
            outcome.confirmed.len()
        );

        Ok(outcome)
    }

    async fn apply_forced_subtask_payment(
        &self,
        tx_ref: &str,
        payer_address: &str,
        subtask_id: &str,
        value: u128,
    ) -> AppResult<bool> {
        let mut tx = self.store.begin().await?;

        let mut income = match tx.by_payer_and_subtask(payer_address, subtask_id).await? {
            Some(income) => income,
            None => {
                info!(
                    "Received forced subtask payment but there's no entry for subtask_id={:?}",
                    subtask_id
                );
                return Ok(false);
            }
        };

        income.transaction_ref = Some(normalize_tx_ref(tx_ref));
        if income.value_expected != value {
            warn!(
                "Received wrong amount for forced subtask payment of {:?}. Expected {}, got {}",
                subtask_id, income.value_expected, value
            );
            income.value_expected = value;
        }

        tx.save(&income).await?;
        tx.commit().await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingBus;
    use crate::ledger::memory::testing::FaultyStore;
    use crate::ledger::{Income, MemoryIncomeStore};
    use crate::settlement::lifecycle::IncomeLifecycle;

    struct Harness {
        store: Arc<MemoryIncomeStore>,
        bus: Arc<RecordingBus>,
        lifecycle: IncomeLifecycle,
        reconciler: IncomeReconciler,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryIncomeStore::new());
        let bus = Arc::new(RecordingBus::default());
        Harness {
            lifecycle: IncomeLifecycle::new(store.clone(), 3),
            reconciler: IncomeReconciler::new(store.clone(), bus.clone(), 3),
            store,
            bus,
        }
    }

    impl Harness {
        async fn accepted(&self, subtask: &str, payer: &str, value: u128, accepted_ts: i64) {
            self.lifecycle
                .expect("node-1", subtask, payer, value)
                .await
                .unwrap();
            self.lifecycle
                .update_awaiting("node-1", subtask, accepted_ts)
                .await
                .unwrap();
        }

        async fn income(&self, subtask: &str) -> Income {
            self.store
                .list_all()
                .await
                .unwrap()
                .into_iter()
                .find(|i| i.subtask_id == subtask)
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_single_transfer_confirms_income() {
        let h = harness();
        h.accepted("s1", "0xA", 100, 1000).await;

        let outcome = h
            .reconciler
            .process_batch_transfer("0xT1", "0xA", 100, 1000)
            .await
            .unwrap();

        let income = h.income("s1").await;
        assert_eq!(income.value_received, 100);
        assert_eq!(income.transaction_ref.as_deref(), Some("T1"));
        assert_eq!(outcome.confirmed, vec!["s1".to_string()]);
        assert_eq!(
            h.bus.events(),
            vec![IncomeEvent::Confirmed {
                subtask_id: "s1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_transfer_is_split_across_matured_incomes() {
        let h = harness();
        h.accepted("s1", "0xA", 30, 900).await;
        h.accepted("s2", "0xA", 70, 950).await;

        let outcome = h
            .reconciler
            .process_batch_transfer("0xT2", "0xA", 100, 1000)
            .await
            .unwrap();

        assert_eq!(h.income("s1").await.value_received, 30);
        assert_eq!(h.income("s2").await.value_received, 70);
        assert_eq!(outcome.distributed, 100);
        assert_eq!(h.bus.names(), vec!["confirmed", "confirmed"]);
    }

    #[tokio::test]
    async fn test_short_transfer_fills_oldest_first() {
        let h = harness();
        h.accepted("s1", "0xA", 100, 900).await;
        h.accepted("s2", "0xA", 50, 900).await;

        let outcome = h
            .reconciler
            .process_batch_transfer("0xT3", "0xA", 100, 1000)
            .await
            .unwrap();

        assert_eq!(outcome.expected_total, 150);
        assert_eq!(outcome.distributed, 100);

        let first = h.income("s1").await;
        assert_eq!(first.value_received, 100);
        assert!(first.is_paid_in_full());

        let second = h.income("s2").await;
        assert_eq!(second.value_received, 0);
        assert_eq!(second.transaction_ref.as_deref(), Some("T3"));
        assert_eq!(second.outstanding(), 50);

        assert_eq!(
            h.bus.events(),
            vec![IncomeEvent::Confirmed {
                subtask_id: "s1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_overpayment_never_exceeds_expectation() {
        let h = harness();
        h.accepted("s1", "0xA", 40, 900).await;
        h.accepted("s2", "0xA", 60, 900).await;

        let outcome = h
            .reconciler
            .process_batch_transfer("0xT4", "0xA", 250, 1000)
            .await
            .unwrap();

        assert_eq!(outcome.distributed, 100);
        for income in h.store.list_all().await.unwrap() {
            assert!(income.value_received <= income.value_expected);
        }
    }

    #[tokio::test]
    async fn test_redelivered_transfer_is_a_noop() {
        let h = harness();
        h.accepted("s1", "0xA", 100, 1000).await;
        h.reconciler
            .process_batch_transfer("0xT1", "0xA", 100, 1000)
            .await
            .unwrap();
        let before = h.store.list_all().await.unwrap();

        let outcome = h
            .reconciler
            .process_batch_transfer("0xT1", "0xA", 100, 1000)
            .await
            .unwrap();

        assert!(outcome.is_duplicate());
        assert_eq!(h.store.list_all().await.unwrap(), before);
        assert_eq!(h.bus.events().len(), 1);
    }

    #[tokio::test]
    async fn test_only_matching_window_and_payer_are_touched() {
        let h = harness();
        h.accepted("inside", "0xA", 10, 1000).await;
        h.accepted("late", "0xA", 10, 1001).await;
        h.accepted("other-payer", "0xB", 10, 900).await;
        h.lifecycle
            .expect("node-1", "never-accepted", "0xA", 10)
            .await
            .unwrap();
        h.accepted("settled", "0xA", 10, 900).await;
        h.lifecycle.settle("node-1", "settled", 950).await.unwrap();

        let outcome = h
            .reconciler
            .process_batch_transfer("0xT5", "0xA", 10, 1000)
            .await
            .unwrap();

        assert_eq!(outcome.matched, 1);
        assert_eq!(h.income("inside").await.value_received, 10);
        for untouched in ["late", "other-payer", "never-accepted", "settled"] {
            let income = h.income(untouched).await;
            assert_eq!(income.value_received, 0, "{}", untouched);
            assert!(income.transaction_ref.is_none(), "{}", untouched);
        }
    }

    #[tokio::test]
    async fn test_forced_payment_matches_like_batch_transfer() {
        let h = harness();
        h.accepted("s1", "0xA", 100, 1000).await;

        let outcome = h
            .reconciler
            .process_forced_payment("0xF1", "0xA", 100, 1000)
            .await
            .unwrap();

        assert_eq!(outcome.confirmed, vec!["s1".to_string()]);
        assert_eq!(h.income("s1").await.transaction_ref.as_deref(), Some("F1"));
    }

    #[tokio::test]
    async fn test_forced_subtask_payment_overwrites_expected_value() {
        let h = harness();
        h.lifecycle.expect("node-1", "s1", "0xA", 100).await.unwrap();

        let found = h
            .reconciler
            .process_forced_subtask_payment("0xF2", "0xA", "s1", 80)
            .await
            .unwrap();

        assert!(found);
        let income = h.income("s1").await;
        assert_eq!(income.value_expected, 80);
        assert_eq!(income.transaction_ref.as_deref(), Some("F2"));
        assert!(h.bus.events().is_empty());
    }

    #[tokio::test]
    async fn test_forced_subtask_payment_without_expectation_is_ignored() {
        let h = harness();
        h.lifecycle.expect("node-1", "s1", "0xA", 100).await.unwrap();

        let found = h
            .reconciler
            .process_forced_subtask_payment("0xF3", "0xB", "s1", 100)
            .await
            .unwrap();

        assert!(!found);
        assert!(h.income("s1").await.transaction_ref.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_transfers_do_not_double_count() {
        let h = Arc::new(harness());
        h.accepted("s1", "0xA", 100, 1000).await;

        let first = {
            let h = h.clone();
            tokio::spawn(async move {
                h.reconciler
                    .process_batch_transfer("0xT1", "0xA", 100, 1000)
                    .await
            })
        };
        let second = {
            let h = h.clone();
            tokio::spawn(async move {
                h.reconciler
                    .process_batch_transfer("0xT1", "0xA", 100, 1000)
                    .await
            })
        };

        let outcomes = vec![first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        let distributed: u128 = outcomes.iter().map(|o| o.distributed).sum();

        assert_eq!(distributed, 100);
        assert_eq!(h.income("s1").await.value_received, 100);
        assert_eq!(h.bus.names(), vec!["confirmed"]);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_ledger_untouched_and_silent() {
        let store = Arc::new(FaultyStore::default());
        let bus = Arc::new(RecordingBus::default());
        let lifecycle = IncomeLifecycle::new(store.clone(), 3);
        let reconciler = IncomeReconciler::new(store.clone(), bus.clone(), 3);
        for (subtask, value) in [("s1", 30), ("s2", 70)] {
            lifecycle.expect("node-1", subtask, "0xA", value).await.unwrap();
            lifecycle.update_awaiting("node-1", subtask, 900).await.unwrap();
        }
        let before = store.list_all().await.unwrap();

        // first record is written, the second write fails
        store.fail_save(2);
        let result = reconciler
            .process_batch_transfer("0xT1", "0xA", 100, 1000)
            .await;

        assert!(result.is_err());
        assert_eq!(store.list_all().await.unwrap(), before);
        assert!(bus.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_publishes_nothing() {
        let store = Arc::new(FaultyStore::default());
        let bus = Arc::new(RecordingBus::default());
        let lifecycle = IncomeLifecycle::new(store.clone(), 3);
        let reconciler = IncomeReconciler::new(store.clone(), bus.clone(), 3);
        lifecycle.expect("node-1", "s1", "0xA", 100).await.unwrap();
        lifecycle.update_awaiting("node-1", "s1", 900).await.unwrap();
        let before = store.list_all().await.unwrap();

        store.fail_commits();
        let result = reconciler
            .process_batch_transfer("0xT1", "0xA", 100, 1000)
            .await;

        assert!(result.is_err());
        assert_eq!(store.list_all().await.unwrap(), before);
        assert!(bus.events().is_empty());
    }
}
