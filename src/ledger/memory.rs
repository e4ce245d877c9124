use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::models::{Income, NewIncome};
use super::store::{deadline_secs, IncomeStore, IncomeTransaction};
use crate::error::{AppError, AppResult};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone)]
struct LedgerState {
    incomes: BTreeMap<i64, Income>,
    next_id: i64,
}

/// In-process ledger store.
///
/// Transactions are serialized by one mutex; each works on a snapshot that is
/// swapped in on commit.
pub struct MemoryIncomeStore {
    state: Arc<Mutex<LedgerState>>,
    lock_timeout: Duration,
}

impl MemoryIncomeStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            lock_timeout,
        }
    }

    async fn lock(&self) -> AppResult<OwnedMutexGuard<LedgerState>> {
        tokio::time::timeout(self.lock_timeout, self.state.clone().lock_owned())
            .await
            .map_err(|_| {
                AppError::StoreBusy(format!(
                    "ledger lock not acquired within {:?}",
                    self.lock_timeout
                ))
            })
    }
}

impl Default for MemoryIncomeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IncomeStore for MemoryIncomeStore {
    async fn begin(&self) -> AppResult<Box<dyn IncomeTransaction>> {
        let guard = self.lock().await?;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard: Some(guard),
            staged,
        }))
    }

    async fn list_all(&self) -> AppResult<Vec<Income>> {
        let guard = self.lock().await?;
        let mut incomes: Vec<Income> = guard.incomes.values().cloned().collect();
        incomes.sort_by(|a, b| (b.created_ts, b.id).cmp(&(a.created_ts, a.id)));
        Ok(incomes)
    }
}

struct MemoryTransaction {
    guard: Option<OwnedMutexGuard<LedgerState>>,
    staged: LedgerState,
}

impl MemoryTransaction {
    fn state(&mut self) -> AppResult<&mut LedgerState> {
        if self.guard.is_none() {
            return Err(AppError::Internal(
                "transaction used after commit".to_string(),
            ));
        }
        Ok(&mut self.staged)
    }

    fn find<P>(&mut self, predicate: P) -> AppResult<Option<Income>>
    where
        P: Fn(&Income) -> bool,
    {
        Ok(self.state()?.incomes.values().find(|i| predicate(i)).cloned())
    }
}

#[async_trait]
impl IncomeTransaction for MemoryTransaction {
    async fn insert(&mut self, income: NewIncome) -> AppResult<Income> {
        let state = self.state()?;
        let duplicate = state.incomes.values().any(|i| {
            i.payer_address == income.payer_address && i.subtask_id == income.subtask_id
        });
        if duplicate {
            return Err(AppError::Conflict(format!(
                "income for subtask {} from payer {} already exists",
                income.subtask_id, income.payer_address
            )));
        }

        state.next_id += 1;
        let record = Income {
            id: state.next_id,
            sender_node: income.sender_node,
            subtask_id: income.subtask_id,
            payer_address: income.payer_address,
            value_expected: income.value_expected,
            value_received: 0,
            transaction_ref: None,
            accepted_ts: None,
            settled_ts: None,
            overdue: false,
            created_ts: Utc::now(),
        };
        state.incomes.insert(record.id, record.clone());
        Ok(record)
    }

    async fn by_payer_and_window(
        &mut self,
        payer_address: &str,
        closure_time: i64,
    ) -> AppResult<Vec<Income>> {
        let mut matched: Vec<Income> = self
            .state()?
            .incomes
            .values()
            .filter(|i| i.awaits_batch(payer_address, closure_time))
            .cloned()
            .collect();
        matched.sort_by_key(|i| (i.created_ts, i.id));
        Ok(matched)
    }

    async fn by_payer_and_subtask(
        &mut self,
        payer_address: &str,
        subtask_id: &str,
    ) -> AppResult<Option<Income>> {
        self.find(|i| i.payer_address == payer_address && i.subtask_id == subtask_id)
    }

    async fn by_sender_and_subtask(
        &mut self,
        sender_node: &str,
        subtask_id: &str,
    ) -> AppResult<Option<Income>> {
        self.find(|i| i.sender_node == sender_node && i.subtask_id == subtask_id)
    }

    async fn pending_by_sender_and_subtask(
        &mut self,
        sender_node: &str,
        subtask_id: &str,
    ) -> AppResult<Option<Income>> {
        self.find(|i| {
            i.sender_node == sender_node && i.subtask_id == subtask_id && i.is_pending()
        })
    }

    async fn pending_overdue_candidates(
        &mut self,
        now: DateTime<Utc>,
        deadline: Duration,
    ) -> AppResult<Vec<Income>> {
        let deadline = deadline_secs(deadline);
        let mut matched: Vec<Income> = self
            .state()?
            .incomes
            .values()
            .filter(|i| i.is_overdue_at(now, deadline))
            .cloned()
            .collect();
        matched.sort_by_key(|i| (i.created_ts, i.id));
        Ok(matched)
    }

    async fn save(&mut self, income: &Income) -> AppResult<()> {
        let state = self.state()?;
        match state.incomes.get_mut(&income.id) {
            Some(existing) => {
                *existing = income.clone();
                Ok(())
            }
            None => Err(AppError::Internal(format!(
                "income {} vanished inside its transaction",
                income.id
            ))),
        }
    }

    async fn delete(&mut self, id: i64) -> AppResult<()> {
        self.state()?.incomes.remove(&id);
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| AppError::Internal("transaction already committed".to_string()))?;
        *guard = std::mem::take(&mut self.staged);
        Ok(())
    }
}

/// Store wrapper that fails chosen saves or commits, for rollback tests
#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Faults {
        /// Saves left before the failing one
        save_countdown: Mutex<Option<usize>>,
        fail_commits: AtomicBool,
    }

    impl Faults {
        fn save_fails(&self) -> bool {
            let mut countdown = self.save_countdown.lock();
            match *countdown {
                Some(n) if n <= 1 => {
                    *countdown = None;
                    true
                }
                Some(n) => {
                    *countdown = Some(n - 1);
                    false
                }
                None => false,
            }
        }
    }

    #[derive(Default)]
    pub struct FaultyStore {
        inner: MemoryIncomeStore,
        faults: Arc<Faults>,
    }

    impl FaultyStore {
        /// The `n`th save from now on fails (1-based)
        pub fn fail_save(&self, n: usize) {
            *self.faults.save_countdown.lock() = Some(n);
        }

        pub fn fail_commits(&self) {
            self.faults.fail_commits.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl IncomeStore for FaultyStore {
        async fn begin(&self) -> AppResult<Box<dyn IncomeTransaction>> {
            Ok(Box::new(FaultyTransaction {
                inner: self.inner.begin().await?,
                faults: self.faults.clone(),
            }))
        }

        async fn list_all(&self) -> AppResult<Vec<Income>> {
            self.inner.list_all().await
        }
    }

    struct FaultyTransaction {
        inner: Box<dyn IncomeTransaction>,
        faults: Arc<Faults>,
    }

    #[async_trait]
    impl IncomeTransaction for FaultyTransaction {
        async fn insert(&mut self, income: NewIncome) -> AppResult<Income> {
            self.inner.insert(income).await
        }

        async fn by_payer_and_window(
            &mut self,
            payer_address: &str,
            closure_time: i64,
        ) -> AppResult<Vec<Income>> {
            self.inner.by_payer_and_window(payer_address, closure_time).await
        }

        async fn by_payer_and_subtask(
            &mut self,
            payer_address: &str,
            subtask_id: &str,
        ) -> AppResult<Option<Income>> {
            self.inner.by_payer_and_subtask(payer_address, subtask_id).await
        }

        async fn by_sender_and_subtask(
            &mut self,
            sender_node: &str,
            subtask_id: &str,
        ) -> AppResult<Option<Income>> {
            self.inner.by_sender_and_subtask(sender_node, subtask_id).await
        }

        async fn pending_by_sender_and_subtask(
            &mut self,
            sender_node: &str,
            subtask_id: &str,
        ) -> AppResult<Option<Income>> {
            self.inner
                .pending_by_sender_and_subtask(sender_node, subtask_id)
                .await
        }

        async fn pending_overdue_candidates(
            &mut self,
            now: DateTime<Utc>,
            deadline: Duration,
        ) -> AppResult<Vec<Income>> {
            self.inner.pending_overdue_candidates(now, deadline).await
        }

        async fn save(&mut self, income: &Income) -> AppResult<()> {
            if self.faults.save_fails() {
                return Err(AppError::Internal(format!("save of income {} failed", income.id)));
            }
            self.inner.save(income).await
        }

        async fn delete(&mut self, id: i64) -> AppResult<()> {
            self.inner.delete(id).await
        }

        async fn commit(&mut self) -> AppResult<()> {
            if self.faults.fail_commits.load(Ordering::SeqCst) {
                return Err(AppError::Internal("commit failed".to_string()));
            }
            self.inner.commit().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_income(subtask: &str, payer: &str, value: u128) -> NewIncome {
        NewIncome {
            sender_node: "node-1".to_string(),
            subtask_id: subtask.to_string(),
            payer_address: payer.to_string(),
            value_expected: value,
        }
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = MemoryIncomeStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert(new_income("s1", "0xA", 10)).await.unwrap();
        tx.insert(new_income("s2", "0xA", 20)).await.unwrap();
        tx.commit().await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        // newest first
        assert_eq!(all[0].subtask_id, "s2");
        assert_eq!(all[1].subtask_id, "s1");
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let store = MemoryIncomeStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert(new_income("s1", "0xA", 10)).await.unwrap();
        }
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_payer_subtask_conflicts() {
        let store = MemoryIncomeStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(new_income("s1", "0xA", 10)).await.unwrap();

        let err = tx.insert(new_income("s1", "0xA", 10)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // same subtask from another payer is a different expectation
        tx.insert(new_income("s1", "0xB", 10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_begin_times_out_as_store_busy() {
        let store = MemoryIncomeStore::with_lock_timeout(Duration::from_millis(20));
        let _held = store.begin().await.unwrap();

        match store.begin().await {
            Err(err) => {
                assert!(matches!(err, AppError::StoreBusy(_)));
                assert!(err.is_retryable());
            }
            Ok(_) => panic!("second transaction must not acquire the lock"),
        }
    }

    #[tokio::test]
    async fn test_use_after_commit_fails() {
        let store = MemoryIncomeStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();

        assert!(tx.insert(new_income("s1", "0xA", 10)).await.is_err());
        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_window_selection_is_ordered_and_filtered() {
        let store = MemoryIncomeStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut first = tx.insert(new_income("s1", "0xA", 10)).await.unwrap();
        let mut second = tx.insert(new_income("s2", "0xA", 20)).await.unwrap();
        let mut late = tx.insert(new_income("s3", "0xA", 30)).await.unwrap();
        let mut other = tx.insert(new_income("s4", "0xB", 40)).await.unwrap();

        first.accepted_ts = Some(100);
        second.accepted_ts = Some(90);
        late.accepted_ts = Some(500);
        other.accepted_ts = Some(100);
        for income in [&first, &second, &late, &other] {
            tx.save(income).await.unwrap();
        }

        let matched = tx.by_payer_and_window("0xA", 100).await.unwrap();
        let subtasks: Vec<&str> = matched.iter().map(|i| i.subtask_id.as_str()).collect();
        assert_eq!(subtasks, vec!["s1", "s2"]);
    }
}
