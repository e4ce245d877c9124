use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::models::{Income, NewIncome};
use crate::error::AppResult;

/// Ledger store - THE source of truth for income records
///
/// Every mutating operation runs inside one [`IncomeTransaction`]: reads lock
/// what they return, writes stay invisible until `commit`, and dropping the
/// transaction without committing discards them.
#[async_trait]
pub trait IncomeStore: Send + Sync {
    async fn begin(&self) -> AppResult<Box<dyn IncomeTransaction>>;

    /// All records, newest first
    async fn list_all(&self) -> AppResult<Vec<Income>>;

    /// Reachability check for `/health`
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait IncomeTransaction: Send {
    async fn insert(&mut self, income: NewIncome) -> AppResult<Income>;

    /// Accepted no later than `closure_time`, no transaction, not settled.
    /// Ordered by creation time, then id.
    async fn by_payer_and_window(
        &mut self,
        payer_address: &str,
        closure_time: i64,
    ) -> AppResult<Vec<Income>>;

    async fn by_payer_and_subtask(
        &mut self,
        payer_address: &str,
        subtask_id: &str,
    ) -> AppResult<Option<Income>>;

    async fn by_sender_and_subtask(
        &mut self,
        sender_node: &str,
        subtask_id: &str,
    ) -> AppResult<Option<Income>>;

    /// Never accepted and not overdue; the only records `reject` may delete
    async fn pending_by_sender_and_subtask(
        &mut self,
        sender_node: &str,
        subtask_id: &str,
    ) -> AppResult<Option<Income>>;

    /// Not overdue, no transaction, and waiting longer than `deadline`
    async fn pending_overdue_candidates(
        &mut self,
        now: DateTime<Utc>,
        deadline: Duration,
    ) -> AppResult<Vec<Income>>;

    async fn save(&mut self, income: &Income) -> AppResult<()>;

    async fn delete(&mut self, id: i64) -> AppResult<()>;

    async fn commit(&mut self) -> AppResult<()>;
}

pub(crate) fn deadline_secs(deadline: Duration) -> i64 {
    i64::try_from(deadline.as_secs()).unwrap_or(i64::MAX)
}
