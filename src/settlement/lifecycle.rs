use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use super::retry::with_retry;
use crate::error::AppResult;
use crate::ledger::{Income, IncomeStore, NewIncome};

/// Result of recording an acceptance timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingUpdate {
    /// `accepted_ts` was unset and is now recorded
    Accepted,
    /// Same timestamp delivered again
    Unchanged,
    /// A different timestamp is already recorded; left untouched
    Conflict,
    NotFound,
}

/// Creates, withdraws and annotates income expectations on behalf of the
/// task-acceptance workflow
pub struct IncomeLifecycle {
    store: Arc<dyn IncomeStore>,
    retry_attempts: u32,
}

impl IncomeLifecycle {
    pub fn new(store: Arc<dyn IncomeStore>, retry_attempts: u32) -> Self {
        Self {
            store,
            retry_attempts,
        }
    }

    pub async fn expect(
        &self,
        sender_node: &str,
        subtask_id: &str,
        payer_address: &str,
        value: u128,
    ) -> AppResult<Income> {
        info!(
            "Expected income - sender_node: {}, subtask: {}, payer: {}, value: {}",
            sender_node, subtask_id, payer_address, value
        );

        with_retry("expect income", self.retry_attempts, move || {
            self.insert_income(NewIncome {
                sender_node: sender_node.to_string(),
                subtask_id: subtask_id.to_string(),
                payer_address: payer_address.to_string(),
                value_expected: value,
            })
        })
        .await
    }

    /// Withdraw an expectation that was never accepted and is not overdue.
    ///
    /// Returns `false` (and leaves the ledger alone) for anything else.
    pub async fn reject(&self, sender_node: &str, subtask_id: &str) -> AppResult<bool> {
        with_retry("reject income", self.retry_attempts, move || {
            self.delete_pending(sender_node, subtask_id)
        })
        .await
    }

    /// Record settlement finality reported by an external confirmation
    pub async fn settle(
        &self,
        sender_node: &str,
        subtask_id: &str,
        settled_ts: i64,
    ) -> AppResult<bool> {
        with_retry("settle income", self.retry_attempts, move || {
            self.mark_settled(sender_node, subtask_id, settled_ts)
        })
        .await
    }

    /// Record when the payer accepted the work. The first timestamp wins;
    /// replays with the same value are harmless.
    pub async fn update_awaiting(
        &self,
        sender_node: &str,
        subtask_id: &str,
        accepted_ts: i64,
    ) -> AppResult<AwaitingUpdate> {
        with_retry("update awaiting income", self.retry_attempts, move || {
            self.mark_accepted(sender_node, subtask_id, accepted_ts)
        })
        .await
    }

    /// Every income record, newest first
    pub async fn list_all_incomes(&self) -> AppResult<Vec<Income>> {
        self.store.list_all().await
    }

    async fn insert_income(&self, income: NewIncome) -> AppResult<Income> {
        let mut tx = self.store.begin().await?;
        let income = tx.insert(income).await?;
        tx.commit().await?;
        Ok(income)
    }

    async fn delete_pending(&self, sender_node: &str, subtask_id: &str) -> AppResult<bool> {
        let mut tx = self.store.begin().await?;

        match tx.pending_by_sender_and_subtask(sender_node, subtask_id).await? {
            Some(income) => {
                tx.delete(income.id).await?;
                tx.commit().await?;
                info!("Rejected income for subtask {:?}", subtask_id);
                Ok(true)
            }
            None => {
                error!(
                    "No pending income to reject, subtask_id: {:?}, sender_node: {:?}",
                    subtask_id, sender_node
                );
                Ok(false)
            }
        }
    }

    async fn mark_settled(
        &self,
        sender_node: &str,
        subtask_id: &str,
        settled_ts: i64,
    ) -> AppResult<bool> {
        let mut tx = self.store.begin().await?;

        let Some(mut income) = tx.by_sender_and_subtask(sender_node, subtask_id).await? else {
            error!("Income does not exist, subtask_id: {:?}", subtask_id);
            return Ok(false);
        };

        income.settled_ts = Some(settled_ts);
        tx.save(&income).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn mark_accepted(
        &self,
        sender_node: &str,
        subtask_id: &str,
        accepted_ts: i64,
    ) -> AppResult<AwaitingUpdate> {
        let mut tx = self.store.begin().await?;

        let Some(mut income) = tx.by_sender_and_subtask(sender_node, subtask_id).await? else {
            error!("Income does not exist, subtask_id: {:?}", subtask_id);
            return Ok(AwaitingUpdate::NotFound);
        };

        match income.accepted_ts {
            Some(existing) if existing == accepted_ts => Ok(AwaitingUpdate::Unchanged),
            Some(existing) => {
                error!(
                    "Duplicated accepted_ts {} for {} (already {})",
                    accepted_ts, income, existing
                );
                Ok(AwaitingUpdate::Conflict)
            }
            None => {
                income.accepted_ts = Some(accepted_ts);
                tx.save(&income).await?;
                tx.commit().await?;
                Ok(AwaitingUpdate::Accepted)
            }
        }
    }
}
