// Overdue monitor - flags incomes whose payment never arrived
//
// Deadline is counted from acceptance, or from creation when the work was
// never accepted. A flagged income stays flagged.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use super::retry::with_retry;
use crate::error::AppResult;
use crate::events::{EventBus, IncomeEvent};
use crate::ledger::{Income, IncomeStore};

/// Overdue sweep schedule
#[derive(Debug, Clone, Copy)]
pub struct OverdueScheduleConfig {
    /// How long a payment may stay outstanding
    pub payment_deadline: Duration,
    /// How often the background sweep runs
    pub sweep_interval: Duration,
}

#[derive(Clone)]
pub struct OverdueMonitor {
    store: Arc<dyn IncomeStore>,
    bus: Arc<dyn EventBus>,
    config: OverdueScheduleConfig,
    retry_attempts: u32,
}

impl OverdueMonitor {
    pub fn new(
        store: Arc<dyn IncomeStore>,
        bus: Arc<dyn EventBus>,
        config: OverdueScheduleConfig,
        retry_attempts: u32,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            retry_attempts,
        }
    }

    /// Mark every unpaid income past `deadline` as overdue and announce them.
    ///
    /// Publishes one `overdue_single` per income, then one `overdue` with the
    /// whole batch. An empty sweep writes and publishes nothing.
    pub async fn sweep_overdue(
        &self,
        now: DateTime<Utc>,
        deadline: Duration,
    ) -> AppResult<Vec<Income>> {
        let incomes = with_retry("overdue sweep", self.retry_attempts, move || {
            self.mark_overdue(now, deadline)
        })
        .await?;

        if incomes.is_empty() {
            return Ok(incomes);
        }

        for income in &incomes {
            self.bus.publish(IncomeEvent::OverdueSingle {
                subtask_id: income.subtask_id.clone(),
            });
        }
        self.bus.publish(IncomeEvent::Overdue {
            incomes: incomes.clone(),
        });

        Ok(incomes)
    }

    /// Start the periodic sweep (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let monitor = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(monitor.config.sweep_interval);
            info!(
                "⏰ Overdue monitor running every {:?} (deadline {:?})",
                monitor.config.sweep_interval, monitor.config.payment_deadline
            );

            loop {
                ticker.tick().await;

                match monitor
                    .sweep_overdue(Utc::now(), monitor.config.payment_deadline)
                    .await
                {
                    Ok(incomes) if !incomes.is_empty() => {
                        info!("⏰ Marked {} incomes as overdue", incomes.len());
                    }
                    Ok(_) => debug!("Overdue sweep found nothing"),
                    Err(e) => error!("❌ Overdue sweep failed: {:?}", e),
                }
            }
        })
    }

    async fn mark_overdue(&self, now: DateTime<Utc>, deadline: Duration) -> AppResult<Vec<Income>> {
        let mut tx = self.store.begin().await?;
        let candidates = tx.pending_overdue_candidates(now, deadline).await?;

        if candidates.is_empty() {
            return Ok(candidates);
        }

        let mut marked = Vec::with_capacity(candidates.len());
        for mut income in candidates {
            income.overdue = true;
            tx.save(&income).await?;
            marked.push(income);
        }

        tx.commit().await?;
        Ok(marked)
    }
}
