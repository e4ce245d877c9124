// Income domain events
//
// Published only after the ledger transaction that caused them has committed.
// Delivery is at-least-once from the consumer's point of view; subscribers
// must tolerate duplicates.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ledger::models::Income;

/// Broadcast channel capacity
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IncomeEvent {
    /// Outstanding balance of a record reached zero
    Confirmed { subtask_id: String },
    /// One record newly marked overdue
    OverdueSingle { subtask_id: String },
    /// Every record marked overdue by one sweep
    Overdue { incomes: Vec<Income> },
}

impl IncomeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            IncomeEvent::Confirmed { .. } => "confirmed",
            IncomeEvent::OverdueSingle { .. } => "overdue_single",
            IncomeEvent::Overdue { .. } => "overdue",
        }
    }
}

/// Publish-only capability handed to the components that emit events
pub trait EventBus: Send + Sync {
    fn publish(&self, event: IncomeEvent);
}

/// Fans income events out to every subscriber (UI streams, task manager, logger)
pub struct IncomeEventBroadcaster {
    tx: broadcast::Sender<IncomeEvent>,
}

impl IncomeEventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IncomeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Log every event that goes through the bus
    pub fn spawn_logger(&self) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Income event logger lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for IncomeEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for IncomeEventBroadcaster {
    fn publish(&self, event: IncomeEvent) {
        debug!("📡 Publishing income event: {}", event.name());
        // no subscribers is not an error
        let _ = self.tx.send(event);
    }
}

fn log_event(event: &IncomeEvent) {
    match event {
        IncomeEvent::Confirmed { subtask_id } => {
            info!("✅ Income confirmed for subtask {}", subtask_id);
        }
        IncomeEvent::OverdueSingle { subtask_id } => {
            warn!("⏰ Income overdue for subtask {}", subtask_id);
        }
        IncomeEvent::Overdue { incomes } => {
            warn!("⏰ {} incomes became overdue", incomes.len());
        }
    }
}
