// Income settlement: transfer reconciliation, expectation lifecycle and
// overdue detection
pub mod lifecycle;
pub mod overdue;
pub mod reconciler;
pub mod retry;

pub use lifecycle::{AwaitingUpdate, IncomeLifecycle};
pub use overdue::{OverdueMonitor, OverdueScheduleConfig};
pub use reconciler::{BatchOutcome, IncomeReconciler};
