pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use memory::MemoryIncomeStore;
pub use models::{Income, NewIncome};
pub use repository::LedgerRepository;
pub use store::{IncomeStore, IncomeTransaction};
