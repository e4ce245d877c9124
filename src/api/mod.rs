pub mod handler;
pub mod models;
pub mod streaming;

pub use handler::AppState;
