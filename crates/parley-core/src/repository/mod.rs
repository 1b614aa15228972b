//! Store traits implemented by the infrastructure layer.
//!
//! Uses native async fn in traits (RPITIT, Rust 2024 edition). Implementations
//! live in parley-infra (e.g., `SqliteBatchRepository`).

pub mod batch;
pub mod failure;
pub mod settings;

pub use batch::{BatchFailure, BatchStore, BatchSuccess};
pub use failure::{FailureFilter, FailureStore};
pub use settings::SettingsRepository;
