//! Retry of failed messages: claiming (coordinator) and running (executor).

pub mod coordinator;
pub mod executor;

pub use coordinator::{
    RetryAttempt, RetryCoordinator, RetryManyReport, RetryReceipt, TaskRetryReport,
};
pub use executor::RetryExecutor;
