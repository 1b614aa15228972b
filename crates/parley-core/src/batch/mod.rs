//! Batch aggregation and execution.

pub mod aggregator;
pub mod content;
pub mod membership;
pub mod recovery;
pub mod sweeper;
pub mod worker;

pub use aggregator::{Aggregator, AggregatorConfig, AggregatorState, OpenBatch};
pub use content::{OrdinalLabel, aggregate_content};
pub use recovery::{RecoveryReport, recover_in_flight};
pub use sweeper::StaleBatchSweeper;
pub use worker::{BatchOutcome, BatchWorker, FailureCause};
