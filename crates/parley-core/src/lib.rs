//! Business logic and repository trait definitions for Parley.
//!
//! This crate defines the "ports" (store, backend and queue traits) that the
//! infrastructure layer implements, and the pipeline built on them: the
//! aggregator, batch worker, retry coordinator, worker pool and recovery.
//! It depends only on `parley-types` -- never on `parley-infra` or any
//! database/IO crate.

pub mod backend;
pub mod batch;
pub mod clock;
pub mod dispatch;
pub mod event;
pub mod pipeline;
pub mod repository;
pub mod retry;

#[cfg(test)]
pub(crate) mod test_support;
