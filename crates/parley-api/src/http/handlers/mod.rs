//! HTTP request handlers for the REST API.

pub mod failure;
pub mod message;
pub mod settings;
pub mod stats;
pub mod task;
