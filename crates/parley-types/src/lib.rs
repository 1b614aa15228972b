//! Shared domain types for Parley.
//!
//! This crate contains the domain types used across the Parley pipeline:
//! conversations, messages, batch tasks, failure records, remote service
//! settings, dispatch work items, notifications, and their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror
//! and secrecy for the service API key.

pub mod config;
pub mod conversation;
pub mod error;
pub mod event;
pub mod failure;
pub mod message;
pub mod remote;
pub mod settings;
pub mod task;
pub mod work;

/// Free-form JSON metadata attached to messages and tasks.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
