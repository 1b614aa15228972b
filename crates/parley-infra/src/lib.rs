//! Infrastructure layer for Parley.
//!
//! Implements the ports defined in `parley-core`: SQLite stores, the HTTP
//! chat backend (blocking and streaming), plus the config loader and data
//! directory resolution used by the binary.

pub mod config;
pub mod filesystem;
pub mod remote;
pub mod sqlite;
