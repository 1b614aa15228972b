//! HTTP adapter for the remote chat service.

pub mod client;
pub mod streaming;

pub use client::HttpChatBackend;
pub use streaming::{StreamItem, StreamLine, parse_stream_line};
