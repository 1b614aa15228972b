//! Batch outcome notifications.

pub mod bus;

pub use bus::EventBus;
