//! Tablet health agent
//!
//! Maintains a tablet's health snapshot, streams it to subscribers and
//! signals schema changes detected on the primary.

pub mod config;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod pool;
pub mod protocol;
