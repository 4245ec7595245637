//! Sources of the statistics folded into every state change

use std::sync::atomic::{AtomicU64, Ordering};

/// Filtered replication status of the tablet
pub trait ReplicationStatus: Send + Sync {
    /// Returns (filtered replication lag in seconds, binlog player count)
    fn status(&self) -> (u32, i32);
}

/// For tablets that run no filtered replication streams
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFilteredReplication;

impl ReplicationStatus for NoFilteredReplication {
    fn status(&self) -> (u32, i32) {
        (0, 0)
    }
}

/// Current queries-per-second of the tablet
pub trait QpsProvider: Send + Sync {
    fn total_rate(&self) -> f64;
}

/// A rate published by whoever measures it
#[derive(Debug, Default)]
pub struct QpsRates {
    bits: AtomicU64,
}

impl QpsRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, qps: f64) {
        self.bits.store(qps.to_bits(), Ordering::Relaxed);
    }
}

impl QpsProvider for QpsRates {
    fn total_rate(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}
