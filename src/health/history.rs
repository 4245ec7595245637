//! Bounded log of recent state transitions, kept for the status page

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use super::details::DetailClass;
use super::snapshot::TabletType;

/// Number of transitions kept
pub const HISTORY_CAPACITY: usize = 5;

/// One applied state change
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub time: SystemTime,
    pub serving: bool,
    pub tablet_type: TabletType,
    pub lag: Duration,
    pub error: Option<String>,
}

impl HistoryRecord {
    /// Same state as `other`, ignoring when it was recorded
    pub fn is_duplicate(&self, other: &HistoryRecord) -> bool {
        self.serving == other.serving
            && self.tablet_type == other.tablet_type
            && self.lag == other.lag
            && self.error == other.error
    }

    pub fn class(&self) -> DetailClass {
        if !self.serving {
            DetailClass::Unhealthy
        } else if self.error.is_some() {
            DetailClass::Unhappy
        } else {
            DetailClass::Healthy
        }
    }

    /// One-line description for the status page
    pub fn status(&self) -> String {
        let mut status = format!(
            "{}: {}",
            self.tablet_type,
            if self.serving { "serving" } else { "not serving" }
        );
        if !self.tablet_type.is_primary() {
            status.push_str(&format!(", replication lag: {}s", self.lag.as_secs()));
        }
        if let Some(ref err) = self.error {
            status.push_str(&format!(", error: {}", err));
        }
        status
    }
}

/// Fixed-capacity FIFO of [`HistoryRecord`]s
///
/// A record equal to the most recent one is not stored again.
#[derive(Debug)]
pub struct History {
    records: VecDeque<HistoryRecord>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record, evicting the oldest when full
    pub fn add(&mut self, record: HistoryRecord) {
        if let Some(latest) = self.records.back() {
            if latest.is_duplicate(&record) {
                return;
            }
        }
        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Records, newest first
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}
