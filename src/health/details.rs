//! Rows of the tablet status page

use std::fmt;
use std::time::Duration;

/// Severity of a status row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailClass {
    Healthy,
    Unhappy,
    Unhealthy,
}

impl DetailClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailClass::Healthy => "healthy",
            DetailClass::Unhappy => "unhappy",
            DetailClass::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for DetailClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One key/value row with a severity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kv {
    pub key: String,
    pub class: DetailClass,
    pub value: String,
}

impl Kv {
    pub fn new(key: impl Into<String>, class: DetailClass, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            class,
            value: value.into(),
        }
    }
}

/// Classify replication lag. Both comparisons are strict.
pub fn classify_lag(lag: Duration, degraded: Duration, unhealthy: Duration) -> DetailClass {
    if lag > unhealthy {
        DetailClass::Unhealthy
    } else if lag > degraded {
        DetailClass::Unhappy
    } else {
        DetailClass::Healthy
    }
}
