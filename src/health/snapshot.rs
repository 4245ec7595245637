//! The health record broadcast to streaming clients

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Health error reported until the first state change
pub const ERR_UNINITIALIZED: &str = "tabletserver uninitialized";

/// Role of a tablet in the replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabletType {
    #[default]
    Unknown,
    Primary,
    Replica,
    Rdonly,
    Spare,
    Backup,
    Restore,
    Drained,
}

impl TabletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabletType::Unknown => "UNKNOWN",
            TabletType::Primary => "PRIMARY",
            TabletType::Replica => "REPLICA",
            TabletType::Rdonly => "RDONLY",
            TabletType::Spare => "SPARE",
            TabletType::Backup => "BACKUP",
            TabletType::Restore => "RESTORE",
            TabletType::Drained => "DRAINED",
        }
    }

    pub fn is_primary(&self) -> bool {
        *self == TabletType::Primary
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cell-qualified tablet identity, written `cell-uid` (e.g. `zone1-0000000100`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

/// Error parsing a tablet alias
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid tablet alias {0:?}: expected <cell>-<uid>")]
pub struct InvalidAlias(String);

impl FromStr for TabletAlias {
    type Err = InvalidAlias;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cell, uid) = s.rsplit_once('-').ok_or_else(|| InvalidAlias(s.to_string()))?;
        if cell.is_empty() {
            return Err(InvalidAlias(s.to_string()));
        }
        let uid = uid.parse().map_err(|_| InvalidAlias(s.to_string()))?;
        Ok(Self::new(cell, uid))
    }
}

impl TryFrom<String> for TabletAlias {
    type Error = InvalidAlias;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// What this tablet currently serves
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Target {
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
}

impl Target {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, tablet_type: TabletType) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type,
        }
    }
}

/// Health statistics refreshed on every state change
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RealtimeStats {
    /// Empty when healthy
    pub health_error: String,
    pub replication_lag_seconds: u32,
    pub binlog_players_count: i32,
    pub filtered_replication_lag_seconds: u32,
    pub qps: f64,
    /// Tables whose schema changed; only set on the broadcast announcing it
    pub table_schema_changed: Vec<String>,
}

/// One point-in-time health record of a tablet
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub target: Target,
    pub serving: bool,
    /// Unix seconds of the last promotion; zero unless primary
    pub tablet_externally_reparented_timestamp: i64,
    pub realtime_stats: RealtimeStats,
    pub tablet_alias: TabletAlias,
}

impl HealthSnapshot {
    /// The record a tablet starts with, before any state change
    pub fn uninitialized(alias: TabletAlias) -> Self {
        Self {
            target: Target::default(),
            serving: false,
            tablet_externally_reparented_timestamp: 0,
            realtime_stats: RealtimeStats {
                health_error: ERR_UNINITIALIZED.to_string(),
                ..Default::default()
            },
            tablet_alias: alias,
        }
    }
}
