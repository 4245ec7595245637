//! Local mysqld state probing
//!
//! The tablet is primary only when `@@read_only` is 0 and `SHOW SLAVE
//! STATUS` returns no rows. Either a read-only server or a configured
//! replication source makes it a replica.
//!
//! Replicas additionally report replication lag and thread health.

use std::time::Duration;

use tracing::debug;

use crate::health::TabletType;
use crate::pool::{ConnectionError, DbConn, QueryResult};

pub const READ_ONLY_QUERY: &str = "SELECT @@read_only";
pub const SLAVE_STATUS_QUERY: &str = "SHOW SLAVE STATUS";
pub const QUESTIONS_QUERY: &str = "SHOW GLOBAL STATUS LIKE 'Questions'";

/// Error during a state probe
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe query failed: {0}")]
    Query(#[from] ConnectionError),
    #[error("unexpected probe result: {0}")]
    Parse(String),
    #[error("probe timed out")]
    Timeout,
}

/// What one probe observed
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub tablet_type: TabletType,
    /// Zero on a primary, or when the replica cannot tell
    pub lag: Duration,
    /// Set when a replication thread is stopped or reports an error
    pub replication_error: Option<String>,
    /// Value of the `Questions` status counter
    pub questions: Option<u64>,
}

/// Replication health of a replica
#[derive(Debug, Clone, PartialEq)]
struct ReplicaStatus {
    lag: Duration,
    error: Option<String>,
}

/// Probe the connection's server
pub async fn probe(conn: &mut dyn DbConn) -> Result<ProbeResult, ProbeError> {
    let read_only = query_read_only(conn).await?;
    let replica = query_slave_status(conn).await?;

    let (tablet_type, lag, replication_error) = match replica {
        Some(status) => (TabletType::Replica, status.lag, status.error),
        None if read_only => {
            debug!("Instance is read_only=1 without slave status, detected as replica");
            (TabletType::Replica, Duration::ZERO, None)
        }
        None => (TabletType::Primary, Duration::ZERO, None),
    };

    let questions = query_questions(conn).await?;
    Ok(ProbeResult {
        tablet_type,
        lag,
        replication_error,
        questions,
    })
}

/// Returns true if read_only=1
async fn query_read_only(conn: &mut dyn DbConn) -> Result<bool, ProbeError> {
    let result = conn.exec(READ_ONLY_QUERY).await?;
    let value = first_value(&result)
        .ok_or_else(|| ProbeError::Parse("empty @@read_only result".to_string()))?;
    match value {
        "0" | "OFF" => Ok(false),
        "1" | "ON" => Ok(true),
        other => {
            debug!(value = %other, "Unexpected read_only value, assuming replica");
            Ok(true)
        }
    }
}

/// `None` when the server is not replicating
async fn query_slave_status(conn: &mut dyn DbConn) -> Result<Option<ReplicaStatus>, ProbeError> {
    let result = match conn.exec(SLAVE_STATUS_QUERY).await {
        Ok(result) => result,
        // Servers that reject the statement are not replicas
        Err(ConnectionError::Query { code, message, .. }) => {
            debug!(code, message = %message, "SHOW SLAVE STATUS rejected, assuming no replication");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if result.rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(parse_replica_status(&result)))
}

fn parse_replica_status(result: &QueryResult) -> ReplicaStatus {
    let io_running = result.value(0, "Slave_IO_Running").unwrap_or("No");
    let sql_running = result.value(0, "Slave_SQL_Running").unwrap_or("No");
    let lag = result
        .value(0, "Seconds_Behind_Master")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_default();

    let last_error = ["Last_Error", "Last_IO_Error", "Last_SQL_Error"]
        .iter()
        .filter_map(|col| result.value(0, col))
        .find(|v| !v.is_empty());

    let error = if io_running != "Yes" || sql_running != "Yes" {
        let mut msg = format!(
            "replication is not running: io thread {}, sql thread {}",
            io_running, sql_running
        );
        if let Some(last) = last_error {
            msg.push_str(&format!(": {}", last));
        }
        Some(msg)
    } else {
        last_error.map(str::to_string)
    };

    ReplicaStatus { lag, error }
}

async fn query_questions(conn: &mut dyn DbConn) -> Result<Option<u64>, ProbeError> {
    let result = conn.exec(QUESTIONS_QUERY).await?;
    Ok(result.value(0, "Value").and_then(|v| v.parse().ok()))
}

fn first_value(result: &QueryResult) -> Option<&str> {
    result.rows.first()?.first()?.as_deref()
}
