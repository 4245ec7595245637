//! Schema-drift detection
//!
//! On a primary, compares the live column definitions against the
//! `_vt.schemacopy` shadow table. Changed tables are resynced into the
//! shadow copy in one transaction and announced once through the health
//! stream.

use tracing::{debug, info};

use crate::metrics::metrics;
use crate::pool::{ConnectionError, DbConn, QueryResult, Transaction};

use super::error::ReloadError;
use super::sql;
use super::streamer::{HealthStreamer, StreamerState};
use super::subscribers::BroadcastReason;

/// Rows per batch when streaming the drift query
const DETECT_BATCH_SIZE: usize = 1000;

enum ReloadOutcome {
    NotPrimary,
    Unchanged,
    Changed(usize),
}

impl HealthStreamer {
    /// Detect schema changes and broadcast the changed tables.
    ///
    /// Does nothing unless the tablet is a primary. Runs on the reload
    /// timer and whenever a new stream starts; may also be called directly.
    pub async fn reload(&self) -> Result<(), ReloadError> {
        let result = self.reload_inner().await;
        let m = metrics();
        match &result {
            Ok(ReloadOutcome::NotPrimary) => m.record_schema_reload("skipped"),
            Ok(ReloadOutcome::Unchanged) => m.record_schema_reload("unchanged"),
            Ok(ReloadOutcome::Changed(n)) => {
                m.record_schema_reload("changed");
                m.record_tables_changed(*n);
            }
            Err(_) => m.record_schema_reload("error"),
        }
        result.map(|_| ())
    }

    async fn reload_inner(&self) -> Result<ReloadOutcome, ReloadError> {
        let mut guard = self.lock_state().await;
        let state = &mut *guard;

        if !state.snapshot.target.tablet_type.is_primary() {
            return Ok(ReloadOutcome::NotPrimary);
        }

        let conns = self.conns.as_ref().ok_or(ReloadError::NotConfigured)?;
        let shutdown = state.shutdown.clone().ok_or(ReloadError::Closed)?;
        let mut conn = conns.get(&shutdown).await?;

        if !state.init_success {
            init_schema_copy(&mut conn).await?;
            state.init_success = true;
        }

        let tables = detect_changed_tables(&mut conn).await?;
        if tables.is_empty() {
            debug!("No schema changes detected");
            return Ok(ReloadOutcome::Unchanged);
        }

        resync_schema_copy(&mut conn, &tables).await?;
        info!(tables = ?tables, "Schema change detected, broadcasting changed tables");

        let changed = tables.len();
        announce_changed_tables(state, tables);
        Ok(ReloadOutcome::Changed(changed))
    }
}

async fn init_schema_copy(conn: &mut dyn DbConn) -> Result<(), ReloadError> {
    for stmt in sql::SCHEMA_COPY_INIT {
        conn.exec(stmt).await?;
    }
    debug!("Schema copy initialized");
    Ok(())
}

async fn detect_changed_tables(conn: &mut dyn DbConn) -> Result<Vec<String>, ReloadError> {
    let mut tables = Vec::new();
    let mut collect = |batch: QueryResult| -> Result<(), ConnectionError> {
        tables.extend(batch.rows.into_iter().filter_map(|row| row.into_iter().next().flatten()));
        Ok(())
    };
    conn.stream_rows(sql::DETECT_SCHEMA_CHANGE, DETECT_BATCH_SIZE, &mut collect)
        .await?;
    Ok(tables)
}

/// `table_name IN ('t1', 't2')`, each name quoted as a MySQL string literal
pub(crate) fn table_name_predicate(tables: &[String]) -> String {
    let quoted: Vec<String> = tables.iter().map(|t| quote_literal(t)).collect();
    format!("table_name IN ({})", quoted.join(", "))
}

/// Single-quote `value` with backslash escapes, valid unless the server runs
/// with NO_BACKSLASH_ESCAPES
fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            '\\' | '\'' | '"' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

async fn resync_schema_copy(conn: &mut dyn DbConn, tables: &[String]) -> Result<(), ReloadError> {
    let predicate = table_name_predicate(tables);
    let delete = format!("{} AND {}", sql::CLEAR_SCHEMA_COPY, predicate);
    let insert = format!("{} AND {}", sql::INSERT_INTO_SCHEMA_COPY, predicate);

    let mut tx = Transaction::begin(conn).await?;
    for stmt in [&delete, &insert] {
        if let Err(e) = tx.exec(stmt).await {
            tx.rollback().await;
            return Err(e.into());
        }
    }
    tx.commit().await?;
    Ok(())
}

/// Broadcast the changed tables once, then clear them so later snapshots
/// don't repeat the announcement
fn announce_changed_tables(state: &mut StreamerState, tables: Vec<String>) {
    state.snapshot.realtime_stats.table_schema_changed = tables;
    state.broadcast(BroadcastReason::SchemaChange);
    state.snapshot.realtime_stats.table_schema_changed.clear();
}
