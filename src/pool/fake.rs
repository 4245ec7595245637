//! In-memory backend used by unit tests
//!
//! Records every statement and answers from canned results. The schema
//! drift query returns whatever tables were set as changed; a successful
//! commit clears them, mimicking the shadow copy catching up.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::health::sql::DETECT_SCHEMA_CHANGE;

use super::backend::{BatchCallback, Connector, DbConn, QueryResult};
use super::connection::ConnectionError;

#[derive(Default)]
struct FakeState {
    connects: usize,
    fail_connect: bool,
    statements: Vec<String>,
    changed_tables: Vec<String>,
    fail_on: Vec<String>,
    results: HashMap<String, QueryResult>,
}

#[derive(Default, Clone)]
pub(crate) struct FakeConnector {
    shared: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn connect_count(&self) -> usize {
        self.shared.lock().connects
    }

    /// Every statement sent through any connection, in order
    pub fn statements(&self) -> Vec<String> {
        self.shared.lock().statements.clone()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.shared.lock().fail_connect = fail;
    }

    pub fn set_changed_tables(&self, tables: &[&str]) {
        self.shared.lock().changed_tables = tables.iter().map(|t| t.to_string()).collect();
    }

    /// Fail any statement containing `needle`
    pub fn fail_on(&self, needle: &str) {
        self.shared.lock().fail_on.push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.shared.lock().fail_on.clear();
    }

    pub fn set_result(&self, sql: &str, result: QueryResult) {
        self.shared.lock().results.insert(sql.to_string(), result);
    }

    pub fn conn(&self) -> FakeConn {
        FakeConn {
            shared: self.shared.clone(),
            closed: false,
        }
    }
}

impl Connector for FakeConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn DbConn>, ConnectionError>> {
        Box::pin(async move {
            let mut state = self.shared.lock();
            if state.fail_connect {
                return Err(ConnectionError::Connect("connection refused".into()));
            }
            state.connects += 1;
            drop(state);
            Ok(Box::new(self.conn()) as Box<dyn DbConn>)
        })
    }
}

pub(crate) struct FakeConn {
    shared: Arc<Mutex<FakeState>>,
    closed: bool,
}

impl FakeConn {
    fn record(&self, sql: &str) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Disconnected);
        }
        let mut state = self.shared.lock();
        state.statements.push(sql.to_string());
        if state.fail_on.iter().any(|needle| sql.contains(needle.as_str())) {
            return Err(ConnectionError::Query {
                code: 1105,
                state: "HY000".to_string(),
                message: format!("injected failure: {}", sql),
            });
        }
        Ok(())
    }
}

impl DbConn for FakeConn {
    fn exec<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<QueryResult, ConnectionError>> {
        Box::pin(async move {
            self.record(sql)?;
            let mut state = self.shared.lock();
            if sql == "commit" {
                state.changed_tables.clear();
            }
            Ok(state.results.get(sql).cloned().unwrap_or_default())
        })
    }

    fn stream_rows<'a>(
        &'a mut self,
        sql: &'a str,
        batch_size: usize,
        on_batch: &'a mut BatchCallback<'_>,
    ) -> BoxFuture<'a, Result<(), ConnectionError>> {
        Box::pin(async move {
            self.record(sql)?;
            let result = {
                let state = self.shared.lock();
                if sql == DETECT_SCHEMA_CHANGE {
                    QueryResult {
                        fields: vec!["table_name".to_string()],
                        rows: state
                            .changed_tables
                            .iter()
                            .map(|t| vec![Some(t.clone())])
                            .collect(),
                        rows_affected: 0,
                    }
                } else {
                    state.results.get(sql).cloned().unwrap_or_default()
                }
            };

            let batch_size = batch_size.max(1);
            if result.rows.is_empty() {
                return on_batch(result);
            }
            for chunk in result.rows.chunks(batch_size) {
                on_batch(QueryResult {
                    fields: result.fields.clone(),
                    rows: chunk.to_vec(),
                    rows_affected: 0,
                })?;
            }
            Ok(())
        })
    }

    fn is_usable(&self) -> bool {
        !self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
