use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::backend::{BatchCallback, Connector, DbConn, QueryResult};
use super::connection::ConnectionError;

/// Configuration for a dedicated connection pool
#[derive(Debug, Clone)]
pub struct ConnPoolConfig {
    /// Maximum number of connections handed out at once
    pub capacity: usize,
    /// Idle connections older than this are discarded instead of reused
    pub idle_timeout: Duration,
    /// Upper bound for a single statement on a pooled connection
    pub query_timeout: Duration,
}

impl Default for ConnPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            idle_timeout: Duration::from_secs(1800), // 30 minutes
            query_timeout: Duration::from_secs(30),
        }
    }
}

struct IdleConn {
    conn: Box<dyn DbConn>,
    idle_since: Instant,
}

struct PoolState {
    open: bool,
    connector: Option<Arc<dyn Connector>>,
    idle: VecDeque<IdleConn>,
}

/// A small fixed-capacity pool owned by a single component
///
/// Connections are opened lazily on first use and recycled when the
/// [`PooledConn`] handle is dropped. Acquisition waits for a free slot and
/// can be cancelled.
pub struct ConnPool {
    name: String,
    config: ConnPoolConfig,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
}

impl ConnPool {
    /// Create a closed pool
    pub fn new(name: impl Into<String>, config: ConnPoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            name: name.into(),
            config,
            state: Mutex::new(PoolState {
                open: false,
                connector: None,
                idle: VecDeque::new(),
            }),
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Open the pool. No connection is made until the first `get`.
    pub fn open(&self, connector: Arc<dyn Connector>) {
        let mut state = self.state.lock();
        state.connector = Some(connector);
        state.open = true;
        info!(pool = %self.name, capacity = self.config.capacity, "Connection pool opened");
    }

    /// Close the pool and drop its idle connections
    ///
    /// Connections currently handed out are discarded when returned.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.connector = None;
        for mut idle in state.idle.drain(..) {
            idle.conn.close();
        }
        info!(pool = %self.name, "Connection pool closed");
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of idle connections ready for reuse
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Get a connection, waiting for a free slot.
    ///
    /// Fails with [`PoolError::Cancelled`] if `cancel` fires first.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<PooledConn<'_>, PoolError> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }

        let connector = {
            let state = self.state.lock();
            if !state.open {
                return Err(PoolError::Closed);
            }
            state.connector.clone().ok_or(PoolError::Closed)?
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| PoolError::Closed)?,
        };

        let reused = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(PoolError::Closed);
            }
            let mut found = None;
            while let Some(mut idle) = state.idle.pop_front() {
                if !idle.conn.is_usable() {
                    debug!(pool = %self.name, "Connection not usable, discarding");
                    continue;
                }
                if idle.idle_since.elapsed() > self.config.idle_timeout {
                    debug!(pool = %self.name, "Connection idle too long, discarding");
                    idle.conn.close();
                    continue;
                }
                found = Some(idle.conn);
                break;
            }
            found
        };

        let conn = match reused {
            Some(conn) => {
                debug!(pool = %self.name, "Reusing idle connection");
                conn
            }
            None => {
                debug!(pool = %self.name, "Opening new connection");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                    result = connector.connect() => result?,
                }
            }
        };

        Ok(PooledConn {
            pool: self,
            conn: Some(conn),
            cancel: cancel.clone(),
            query_timeout: self.config.query_timeout,
            _permit: permit,
        })
    }

    /// Return a connection to the idle list
    fn put(&self, conn: Box<dyn DbConn>) {
        if !conn.is_usable() {
            debug!(pool = %self.name, "Connection not usable, discarding");
            return;
        }

        let mut state = self.state.lock();
        if !state.open {
            debug!(pool = %self.name, "Pool closed, discarding connection");
            return;
        }
        if state.idle.len() >= self.config.capacity {
            debug!(pool = %self.name, "Pool full, discarding connection");
            return;
        }
        state.idle.push_back(IdleConn {
            conn,
            idle_since: Instant::now(),
        });
    }
}

/// A connection borrowed from a [`ConnPool`]
///
/// Every statement observes the acquisition's cancellation token and the
/// pool's query timeout; a statement cut short marks the connection
/// broken. Dropping the handle recycles the connection.
pub struct PooledConn<'a> {
    pool: &'a ConnPool,
    conn: Option<Box<dyn DbConn>>,
    cancel: CancellationToken,
    query_timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn<'_> {
    async fn guarded<T>(
        cancel: &CancellationToken,
        timeout: Duration,
        fut: impl Future<Output = Result<T, ConnectionError>>,
    ) -> Result<T, ConnectionError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            result = tokio::time::timeout(timeout, fut) => {
                result.unwrap_or_else(|_| Err(ConnectionError::Timeout))
            }
        }
    }
}

impl DbConn for PooledConn<'_> {
    fn exec<'b>(&'b mut self, sql: &'b str) -> BoxFuture<'b, Result<QueryResult, ConnectionError>> {
        Box::pin(async move {
            let conn = self.conn.as_mut().ok_or(ConnectionError::Disconnected)?;
            let result = Self::guarded(&self.cancel, self.query_timeout, conn.exec(sql)).await;
            if matches!(result, Err(ConnectionError::Cancelled | ConnectionError::Timeout)) {
                conn.close();
            }
            result
        })
    }

    fn stream_rows<'b>(
        &'b mut self,
        sql: &'b str,
        batch_size: usize,
        on_batch: &'b mut BatchCallback<'_>,
    ) -> BoxFuture<'b, Result<(), ConnectionError>> {
        Box::pin(async move {
            let conn = self.conn.as_mut().ok_or(ConnectionError::Disconnected)?;
            let result = Self::guarded(
                &self.cancel,
                self.query_timeout,
                conn.stream_rows(sql, batch_size, on_batch),
            )
            .await;
            if matches!(result, Err(ConnectionError::Cancelled | ConnectionError::Timeout)) {
                conn.close();
            }
            result
        })
    }

    fn is_usable(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_usable())
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close();
        }
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}

/// Errors acquiring a pooled connection
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,

    #[error("connection acquisition cancelled")]
    Cancelled,

    #[error("failed to open connection: {0}")]
    Connect(#[from] ConnectionError),
}
