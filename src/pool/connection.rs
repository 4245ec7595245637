use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::config::BackendConfig;
use crate::protocol::resultset::read_lenenc_int;
use crate::protocol::{
    capabilities, parse_column_name, parse_text_row, scramble_password, Command, DecodeError,
    LoginRequest, OkPacket, Packet, PacketCodec, Reply, ServerError, ServerGreeting,
};

use super::backend::{BatchCallback, Connector, DbConn, QueryResult};

/// A client connection to a MySQL backend speaking the text protocol
pub struct MysqlConnection {
    framed: Framed<TcpStream, PacketCodec>,
    /// Set once the connection is known to be broken
    closed: bool,
    /// Negotiated capability flags
    capabilities: u32,
    /// Current database
    database: Option<String>,
}

impl MysqlConnection {
    /// Create a new connection to a backend
    pub async fn connect(
        config: &BackendConfig,
        database: Option<String>,
    ) -> Result<Self, ConnectionError> {
        let addr = config.addr();
        debug!(addr = %addr, "Connecting to backend");

        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "Failed to connect to backend");
            ConnectionError::Connect(e.to_string())
        })?;

        let mut framed = Framed::new(stream, PacketCodec);

        let handshake_packet = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if Reply::of(&handshake_packet.payload, 0) == Reply::Err {
            let err = ServerError::parse_or(
                &handshake_packet.payload,
                0,
                ServerError::new(1040, "08004", "Connection refused"),
            );
            return Err(ConnectionError::Connect(err.message));
        }

        let greeting = ServerGreeting::parse(&handshake_packet.payload)
            .ok_or_else(|| ConnectionError::Protocol("Invalid backend handshake".into()))?;

        debug!(
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            "Received backend handshake"
        );

        let auth_response = scramble_password(&config.password, &greeting.scramble);

        let db = database.or_else(|| config.database.clone());

        let mut caps = capabilities::DEFAULT_CAPABILITIES & greeting.capabilities;
        if db.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        } else {
            caps &= !capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let login = LoginRequest {
            capabilities: caps,
            max_packet_size: 16 * 1024 * 1024,
            collation: 0x21, // utf8_general_ci
            user: config.user.clone(),
            auth_response,
            database: db.clone(),
            auth_plugin: greeting.auth_plugin.clone(),
        };

        framed
            .send(login.to_packet(1))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let reply = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        match Reply::of(&reply.payload, caps) {
            Reply::Ok => {}
            Reply::Err => {
                let err = ServerError::parse_or(
                    &reply.payload,
                    caps,
                    ServerError::new(1045, "28000", "Access denied"),
                );
                error!(
                    error_code = err.code,
                    error_message = %err.message,
                    "Backend authentication failed"
                );
                return Err(ConnectionError::Auth(err.message));
            }
            _ => {
                return Err(ConnectionError::Protocol(
                    "Expected OK packet from backend (auth switch is not supported)".into(),
                ));
            }
        }

        debug!("Backend authentication successful");

        Ok(Self {
            framed,
            closed: false,
            capabilities: caps,
            database: db,
        })
    }

    /// Current default database of the session
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        match self.framed.send(packet).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.closed = true;
                Err(ConnectionError::Io(e.to_string()))
            }
        }
    }

    async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => {
                self.closed = true;
                Err(ConnectionError::Io(e.to_string()))
            }
            None => {
                self.closed = true;
                Err(ConnectionError::Disconnected)
            }
        }
    }

    fn query_error(&self, payload: &[u8]) -> ConnectionError {
        let err = ServerError::parse_or(
            payload,
            self.capabilities,
            ServerError::new(1105, "HY000", "Unknown error"),
        );
        ConnectionError::Query {
            code: err.code,
            state: err.state,
            message: err.message,
        }
    }

    /// Run a COM_QUERY, delivering result rows in batches.
    ///
    /// Returns the affected row count for statements without a result set.
    async fn run_query(
        &mut self,
        sql: &str,
        batch_size: usize,
        on_batch: &mut BatchCallback<'_>,
    ) -> Result<u64, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Disconnected);
        }
        let batch_size = batch_size.max(1);

        self.send(Packet::command(Command::Query, sql.as_bytes()))
            .await?;

        let first = self.recv().await?;
        match Reply::of(&first.payload, self.capabilities) {
            Reply::Err => return Err(self.query_error(&first.payload)),
            Reply::Ok => {
                let ok = OkPacket::parse(&first.payload, self.capabilities).unwrap_or_default();
                return Ok(ok.affected_rows);
            }
            _ => {}
        }

        let (column_count, _) = read_lenenc_int(&first.payload)
            .ok_or(ConnectionError::Decode(DecodeError::InvalidLength))?;
        let column_count = column_count as usize;

        let mut fields = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let def = self.recv().await?;
            fields.push(self.decode(parse_column_name(&def.payload))?);
        }

        // EOF after column definitions
        let eof = self.recv().await?;
        if Reply::of(&eof.payload, self.capabilities) != Reply::Eof {
            self.closed = true;
            return Err(ConnectionError::Protocol(
                "Expected EOF after column definitions".into(),
            ));
        }

        let mut rows = Vec::new();
        let mut delivered = false;
        loop {
            let packet = self.recv().await?;
            match Reply::of(&packet.payload, self.capabilities) {
                Reply::Eof => break,
                Reply::Err => return Err(self.query_error(&packet.payload)),
                _ => {}
            }

            rows.push(self.decode(parse_text_row(&packet.payload, column_count))?);
            if rows.len() >= batch_size {
                let batch = QueryResult {
                    fields: fields.clone(),
                    rows: std::mem::take(&mut rows),
                    rows_affected: 0,
                };
                delivered = true;
                if let Err(e) = on_batch(batch) {
                    // The rest of the result set is still on the wire
                    self.closed = true;
                    return Err(e);
                }
            }
        }

        if !rows.is_empty() || !delivered {
            on_batch(QueryResult {
                fields,
                rows,
                rows_affected: 0,
            })?;
        }
        Ok(0)
    }

    fn decode<T>(&mut self, result: Result<T, DecodeError>) -> Result<T, ConnectionError> {
        result.map_err(|e| {
            self.closed = true;
            ConnectionError::Decode(e)
        })
    }
}

impl DbConn for MysqlConnection {
    fn exec<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<QueryResult, ConnectionError>> {
        Box::pin(async move {
            let mut result = QueryResult::default();
            let mut collect = |batch: QueryResult| -> Result<(), ConnectionError> {
                if result.fields.is_empty() {
                    result.fields = batch.fields;
                }
                result.rows.extend(batch.rows);
                Ok(())
            };
            let affected = self.run_query(sql, usize::MAX, &mut collect).await?;
            result.rows_affected = affected;
            Ok(result)
        })
    }

    fn stream_rows<'a>(
        &'a mut self,
        sql: &'a str,
        batch_size: usize,
        on_batch: &'a mut BatchCallback<'_>,
    ) -> BoxFuture<'a, Result<(), ConnectionError>> {
        Box::pin(async move {
            self.run_query(sql, batch_size, on_batch).await?;
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

/// Connector opening [`MysqlConnection`]s to one backend
#[derive(Debug, Clone)]
pub struct MysqlConnector {
    backend: Arc<BackendConfig>,
}

impl MysqlConnector {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Backend address (host:port)
    pub fn addr(&self) -> String {
        self.backend.addr()
    }
}

impl Connector for MysqlConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn DbConn>, ConnectionError>> {
        Box::pin(async move {
            let conn = MysqlConnection::connect(&self.backend, None).await?;
            Ok(Box::new(conn) as Box<dyn DbConn>)
        })
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Query failed ({code}, {state}): {message}")]
    Query {
        code: u16,
        state: String,
        message: String,
    },

    #[error("Malformed result set: {0}")]
    Decode(#[from] DecodeError),

    #[error("Query timed out")]
    Timeout,

    #[error("Query cancelled")]
    Cancelled,

    #[error("Connection disconnected")]
    Disconnected,
}
