mod backend;
mod connection;
mod dedicated;
mod transaction;

#[cfg(test)]
pub(crate) mod fake;

pub use backend::{BatchCallback, Connector, DbConn, QueryResult};
pub use connection::{ConnectionError, MysqlConnection, MysqlConnector};
pub use dedicated::{ConnPool, ConnPoolConfig, PoolError, PooledConn};
pub use transaction::Transaction;
