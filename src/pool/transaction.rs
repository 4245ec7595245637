use tracing::{debug, warn};

use super::backend::{DbConn, QueryResult};
use super::connection::ConnectionError;

/// An explicit transaction on a borrowed connection
///
/// Finish it with [`Transaction::commit`] or [`Transaction::rollback`]. A
/// failed commit rolls back before returning. If the guard is dropped
/// unfinished (an early return or a cancelled future) no statement can be
/// sent from `Drop`, so the connection is marked broken instead and the
/// server discards the open transaction when the socket goes away.
pub struct Transaction<'a> {
    conn: &'a mut dyn DbConn,
    finished: bool,
}

impl<'a> Transaction<'a> {
    /// Send `begin` and return the guard
    pub async fn begin(conn: &'a mut dyn DbConn) -> Result<Self, ConnectionError> {
        conn.exec("begin").await?;
        debug!("Transaction started");
        Ok(Self {
            conn,
            finished: false,
        })
    }

    /// Execute a statement inside the transaction
    pub async fn exec(&mut self, sql: &str) -> Result<QueryResult, ConnectionError> {
        self.conn.exec(sql).await
    }

    /// Commit. On failure the transaction is rolled back and the commit
    /// error returned.
    pub async fn commit(mut self) -> Result<(), ConnectionError> {
        match self.conn.exec("commit").await {
            Ok(_) => {
                self.finished = true;
                debug!("Transaction committed");
                Ok(())
            }
            Err(e) => {
                self.rollback_inner().await;
                Err(e)
            }
        }
    }

    /// Roll back, discarding the connection if even that fails
    pub async fn rollback(mut self) {
        self.rollback_inner().await;
    }

    async fn rollback_inner(&mut self) {
        if let Err(e) = self.conn.exec("rollback").await {
            warn!(error = %e, "Rollback failed, discarding connection");
            self.conn.close();
        }
        self.finished = true;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Transaction dropped without commit or rollback, discarding connection");
            self.conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::fake::FakeConnector;

    #[tokio::test]
    async fn test_commit() {
        let connector = FakeConnector::default();
        let mut conn = connector.conn();

        let mut tx = Transaction::begin(&mut conn).await.unwrap();
        tx.exec("delete from t").await.unwrap();
        tx.commit().await.unwrap();

        assert!(conn.is_usable());
        assert_eq!(connector.statements(), vec!["begin", "delete from t", "commit"]);
    }

    #[tokio::test]
    async fn test_explicit_rollback() {
        let connector = FakeConnector::default();
        let mut conn = connector.conn();

        let tx = Transaction::begin(&mut conn).await.unwrap();
        tx.rollback().await;

        assert!(conn.is_usable());
        assert_eq!(connector.statements(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let connector = FakeConnector::default();
        connector.fail_on("commit");
        let mut conn = connector.conn();

        let tx = Transaction::begin(&mut conn).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert_eq!(connector.statements(), vec!["begin", "commit", "rollback"]);
    }

    #[tokio::test]
    async fn test_drop_unfinished_discards_connection() {
        let connector = FakeConnector::default();
        let mut conn = connector.conn();

        {
            let mut tx = Transaction::begin(&mut conn).await.unwrap();
            tx.exec("delete from t").await.unwrap();
        }

        assert!(!conn.is_usable());
    }

    #[tokio::test]
    async fn test_failed_begin_returns_error() {
        let connector = FakeConnector::default();
        connector.fail_on("begin");
        let mut conn = connector.conn();

        assert!(Transaction::begin(&mut conn).await.is_err());
        assert!(conn.is_usable());
    }
}
