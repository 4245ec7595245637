//! State probing against a live mysqld

use tablet_health::health::TabletType;
use tablet_health::monitor::probe;
use tablet_health::pool::{Connector, DbConn, MysqlConnector};

use crate::{get_mysql_config, skip_if_not_enabled};

#[tokio::test]
async fn test_probe_live_server() {
    skip_if_not_enabled!();

    let config = get_mysql_config();
    let connector = MysqlConnector::new(config.backend());
    let mut conn = connector.connect().await.expect("connect should succeed");

    let result = probe(conn.as_mut()).await.expect("probe should succeed");
    assert!(matches!(
        result.tablet_type,
        TabletType::Primary | TabletType::Replica
    ));
    assert!(result.questions.is_some());
    assert!(conn.is_usable());
}

#[tokio::test]
async fn test_query_error_reported() {
    skip_if_not_enabled!();

    let config = get_mysql_config();
    let connector = MysqlConnector::new(config.backend());
    let mut conn = connector.connect().await.expect("connect should succeed");

    let err = conn
        .exec("SELECT * FROM it_table_that_does_not_exist")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        tablet_health::pool::ConnectionError::Query { code: 1146, .. }
    ));
    // The connection survives a query error
    assert!(conn.is_usable());
    conn.exec("SELECT 1").await.expect("SELECT 1 should succeed");
}
