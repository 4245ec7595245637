//! Integration test entry point
//!
//! Streaming tests run everywhere. Tests against a live mysqld run with:
//! TABLET_HEALTH_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! Environment variables:
//! - TABLET_HEALTH_RUN_INTEGRATION_TESTS: Set to "1" to enable live tests
//! - TABLET_HEALTH_TEST_MYSQL_HOST: MySQL host (default: 127.0.0.1)
//! - TABLET_HEALTH_TEST_MYSQL_PORT: MySQL port (default: 3306)
//! - TABLET_HEALTH_TEST_MYSQL_USER: MySQL user (default: root)
//! - TABLET_HEALTH_TEST_MYSQL_PASS: MySQL password (default: empty)
//! - TABLET_HEALTH_TEST_MYSQL_DB: Scratch database (default: tablet_health_test)

mod probe;
mod schema_reload;
mod streaming;

use mysql::prelude::*;
use mysql::{Opts, OptsBuilder, Pool, PooledConn};
use std::env;
use tablet_health::config::BackendConfig;

/// Check if live integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("TABLET_HEALTH_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("Skipping integration test (set TABLET_HEALTH_RUN_INTEGRATION_TESTS=1 to run)");
            return;
        }
    };
}

/// MySQL connection config from environment
#[derive(Debug, Clone)]
pub struct MysqlTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

pub fn get_mysql_config() -> MysqlTestConfig {
    MysqlTestConfig {
        host: env::var("TABLET_HEALTH_TEST_MYSQL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("TABLET_HEALTH_TEST_MYSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3306),
        user: env::var("TABLET_HEALTH_TEST_MYSQL_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("TABLET_HEALTH_TEST_MYSQL_PASS").unwrap_or_default(),
        database: env::var("TABLET_HEALTH_TEST_MYSQL_DB")
            .unwrap_or_else(|_| "tablet_health_test".to_string()),
    }
}

impl MysqlTestConfig {
    /// Backend config for the crate's own connector, bound to the scratch database
    pub fn backend(&self) -> BackendConfig {
        BackendConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: Some(self.database.clone()),
        }
    }

    /// Admin connection through the `mysql` crate, creating the scratch
    /// database if needed
    pub fn admin_conn(&self) -> PooledConn {
        let opts: Opts = OptsBuilder::new()
            .ip_or_hostname(Some(&self.host))
            .tcp_port(self.port)
            .user(Some(&self.user))
            .pass(Some(&self.password))
            .into();
        let pool = Pool::new(opts).expect("Failed to create connection pool");
        let mut conn = pool.get_conn().expect("Failed to get connection");
        conn.query_drop(format!("CREATE DATABASE IF NOT EXISTS {}", self.database))
            .expect("CREATE DATABASE should succeed");
        conn.query_drop(format!("USE {}", self.database))
            .expect("USE should succeed");
        conn
    }
}
