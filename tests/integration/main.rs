//! Integration test entry point
//!
//! Run with: HERMES_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! Environment variables:
//! - HERMES_RUN_INTEGRATION_TESTS: Set to "1" to enable integration tests
//! - HERMES_TEST_HOST: Server host (default: 127.0.0.1)
//! - HERMES_TEST_PORT: Server port (default: 3306)
//! - HERMES_TEST_USER: User (default: root)
//! - HERMES_TEST_PASS: Password (default: empty)
//! - HERMES_TEST_DB: Database (default: hermes_test)

mod batch;
mod cursor;
mod exec;
mod failover;

use std::env;

use hermes::{ConnectionOptions, ConnectionUrl, Connector, HostAddress, HostRole, Session};

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("HERMES_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!(
                "Skipping integration test (set HERMES_RUN_INTEGRATION_TESTS=1 to run)"
            );
            return;
        }
    };
}

/// Server connection config from environment
#[derive(Debug, Clone)]
pub struct ServerTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

pub fn get_server_config() -> ServerTestConfig {
    ServerTestConfig {
        host: env::var("HERMES_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("HERMES_TEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3306),
        user: env::var("HERMES_TEST_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("HERMES_TEST_PASS").unwrap_or_default(),
        database: env::var("HERMES_TEST_DB").unwrap_or_else(|_| "hermes_test".to_string()),
    }
}

impl ServerTestConfig {
    pub fn url(&self, extra_options: &str) -> String {
        let mut url = format!(
            "mysql://{}:{}/{}?user={}&password={}",
            self.host, self.port, self.database, self.user, self.password
        );
        if !extra_options.is_empty() {
            url.push('&');
            url.push_str(extra_options);
        }
        url
    }

    pub fn options(&self, extra_options: &str) -> ConnectionOptions {
        ConnectionUrl::parse(&self.url(extra_options))
            .expect("test URL should parse")
            .options
    }

    pub fn host_address(&self) -> HostAddress {
        HostAddress::new(self.host.clone(), self.port, HostRole::Primary)
    }

    /// Connect with extra URL options appended
    pub async fn connect(&self, extra_options: &str) -> Session {
        let connector = Connector::new(self.options(extra_options));
        connector
            .connect(&self.host_address(), Some(&self.database))
            .await
            .expect("connect should succeed")
    }
}

/// Create the working table used by the suite, dropping leftovers
pub async fn setup_table(session: &Session, name: &str, ddl: &str) {
    session
        .execute(&format!("DROP TABLE IF EXISTS {name}"))
        .await
        .expect("drop should succeed");
    session
        .execute(&format!("CREATE TABLE {name} {ddl}"))
        .await
        .expect("create should succeed");
}
