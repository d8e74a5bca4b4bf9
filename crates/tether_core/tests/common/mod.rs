//! Shared fixture for PostgreSQL integration tests using testcontainers.
//!
//! The container and the connection manager have separate lifecycles:
//! - [`Endpoint`] is all the manager side needs from whoever runs the server
//! - [`TestDatabase`] owns one endpoint plus a manager connected to it
//!
//! Dropping the fixture stops the container.

#![allow(dead_code)]

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{ConnectionConfig, ConnectionManager, MonitorConfig};
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

/// Something that serves a PostgreSQL database.
pub trait Endpoint {
    /// Connection URL for the default database.
    fn url(&self) -> &str;
}

/// PostgreSQL running in a throwaway container.
pub struct PostgresContainer {
    _container: ContainerAsync<Postgres>,
    url: String,
}

impl PostgresContainer {
    /// Start a container and wait until it accepts connections.
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;
        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        Ok(Self {
            _container: container,
            url: format!("postgresql://postgres:postgres@{host}:{port}/postgres"),
        })
    }
}

impl Endpoint for PostgresContainer {
    fn url(&self) -> &str {
        &self.url
    }
}

/// A running database and a manager connected to it.
pub struct TestDatabase<E: Endpoint = PostgresContainer> {
    endpoint: E,
    manager: Arc<ConnectionManager>,
}

impl TestDatabase {
    /// Start a container and connect a manager with a short monitor interval.
    pub async fn start() -> Result<Self> {
        Self::with_endpoint(PostgresContainer::start().await?).await
    }
}

impl<E: Endpoint> TestDatabase<E> {
    /// Connect a manager to an existing endpoint.
    pub async fn with_endpoint(endpoint: E) -> Result<Self> {
        let manager = Arc::new(ConnectionManager::new(config_for(endpoint.url(), "tether-test"))?);
        manager.connect().await.context("Failed to connect manager")?;
        Ok(Self { endpoint, manager })
    }

    /// The endpoint serving the database.
    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// The connected manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// A second, independent manager on the same database.
    pub async fn admin(&self) -> Result<ConnectionManager> {
        let admin = ConnectionManager::new(config_for(self.endpoint.url(), "tether-admin"))?;
        admin.connect().await?;
        Ok(admin)
    }

    /// Run statements on the managed connection.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        let handle = self.manager.handle()?;
        let client = handle.lock().await?;
        client.batch_execute(sql).await.with_context(|| format!("Failed to run: {sql}"))?;
        Ok(())
    }

    /// Row count of a table.
    pub async fn count(&self, table: &str) -> Result<i64> {
        let handle = self.manager.handle()?;
        let client = handle.lock().await?;
        let row = client.query_one(&format!("SELECT count(*) FROM {table}"), &[]).await?;
        Ok(row.get(0))
    }

    /// Create the `contacts(id, name, phone)` table.
    pub async fn create_contacts(&self) -> Result<()> {
        self.execute(
            "CREATE TABLE contacts (
                seq bigserial,
                id integer PRIMARY KEY,
                name text NOT NULL,
                phone text
            )",
        )
        .await
    }
}

/// Manager configuration with short deadlines for tests.
pub fn config_for(url: &str, application_name: &str) -> ConnectionConfig {
    let mut config = ConnectionConfig::postgres(url)
        .with_monitor(MonitorConfig::fixed(Duration::from_millis(250)));
    config.options.connect_timeout_secs = 5;
    config.options.ping_timeout_secs = 2;
    config.options.application_name = application_name.to_string();
    config
}

/// Contact rows used across tests.
pub fn contacts() -> Vec<Vec<String>> {
    [["1", "Alice", "555-0100"], ["2", "Bob", "555-0101"]]
        .iter()
        .map(|row| row.iter().map(|v| v.to_string()).collect())
        .collect()
}
