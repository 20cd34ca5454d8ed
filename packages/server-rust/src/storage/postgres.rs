//! Postgres connection pool acquired at startup and closed at teardown.

use std::fmt;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tracing::info;

use crate::lifecycle::{RegistryError, ShutdownRegistry};

/// Name under which the pool's release callback is registered.
pub const POOL_RELEASE_NAME: &str = "postgres";

/// Connection parameters for the application database.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Session `TimeZone` applied to every connection.
    pub timezone: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    /// Builds connection options with TLS disabled and the session time
    /// zone set.
    #[must_use]
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(PgSslMode::Disable)
            .options([("TimeZone", self.timezone.as_str())])
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            timezone: "Asia/Shanghai".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("database", &self.database)
            .field("timezone", &self.timezone)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

/// Opens the pool and verifies that one connection can be established.
///
/// # Errors
///
/// Returns the driver error if the database cannot be reached within the
/// acquire timeout.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(config.connect_options())
        .await?;

    info!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        "connected to database"
    );
    Ok(pool)
}

/// Registers closing `pool` as a release callback.
///
/// # Errors
///
/// Returns [`RegistryError::Closed`] if teardown has already started.
pub fn register_pool_release(registry: &ShutdownRegistry, pool: PgPool) -> Result<(), RegistryError> {
    registry.register(POOL_RELEASE_NAME, move || async move {
        pool.close().await;
        Ok(())
    })
}
