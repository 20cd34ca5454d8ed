//! Process configuration read once at startup from flags and environment.

use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use crate::network::NetworkConfig;
use crate::service::{RateLimitConfig, ServiceConfig};
use crate::storage::DatabaseConfig;

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

/// Command-line arguments. Every flag falls back to an environment variable.
///
/// `PORT` and the `DB_*` connection parameters are required; a missing or
/// unparsable value makes the process exit before anything starts.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "cloudrun-server",
    version,
    about = "Rate-limited HTTP service with coordinated graceful shutdown"
)]
pub struct CliArgs {
    /// Interface to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "PORT")]
    pub port: u16,

    #[arg(long, env = "DB_HOST")]
    pub db_host: String,

    #[arg(long, env = "DB_PORT")]
    pub db_port: u16,

    #[arg(long, env = "DB_USERNAME")]
    pub db_username: String,

    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub db_password: String,

    #[arg(long, env = "DB_DATABASE")]
    pub db_database: String,

    /// Session time zone for database connections.
    #[arg(long, env = "DB_TIMEZONE", default_value = "Asia/Shanghai")]
    pub db_timezone: String,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub db_max_connections: u32,

    /// Seconds to wait for a database connection at startup.
    #[arg(long, env = "DB_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub db_connect_timeout_secs: u64,

    /// Token-bucket capacity.
    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 60,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub rate_limit_burst: u32,

    /// Milliseconds for one token to accrue.
    #[arg(long, env = "RATE_LIMIT_INTERVAL_MS", default_value_t = 1000,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub rate_limit_interval_ms: u64,

    /// Seconds to wait for in-flight connections during shutdown.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Log a captured call stack with recovered panics.
    #[arg(long, env = "VERBOSE_PANICS", default_value_t = true, action = ArgAction::Set)]
    pub verbose_panics: bool,

    /// Resolve client addresses from `X-Forwarded-For` and `X-Real-IP`.
    #[arg(long, env = "TRUST_FORWARDED_HEADERS", default_value_t = true, action = ArgAction::Set)]
    pub trust_forwarded_headers: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Validation failures that clap cannot express.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must not be empty")]
    Empty { name: &'static str },
}

/// Typed configuration for every component.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = ConfigError;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        for (name, value) in [
            ("HOST", &args.host),
            ("DB_HOST", &args.db_host),
            ("DB_USERNAME", &args.db_username),
            ("DB_DATABASE", &args.db_database),
            ("DB_TIMEZONE", &args.db_timezone),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty { name });
            }
        }

        Ok(Self {
            network: NetworkConfig {
                host: args.host,
                port: args.port,
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            },
            service: ServiceConfig {
                rate_limit: RateLimitConfig {
                    burst: args.rate_limit_burst,
                    refill_interval: Duration::from_millis(args.rate_limit_interval_ms),
                },
                verbose_panics: args.verbose_panics,
                trust_forwarded_headers: args.trust_forwarded_headers,
            },
            database: DatabaseConfig {
                host: args.db_host,
                port: args.db_port,
                username: args.db_username,
                password: args.db_password,
                database: args.db_database,
                timezone: args.db_timezone,
                max_connections: args.db_max_connections,
                acquire_timeout: Duration::from_secs(args.db_connect_timeout_secs),
            },
            log_format: args.log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;

    use super::*;

    const REQUIRED: [&str; 13] = [
        "cloudrun-server",
        "--port",
        "8080",
        "--db-host",
        "db",
        "--db-port",
        "5432",
        "--db-username",
        "app",
        "--db-password",
        "pw",
        "--db-database",
        "orders",
    ];

    fn parse(extra: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(REQUIRED.iter().chain(extra))
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }

    #[test]
    fn defaults_apply_when_only_required_values_are_given() {
        let config = AppConfig::try_from(parse(&[]).unwrap()).unwrap();

        assert_eq!(config.network.host, "0.0.0.0");
        assert_eq!(config.network.port, 8080);
        assert_eq!(config.network.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.service.rate_limit, RateLimitConfig::default());
        assert!(config.service.verbose_panics);
        assert!(config.service.trust_forwarded_headers);
        assert_eq!(config.database.timezone, "Asia/Shanghai");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.database.password, "pw");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn overrides_are_applied() {
        let args = parse(&[
            "--rate-limit-burst",
            "2",
            "--rate-limit-interval-ms",
            "500",
            "--shutdown-timeout-secs",
            "5",
            "--verbose-panics",
            "false",
            "--trust-forwarded-headers",
            "false",
            "--log-format",
            "pretty",
        ])
        .unwrap();
        let config = AppConfig::try_from(args).unwrap();

        assert_eq!(config.service.rate_limit.burst, 2);
        assert_eq!(config.service.rate_limit.refill_interval, Duration::from_millis(500));
        assert_eq!(config.network.shutdown_timeout, Duration::from_secs(5));
        assert!(!config.service.verbose_panics);
        assert!(!config.service.trust_forwarded_headers);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn missing_port_is_rejected() {
        let err = CliArgs::try_parse_from(["cloudrun-server", "--db-host", "db"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut args = REQUIRED.to_vec();
        args[2] = "http";
        let err = CliArgs::try_parse_from(args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn zero_burst_is_rejected() {
        let err = parse(&["--rate-limit-burst", "0"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn blank_database_host_is_rejected() {
        let mut args = REQUIRED.to_vec();
        args[4] = "  ";
        let err = AppConfig::try_from(CliArgs::try_parse_from(args).unwrap()).unwrap_err();
        assert_eq!(err, ConfigError::Empty { name: "DB_HOST" });
    }
}
