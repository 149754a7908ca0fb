use std::time::Duration;

use clap::Parser;

use crate::db::{PoolSettings, RetryPolicy};

pub const SERVICE_NAME: &str = "order-service";

/// Overridable at build time with `SERVICE_VERSION=v1.2.3 cargo build`.
pub const SERVICE_VERSION: &str = match option_env!("SERVICE_VERSION") {
    Some(version) => version,
    None => "v1.0.0",
};

#[derive(Debug, Clone, Parser)]
#[command(name = "order-service")]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "DB_HOST", default_value = "postgresql")]
    pub db_host: String,

    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    #[arg(long, env = "DB_USER", default_value = "postgres")]
    pub db_user: String,

    #[arg(long, env = "DB_PASSWORD", default_value = "postgres", hide_env_values = true)]
    pub db_password: String,

    #[arg(long, env = "DB_NAME", default_value = "postgres")]
    pub db_name: String,

    #[arg(long, env = "DB_MAX_OPEN_CONNS", default_value_t = 25)]
    pub db_max_open_conns: u32,

    #[arg(long, env = "DB_MAX_IDLE_CONNS", default_value_t = 5)]
    pub db_max_idle_conns: u32,

    #[arg(long, env = "DB_CONN_MAX_LIFETIME_SECS", default_value_t = 300)]
    pub db_conn_max_lifetime_secs: u64,

    #[arg(long, env = "DB_CONNECT_MAX_ATTEMPTS", default_value_t = 30)]
    pub db_connect_max_attempts: u32,

    #[arg(long, env = "DB_CONNECT_RETRY_DELAY_SECS", default_value_t = 2)]
    pub db_connect_retry_delay_secs: u64,

    /// OTLP collector for span export. Empty disables export.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT", default_value = "http://jaeger:4317")]
    pub otlp_endpoint: String,

    /// Instance identity reported in headers and bodies. Falls back to the host name.
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,
}

impl Config {
    /// libpq-style key/value connection string, accepted by tokio-postgres.
    pub fn database_url(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode=disable",
            quote_conninfo(&self.db_host),
            self.db_port,
            quote_conninfo(&self.db_user),
            quote_conninfo(&self.db_password),
            quote_conninfo(&self.db_name),
        )
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_open: self.db_max_open_conns,
            max_idle: self.db_max_idle_conns,
            max_lifetime: Duration::from_secs(self.db_conn_max_lifetime_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.db_connect_max_attempts,
            delay: Duration::from_secs(self.db_connect_retry_delay_secs),
        }
    }

    pub fn identity(&self) -> ServiceIdentity {
        let pod_name = self
            .pod_name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(host_name)
            .unwrap_or_else(|| "unknown".to_string());

        ServiceIdentity {
            pod_name,
            version: SERVICE_VERSION.to_string(),
        }
    }
}

/// Which instance served a response, and which build it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub pod_name: String,
    pub version: String,
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn quote_conninfo(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}
