//! PostgreSQL settings for the `postgres` store backend.

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

/// Reported to the server as `application_name`, visible in `pg_stat_activity`.
pub const APPLICATION_NAME: &str = "funnelflow-control-plane";

/// Connection and pool settings.
///
/// `DATABASE_URL` wins when set. Otherwise the connection is assembled from
/// `POSTGRES_HOST`, `POSTGRES_PORT`, `POSTGRES_USER`, `POSTGRES_PASSWORD` and
/// `POSTGRES_DATABASE`. Pool sizing and timeouts always come from the
/// `POSTGRES_` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Full connection URL, from `DATABASE_URL`
    #[serde(skip)]
    pub url: Option<String>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_name")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_name")]
    pub database: String,

    /// Upper bound on pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a free connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,

    /// Server-side `statement_timeout` in milliseconds; 0 leaves the server
    /// default in place.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_name() -> String {
    "funnelflow".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_statement_timeout_ms() -> u64 {
    15_000
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        let mut config = envy::prefixed("POSTGRES_").from_env::<DatabaseConfig>()?;
        config.url = std::env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty());
        Ok(config)
    }

    /// Connection options, from `url` when present.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let options = match &self.url {
            Some(url) => url.parse::<PgConnectOptions>()?,
            None => PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.user)
                .password(&self.password)
                .database(&self.database),
        };
        let options = options.application_name(APPLICATION_NAME);
        if self.statement_timeout_ms == 0 {
            return Ok(options);
        }
        Ok(options.options([("statement_timeout", self.statement_timeout_ms.to_string())]))
    }

    /// Pool bounds with `min_connections` clamped to `max_connections`.
    pub fn pool_bounds(&self) -> (u32, u32) {
        let max = self.max_connections.max(1);
        (self.min_connections.min(max), max)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            user: default_name(),
            password: String::new(),
            database: default_name(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
            statement_timeout_ms: default_statement_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_parts() {
        let config = DatabaseConfig {
            host: "db.internal".into(),
            port: 6432,
            ..DatabaseConfig::default()
        };
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6432);
        assert_eq!(options.get_username(), "funnelflow");
        assert_eq!(options.get_database(), Some("funnelflow"));
        assert_eq!(options.get_application_name(), Some(APPLICATION_NAME));
        assert!(options
            .get_options()
            .is_some_and(|o| o.contains("statement_timeout=15000")));
    }

    #[test]
    fn test_url_overrides_parts() {
        let config = DatabaseConfig {
            url: Some("postgres://ops:pw@pg.example.com:5433/funnels".into()),
            host: "ignored".into(),
            statement_timeout_ms: 0,
            ..DatabaseConfig::default()
        };
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_host(), "pg.example.com");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "ops");
        assert_eq!(options.get_database(), Some("funnels"));
        assert_eq!(options.get_options(), None);
    }

    #[test]
    fn test_bad_url_is_an_error() {
        let config = DatabaseConfig {
            url: Some("not a url".into()),
            ..DatabaseConfig::default()
        };
        assert!(config.connect_options().is_err());
    }

    #[test]
    fn test_pool_bounds() {
        let config = DatabaseConfig {
            max_connections: 0,
            min_connections: 5,
            ..DatabaseConfig::default()
        };
        assert_eq!(config.pool_bounds(), (1, 1));
        assert_eq!(DatabaseConfig::default().pool_bounds(), (1, 10));
    }
}
