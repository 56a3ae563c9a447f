//! Connection settings read from a `postgres` connection's config block.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgConnectOptions;

use crate::error::StoreError;

/// Accepted keys: `dsn` (or `url`), or the discrete `host`, `port`,
/// `database`/`dbname`, `user`/`username`, `password`; plus `sslmode`,
/// `max_connections` and `statement_timeout_ms`.
#[derive(Debug, Clone)]
pub struct PgSettings {
    pub dsn: Option<SecretString>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub ssl_mode: Option<String>,
    pub max_connections: Option<u32>,
    pub statement_timeout: Option<Duration>,
}

impl PgSettings {
    pub fn from_config(config: &BTreeMap<String, JsonValue>) -> Result<Self, StoreError> {
        let dsn = string(config, &["dsn", "url"]).map(SecretString::from);
        let host = string(config, &["host"]);
        if dsn.is_none() && host.is_none() {
            return Err(StoreError::Config("needs either 'dsn' or 'host'".to_string()));
        }

        Ok(Self {
            dsn,
            host,
            port: number(config, "port")?
                .map(|p| u16::try_from(p).map_err(|_| StoreError::Config(format!("port {p} out of range"))))
                .transpose()?,
            database: string(config, &["database", "dbname"]),
            user: string(config, &["user", "username"]),
            password: string(config, &["password"]).map(SecretString::from),
            ssl_mode: string(config, &["sslmode", "ssl_mode"]),
            max_connections: number(config, "max_connections")?
                .map(|n| u32::try_from(n).map_err(|_| StoreError::Config(format!("max_connections {n} out of range"))))
                .transpose()?,
            statement_timeout: number(config, "statement_timeout_ms")?.map(Duration::from_millis),
        })
    }

    /// Driver options. Discrete keys override the matching DSN parts;
    /// `statement_timeout` is sent as a session parameter.
    pub fn connect_options(&self, default_timeout: Duration) -> Result<PgConnectOptions, StoreError> {
        let mut options = match &self.dsn {
            Some(dsn) => PgConnectOptions::from_str(dsn.expose_secret())
                .map_err(|e| StoreError::Config(format!("invalid dsn: {e}")))?,
            None => PgConnectOptions::new(),
        };
        if let Some(host) = &self.host {
            options = options.host(host);
        }
        if let Some(port) = self.port {
            options = options.port(port);
        }
        if let Some(database) = &self.database {
            options = options.database(database);
        }
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }
        if let Some(mode) = &self.ssl_mode {
            let mode = mode
                .parse()
                .map_err(|e| StoreError::Config(format!("invalid sslmode '{mode}': {e}")))?;
            options = options.ssl_mode(mode);
        }
        let timeout = self.statement_timeout.unwrap_or(default_timeout);
        Ok(options.options([("statement_timeout", timeout.as_millis().to_string())]))
    }
}

fn string(config: &BTreeMap<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| config.get(*k))
        .and_then(|v| match v {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Numbers may arrive as strings after env interpolation (`port: "${PGPORT}"`).
fn number(config: &BTreeMap<String, JsonValue>, key: &str) -> Result<Option<u64>, StoreError> {
    match config.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| StoreError::Config(format!("'{key}' must be a non-negative integer"))),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| StoreError::Config(format!("'{key}' must be a non-negative integer, got '{s}'"))),
        Some(_) => Err(StoreError::Config(format!("'{key}' must be a non-negative integer"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: JsonValue) -> BTreeMap<String, JsonValue> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn discrete_keys_are_read() {
        let s = PgSettings::from_config(&config(json!({
            "host": "db.internal",
            "port": "6543",
            "database": "shop",
            "username": "etl",
            "password": "pw-secret",
            "statement_timeout_ms": 1500,
        })))
        .unwrap();

        assert_eq!(s.host.as_deref(), Some("db.internal"));
        assert_eq!(s.port, Some(6543));
        assert_eq!(s.database.as_deref(), Some("shop"));
        assert_eq!(s.user.as_deref(), Some("etl"));
        assert_eq!(s.statement_timeout, Some(Duration::from_millis(1500)));
        assert!(!format!("{s:?}").contains("pw-secret"));
    }

    #[test]
    fn dsn_alone_is_enough() {
        let s = PgSettings::from_config(&config(json!({ "url": "postgres://u:p@localhost/db" }))).unwrap();
        assert!(s.dsn.is_some());
        assert!(s.connect_options(Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn missing_host_and_dsn_is_rejected() {
        let err = PgSettings::from_config(&config(json!({ "database": "shop" }))).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn bad_port_is_rejected() {
        let err = PgSettings::from_config(&config(json!({ "host": "h", "port": "abc" }))).unwrap_err();
        assert!(err.to_string().contains("'port'"));

        let err = PgSettings::from_config(&config(json!({ "host": "h", "port": 70000 }))).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn empty_interpolated_values_count_as_unset() {
        let s = PgSettings::from_config(&config(json!({ "host": "h", "port": "", "password": "" }))).unwrap();
        assert_eq!(s.port, None);
        assert!(s.password.is_none());
    }
}
