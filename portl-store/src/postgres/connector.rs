use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portl_exec::connectors::{SqlConnector, SqlConnectorFactory, SqlSession};
use portl_exec::ConnectorError;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::classify;
use super::session::{ColumnTypeCache, PgSession};
use crate::config::PgSettings;
use crate::error::StoreError;

/// A pool for one named connection. Sessions share its column-type cache.
pub struct PgConnector {
    pool: PgPool,
    column_types: ColumnTypeCache,
}

impl PgConnector {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            column_types: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SqlConnector for PgConnector {
    async fn begin(&self) -> Result<Box<dyn SqlSession>, ConnectorError> {
        let tx = self.pool.begin().await.map_err(|e| classify(&e))?;
        Ok(Box::new(PgSession::new(tx, self.column_types.clone())))
    }
}

/// Opens pools lazily: no connection is made until the first transaction,
/// so a dry run never touches the database.
pub struct PgConnectorFactory {
    statement_timeout: Duration,
    acquire_timeout: Duration,
    max_connections: u32,
    pools: Mutex<HashMap<String, Arc<PgConnector>>>,
}

impl PgConnectorFactory {
    pub fn new(statement_timeout: Duration) -> Self {
        Self {
            statement_timeout,
            acquire_timeout: Duration::from_secs(10),
            max_connections: 2,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn open(&self, config: &BTreeMap<String, JsonValue>) -> Result<PgConnector, StoreError> {
        let settings = PgSettings::from_config(config)?;
        let options = settings.connect_options(self.statement_timeout)?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.unwrap_or(self.max_connections))
            .acquire_timeout(self.acquire_timeout)
            .connect_lazy_with(options);
        Ok(PgConnector::new(pool))
    }
}

#[async_trait]
impl SqlConnectorFactory for PgConnectorFactory {
    async fn connect(
        &self,
        name: &str,
        config: &BTreeMap<String, JsonValue>,
    ) -> Result<Arc<dyn SqlConnector>, ConnectorError> {
        let mut pools = self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = pools.get(name) {
            return Ok(existing.clone() as Arc<dyn SqlConnector>);
        }
        let connector = Arc::new(self.open(config).map_err(|e| {
            let e = ConnectorError::from(e);
            ConnectorError {
                message: format!("connection '{name}': {}", e.message),
                ..e
            }
        })?);
        tracing::debug!(connection = name, "postgres pool created");
        pools.insert(name.to_string(), connector.clone());
        Ok(connector as Arc<dyn SqlConnector>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portl_core::types::FailureKind;
    use serde_json::json;

    fn config(value: JsonValue) -> BTreeMap<String, JsonValue> {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn connections_are_cached_by_name() {
        let factory = PgConnectorFactory::new(Duration::from_secs(5));
        let cfg = config(json!({ "host": "localhost", "database": "shop" }));

        let a = factory.connect("db", &cfg).await.unwrap();
        let b = factory.connect("db", &cfg).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn invalid_config_is_a_permanent_failure() {
        let factory = PgConnectorFactory::new(Duration::from_secs(5));

        let err = match factory.connect("db", &config(json!({ "port": 5432 }))).await {
            Err(e) => e,
            Ok(_) => panic!("expected a config failure"),
        };

        assert_eq!(err.kind, FailureKind::Other);
        assert!(!err.is_transient());
        assert!(err.message.starts_with("connection 'db':"));
    }
}
