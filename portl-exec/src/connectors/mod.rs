//! Capability interfaces the engine drives, plus the default adapters.

mod file;
mod function;
pub mod http;
pub mod sql;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portl_core::types::{ConnectionDef, ConnectionKind, FailureKind};
use serde_json::Value as JsonValue;

pub use file::{FileRowSource, ReadSpec, RowSource, RowStream};
pub use function::{FunctionInvoker, HttpFunctionInvoker};
pub use http::{HttpClient, HttpError, HttpRequestParts, HttpResponseParts, ReqwestHttpClient};
pub use sql::{Row, SqlCommand, SqlOutcome, SqlStatement};

use crate::error::ConnectorError;

/// One open database transaction.
#[async_trait]
pub trait SqlSession: Send {
    async fn execute(&mut self, command: &SqlCommand) -> Result<SqlOutcome, ConnectorError>;

    async fn savepoint(&mut self, name: &str) -> Result<(), ConnectorError>;

    async fn release_savepoint(&mut self, name: &str) -> Result<(), ConnectorError>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), ConnectorError>;

    async fn commit(self: Box<Self>) -> Result<(), ConnectorError>;

    async fn rollback(self: Box<Self>) -> Result<(), ConnectorError>;
}

#[async_trait]
pub trait SqlConnector: Send + Sync {
    /// Check out a connection and open a transaction on it.
    async fn begin(&self) -> Result<Box<dyn SqlSession>, ConnectorError>;
}

/// Builds SQL connectors from a connection's (env-interpolated) config.
#[async_trait]
pub trait SqlConnectorFactory: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        config: &BTreeMap<String, JsonValue>,
    ) -> Result<Arc<dyn SqlConnector>, ConnectorError>;
}

/// A resolved connection, cached for the lifetime of a run.
#[derive(Clone)]
pub enum ConnectionHandle {
    Sql(Arc<dyn SqlConnector>),
    Http(Arc<dyn HttpClient>),
    Function(Arc<dyn FunctionInvoker>),
    Files(Arc<dyn RowSource>),
}

impl ConnectionHandle {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ConnectionHandle::Sql(_) => "sql",
            ConnectionHandle::Http(_) => "http",
            ConnectionHandle::Function(_) => "function",
            ConnectionHandle::Files(_) => "files",
        }
    }
}

#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    /// `def.config` arrives with `${ENV}` placeholders already substituted.
    async fn resolve(&self, name: &str, def: &ConnectionDef) -> Result<ConnectionHandle, ConnectorError>;
}

/// Fixed handles by connection name.
#[derive(Clone, Default)]
pub struct StaticResolver {
    handles: HashMap<String, ConnectionHandle>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, handle: ConnectionHandle) -> Self {
        self.handles.insert(name.into(), handle);
        self
    }
}

#[async_trait]
impl ConnectionResolver for StaticResolver {
    async fn resolve(&self, name: &str, _def: &ConnectionDef) -> Result<ConnectionHandle, ConnectorError> {
        self.handles.get(name).cloned().ok_or_else(|| {
            ConnectorError::permanent(FailureKind::Other, format!("no handle registered for connection '{name}'"))
        })
    }
}

/// Builds handles from connection configs: reqwest for `http`, the HTTP
/// function invoker for `lambda`, local files for `file`, and the injected
/// factory for `postgres`.
pub struct DefaultResolver {
    http: Arc<dyn HttpClient>,
    sql: Option<Arc<dyn SqlConnectorFactory>>,
    call_timeout: Duration,
    max_response_bytes: usize,
}

impl DefaultResolver {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            sql: None,
            call_timeout: Duration::from_secs(30),
            max_response_bytes: 10 * 1024 * 1024,
        }
    }

    pub fn with_sql(mut self, factory: Arc<dyn SqlConnectorFactory>) -> Self {
        self.sql = Some(factory);
        self
    }

    pub fn with_limits(mut self, call_timeout: Duration, max_response_bytes: usize) -> Self {
        self.call_timeout = call_timeout;
        self.max_response_bytes = max_response_bytes;
        self
    }
}

#[async_trait]
impl ConnectionResolver for DefaultResolver {
    async fn resolve(&self, name: &str, def: &ConnectionDef) -> Result<ConnectionHandle, ConnectorError> {
        match def.kind {
            ConnectionKind::Postgres => {
                let factory = self.sql.as_ref().ok_or_else(|| {
                    ConnectorError::permanent(
                        FailureKind::DbConnection,
                        format!("connection '{name}': no postgres driver configured"),
                    )
                })?;
                Ok(ConnectionHandle::Sql(factory.connect(name, &def.config).await?))
            }
            ConnectionKind::Http => Ok(ConnectionHandle::Http(self.http.clone())),
            ConnectionKind::Lambda => {
                let endpoint = def
                    .config_str("endpoint")
                    .or_else(|| def.config_str("endpoint_url"))
                    .ok_or_else(|| {
                        ConnectorError::permanent(
                            FailureKind::Other,
                            format!("connection '{name}': lambda connections need an 'endpoint'"),
                        )
                    })?;
                let invoker = HttpFunctionInvoker::new(self.http.clone(), endpoint)
                    .with_headers(string_map(def.config.get("headers")))
                    .with_limits(self.call_timeout, self.max_response_bytes);
                Ok(ConnectionHandle::Function(Arc::new(invoker)))
            }
            ConnectionKind::File => {
                let source = match def.config_str("base_dir") {
                    Some(dir) => FileRowSource::with_base_dir(dir),
                    None => FileRowSource::new(),
                };
                Ok(ConnectionHandle::Files(Arc::new(source)))
            }
        }
    }
}

/// String-valued entries of a config object (`headers: {..}`).
pub fn string_map(value: Option<&JsonValue>) -> BTreeMap<String, String> {
    value
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let v = match v {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default()
}
