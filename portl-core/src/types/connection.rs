use std::collections::BTreeMap;

use crate::types::AnyValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Postgres,
    Http,
    Lambda,
    #[serde(alias = "csv")]
    File,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Postgres => "postgres",
            ConnectionKind::Http => "http",
            ConnectionKind::Lambda => "lambda",
            ConnectionKind::File => "file",
        }
    }
}

/// One entry of the job's connection registry.
///
/// `config` is connector-specific (host/port/database for Postgres, `base_url` and
/// `headers` for HTTP, `function_name`/`endpoint` for functions). String values may
/// carry `${VAR:-default}` environment placeholders.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConnectionDef {
    #[serde(rename = "type")]
    pub kind: ConnectionKind,

    #[serde(default)]
    pub config: BTreeMap<String, AnyValue>,
}

impl ConnectionDef {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}
