use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use portl_core::types::FailureKind;
use serde_json::Value as JsonValue;

use crate::connectors::http::{HttpClient, HttpRequestParts};
use crate::error::ConnectorError;
use crate::retry::{get_header_ci, parse_retry_after};

#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, function: &str, payload: &JsonValue) -> Result<JsonValue, ConnectorError>;
}

const INVOKE_PATH: &str = "/2015-03-31/functions/{function}/invocations";

/// Invokes functions over HTTP using the Lambda `Invoke` path layout
/// (`{endpoint}/2015-03-31/functions/{name}/invocations`), or any endpoint
/// carrying a literal `{function}` placeholder.
pub struct HttpFunctionInvoker {
    http: Arc<dyn HttpClient>,
    endpoint: String,
    headers: BTreeMap<String, String>,
    timeout: Duration,
    max_response_bytes: usize,
}

impl HttpFunctionInvoker {
    pub fn new(http: Arc<dyn HttpClient>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            timeout: Duration::from_secs(30),
            max_response_bytes: 10 * 1024 * 1024,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_limits(mut self, timeout: Duration, max_response_bytes: usize) -> Self {
        self.timeout = timeout;
        self.max_response_bytes = max_response_bytes;
        self
    }

    fn url_for(&self, function: &str) -> Result<url::Url, ConnectorError> {
        let raw = if self.endpoint.contains("{function}") {
            self.endpoint.replace("{function}", function)
        } else {
            format!(
                "{}{}",
                self.endpoint.trim_end_matches('/'),
                INVOKE_PATH.replace("{function}", function)
            )
        };
        url::Url::parse(&raw)
            .map_err(|e| ConnectorError::permanent(FailureKind::Other, format!("invalid function url '{raw}': {e}")))
    }
}

#[async_trait]
impl FunctionInvoker for HttpFunctionInvoker {
    async fn invoke(&self, function: &str, payload: &JsonValue) -> Result<JsonValue, ConnectorError> {
        let mut headers = self.headers.clone();
        headers
            .entry("content-type".to_string())
            .or_insert_with(|| "application/json".to_string());
        let req = HttpRequestParts {
            method: "POST".to_string(),
            url: self.url_for(function)?,
            headers,
            body: serde_json::to_vec(payload)
                .map_err(|e| ConnectorError::permanent(FailureKind::Data, e.to_string()))?,
        };

        let resp = self.http.send(req, self.timeout, self.max_response_bytes).await?;
        if !(200..300).contains(&resp.status) {
            let retry_after = parse_retry_after(&resp.headers, SystemTime::now());
            let kind = FailureKind::from_http_status(resp.status).unwrap_or(FailureKind::Function);
            return Err(ConnectorError::new(
                kind,
                format!("function '{function}' returned HTTP {}", resp.status),
            )
            .with_retry_after(retry_after));
        }
        if let Some(kind) = get_header_ci(&resp.headers, "x-amz-function-error") {
            return Err(ConnectorError::permanent(
                FailureKind::Function,
                format!("function '{function}' failed ({kind}): {}", resp.body_value()),
            ));
        }
        Ok(resp.body_value())
    }
}
