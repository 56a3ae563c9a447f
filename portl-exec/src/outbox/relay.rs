use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use portl_core::expressions::Evaluator;
use portl_core::types::ConnectionDef;
use serde_json::{Map, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use crate::connectors::{string_map, HttpClient, HttpRequestParts};
use crate::context::ExecutionContext;
use crate::error::ConnectorError;
use crate::outbox::{OutboxRecord, OutboxStore};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Delivery attempts before an intent is dead-lettered.
    pub max_attempts: u32,
    pub batch_size: usize,
    pub call_timeout: Duration,
    pub max_response_bytes: usize,
    pub idempotency_header: String,
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            batch_size: 50,
            call_timeout: Duration::from_secs(30),
            max_response_bytes: 1024 * 1024,
            idempotency_header: "Idempotency-Key".to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RelayStats {
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl RelayStats {
    fn absorb(&mut self, other: RelayStats) {
        self.claimed += other.claimed;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Delivers committed outbox intents at-least-once, sending the dedup key as
/// the idempotency key so receivers can drop duplicates.
///
/// Intents store only their own headers. Connection headers (usually
/// credentials) come from the `target` connection at delivery time.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    http: Arc<dyn HttpClient>,
    config: RelayConfig,
    targets: BTreeMap<String, Result<BTreeMap<String, String>, String>>,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, http: Arc<dyn HttpClient>, config: RelayConfig) -> Self {
        Self {
            store,
            http,
            config,
            targets: BTreeMap::new(),
        }
    }

    /// Connections intents may name as `target`. Their `headers` have `${ENV}`
    /// placeholders substituted from `env`; a connection with an unresolved
    /// placeholder fails every delivery to it.
    pub fn with_targets(mut self, connections: &BTreeMap<String, ConnectionDef>, env: BTreeMap<String, String>) -> Self {
        let ctx = ExecutionContext::new(Map::new(), env);
        let evaluator = Evaluator::default();
        for (name, def) in connections {
            let raw = def.config.get("headers").cloned().unwrap_or(JsonValue::Null);
            let headers = match evaluator.render_value_collecting(&raw, &ctx) {
                Ok(r) if r.unresolved.is_empty() => Ok(string_map(Some(&r.value))),
                Ok(r) => Err(format!("connection '{name}': unresolved {}", r.unresolved.join(", "))),
                Err(e) => Err(format!("connection '{name}': {e}")),
            };
            self.targets.insert(name.clone(), headers);
        }
        self
    }

    /// Claim one batch and try each intent once.
    pub async fn relay_once(&self) -> Result<RelayStats, ConnectorError> {
        let records = self.store.claim_pending(self.config.batch_size).await?;
        let mut stats = RelayStats {
            claimed: records.len(),
            ..RelayStats::default()
        };

        for record in records {
            match self.deliver(&record).await {
                Ok(()) => {
                    self.store.mark_delivered(record.id).await?;
                    stats.delivered += 1;
                }
                Err(error) => {
                    tracing::warn!(id = record.id, dedup_key = %record.intent.dedup_key, %error, "outbox delivery failed");
                    if record.attempts + 1 >= self.config.max_attempts {
                        self.store.move_to_dead_letter(record.id, &error).await?;
                        stats.dead_lettered += 1;
                    } else {
                        self.store.mark_failed(record.id, &error).await?;
                        stats.failed += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Relay until `cancel` fires, sleeping between empty polls.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RelayStats, ConnectorError> {
        let mut total = RelayStats::default();
        while !cancel.is_cancelled() {
            let stats = self.relay_once().await?;
            total.absorb(stats);
            if stats.claimed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
        Ok(total)
    }

    async fn deliver(&self, record: &OutboxRecord) -> Result<(), String> {
        let intent = &record.intent;
        let url = url::Url::parse(&intent.url).map_err(|e| format!("invalid url '{}': {e}", intent.url))?;

        let mut headers = match &intent.target {
            Some(name) => match self.targets.get(name) {
                Some(Ok(headers)) => headers.clone(),
                Some(Err(reason)) => return Err(reason.clone()),
                None => return Err(format!("no connection configured for target '{name}'")),
            },
            None => BTreeMap::new(),
        };
        headers.extend(intent.headers.clone());
        headers.insert(self.config.idempotency_header.clone(), intent.dedup_key.clone());
        let body = if intent.body.is_null() {
            Vec::new()
        } else {
            headers
                .entry("content-type".to_string())
                .or_insert_with(|| "application/json".to_string());
            serde_json::to_vec(&intent.body).map_err(|e| e.to_string())?
        };

        let req = HttpRequestParts {
            method: intent.method.clone(),
            url,
            headers,
            body,
        };
        let resp = self
            .http
            .send(req, self.config.call_timeout, self.config.max_response_bytes)
            .await
            .map_err(|e| e.to_string())?;
        if (200..300).contains(&resp.status) {
            Ok(())
        } else {
            Err(format!("HTTP {}", resp.status))
        }
    }
}
