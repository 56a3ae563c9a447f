//! Transactional outbox: `outbox.enqueue` writes intents inside the run's
//! transaction, and [`OutboxRelay`] delivers the committed ones.

mod relay;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub use relay::{OutboxRelay, RelayConfig, RelayStats};

use crate::error::ConnectorError;

/// A delivery recorded by `outbox.enqueue`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutboxIntent {
    /// Unique per intent; a second enqueue with the same key is a no-op.
    /// Sent as the idempotency key on delivery.
    pub dedup_key: String,
    pub job_id: String,
    pub run_id: Uuid,
    pub step_id: String,
    /// HTTP connection the intent was rendered against.
    pub target: Option<String>,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    DeadLetter,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::DeadLetter => "dead_letter",
        }
    }
}

/// A stored intent with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub intent: OutboxIntent,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Persistence used by the relay. Claimed records stay invisible to other
/// relays until they are marked or their lease lapses.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn claim_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, ConnectorError>;

    async fn mark_delivered(&self, id: i64) -> Result<(), ConnectorError>;

    /// Record a failed attempt; the intent stays pending.
    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), ConnectorError>;

    async fn move_to_dead_letter(&self, id: i64, error: &str) -> Result<(), ConnectorError>;
}
