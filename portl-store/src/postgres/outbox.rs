use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use portl_exec::connectors::sql::quote_ident;
use portl_exec::outbox::{OutboxIntent, OutboxRecord, OutboxStatus, OutboxStore};
use portl_exec::ConnectorError;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    dedup_key: String,
    job_id: String,
    run_id: Uuid,
    step_id: String,
    target: Option<String>,
    method: String,
    url: String,
    headers: sqlx::types::Json<BTreeMap<String, String>>,
    body: Option<JsonValue>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        OutboxRecord {
            id: row.id,
            intent: OutboxIntent {
                dedup_key: row.dedup_key,
                job_id: row.job_id,
                run_id: row.run_id,
                step_id: row.step_id,
                target: row.target,
                method: row.method,
                url: row.url,
                headers: row.headers.0,
                body: row.body.unwrap_or(JsonValue::Null),
            },
            status: parse_status(&row.status),
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
            last_error: row.last_error,
        }
    }
}

fn parse_status(s: &str) -> OutboxStatus {
    match s {
        "delivered" => OutboxStatus::Delivered,
        "dead_letter" => OutboxStatus::DeadLetter,
        _ => OutboxStatus::Pending,
    }
}

/// Outbox table access for the relay. Claims take a lease instead of holding
/// row locks, so several relays can drain one table and a crashed relay's
/// claims come back once the lease lapses.
pub struct PgOutboxStore {
    pool: PgPool,
    table: String,
    lease: Duration,
    retry_delay: Duration,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: "portl_outbox".to_string(),
            lease: Duration::from_secs(60),
            retry_delay: Duration::from_secs(5),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Base delay before a failed intent is claimable again; doubles per attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Pending intents whose lease is free, oldest first.
    pub async fn claim(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let table = quote_ident(&self.table);
        let sql = format!(
            r#"
WITH picked AS (
  SELECT id FROM {table}
  WHERE status = 'pending' AND (leased_until IS NULL OR leased_until <= now())
  ORDER BY id
  FOR UPDATE SKIP LOCKED
  LIMIT $1
)
UPDATE {table} o
SET leased_until = now() + make_interval(secs => $2)
FROM picked WHERE o.id = picked.id
RETURNING o.id, o.dedup_key, o.job_id, o.run_id, o.step_id, o.target, o.method, o.url,
          o.headers, o.body, o.status, o.attempts, o.last_error
            "#
        );

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(self.lease.as_secs_f64())
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut records: Vec<OutboxRecord> = rows.into_iter().map(OutboxRecord::from).collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    pub async fn delivered(&self, id: i64) -> Result<(), StoreError> {
        let sql = format!(
            r#"
UPDATE {} SET status = 'delivered', attempts = attempts + 1, last_error = NULL,
              leased_until = NULL, delivered_at = now()
WHERE id = $1
            "#,
            quote_ident(&self.table)
        );
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let sql = format!(
            r#"
UPDATE {} SET attempts = attempts + 1, last_error = $2,
              leased_until = now() + make_interval(secs => $3 * power(2, LEAST(attempts, 10)))
WHERE id = $1
            "#,
            quote_ident(&self.table)
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(error)
            .bind(self.retry_delay.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn dead_letter(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let sql = format!(
            r#"
UPDATE {} SET status = 'dead_letter', attempts = attempts + 1, last_error = $2,
              leased_until = NULL, dead_lettered_at = now()
WHERE id = $1
            "#,
            quote_ident(&self.table)
        );
        sqlx::query(&sql).bind(id).bind(error).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, ConnectorError> {
        Ok(self.claim(limit).await?)
    }

    async fn mark_delivered(&self, id: i64) -> Result<(), ConnectorError> {
        Ok(self.delivered(id).await?)
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), ConnectorError> {
        Ok(self.failed(id, error).await?)
    }

    async fn move_to_dead_letter(&self, id: i64, error: &str) -> Result<(), ConnectorError> {
        Ok(self.dead_letter(id, error).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_become_records() {
        let run_id = Uuid::new_v4();
        let row = OutboxRow {
            id: 9,
            dedup_key: "order-7".to_string(),
            job_id: "orders".to_string(),
            run_id,
            step_id: "announce".to_string(),
            target: Some("hooks".to_string()),
            method: "POST".to_string(),
            url: "https://hooks.example.com/orders/7".to_string(),
            headers: sqlx::types::Json(BTreeMap::from([("X-Tenant".to_string(), "acme".to_string())])),
            body: None,
            status: "dead_letter".to_string(),
            attempts: 5,
            last_error: Some("HTTP 500".to_string()),
        };

        let record = OutboxRecord::from(row);

        assert_eq!(record.id, 9);
        assert_eq!(record.status, OutboxStatus::DeadLetter);
        assert_eq!(record.attempts, 5);
        assert_eq!(record.intent.run_id, run_id);
        assert_eq!(record.intent.headers["X-Tenant"], "acme");
        assert_eq!(record.intent.body, json!(null));
    }

    #[test]
    fn unknown_status_reads_as_pending() {
        assert_eq!(parse_status("pending"), OutboxStatus::Pending);
        assert_eq!(parse_status("delivered"), OutboxStatus::Delivered);
        assert_eq!(parse_status("weird"), OutboxStatus::Pending);
    }
}
