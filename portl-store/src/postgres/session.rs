use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use portl_core::types::FailureKind;
use portl_exec::connectors::sql::quote_ident;
use portl_exec::connectors::{Row, SqlCommand, SqlOutcome, SqlSession, SqlStatement};
use portl_exec::ConnectorError;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row as _, Transaction};

use super::classify;

/// Column name to SQL type, per table.
pub(crate) type ColumnTypeCache = Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>;

const COLUMN_TYPES_SQL: &str = r#"
SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
FROM pg_attribute a
WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped
"#;

/// One transaction on a pooled connection.
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
    column_types: ColumnTypeCache,
}

impl PgSession {
    pub(crate) fn new(tx: Transaction<'static, Postgres>, column_types: ColumnTypeCache) -> Self {
        Self { tx, column_types }
    }

    async fn column_types(&mut self, command: &SqlCommand) -> Result<BTreeMap<String, String>, ConnectorError> {
        let table = match command {
            SqlCommand::Upsert { table, .. } | SqlCommand::Insert { table, .. } | SqlCommand::Update { table, .. } => {
                table
            }
            _ => return Ok(BTreeMap::new()),
        };

        let cached = cache(&self.column_types).get(table).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        // Looked up inside the transaction so tables created earlier in the run are visible.
        let rows: Vec<(String, String)> = sqlx::query_as(COLUMN_TYPES_SQL)
            .bind(quote_ident(table))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| classify(&e))?;
        let types: BTreeMap<String, String> = rows.into_iter().collect();
        if !types.is_empty() {
            cache(&self.column_types).insert(table.clone(), types.clone());
        }
        Ok(types)
    }

    async fn simple(&mut self, sql: String) -> Result<(), ConnectorError> {
        sqlx::Executor::execute(&mut *self.tx, sqlx::raw_sql(&sql))
            .await
            .map_err(|e| classify(&e))?;
        Ok(())
    }
}

#[async_trait]
impl SqlSession for PgSession {
    async fn execute(&mut self, command: &SqlCommand) -> Result<SqlOutcome, ConnectorError> {
        let types = self.column_types(command).await?;
        let stmt = command.to_postgres(&types);
        tracing::debug!(sql = %stmt.text, params = stmt.params.len(), "executing statement");

        match row_query(command, &stmt.text) {
            Some(text) => {
                let rows = bind_params(sqlx::query(&text), &stmt)
                    .fetch_all(&mut *self.tx)
                    .await
                    .map_err(|e| classify(&e))?;
                let rows = rows.iter().map(json_row).collect::<Result<Vec<_>, _>>()?;
                Ok(SqlOutcome {
                    affected: rows.len() as u64,
                    rows,
                })
            }
            None => {
                let done = bind_params(sqlx::query(&stmt.text), &stmt)
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|e| classify(&e))?;
                Ok(SqlOutcome {
                    rows: Vec::new(),
                    affected: done.rows_affected(),
                })
            }
        }
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), ConnectorError> {
        self.simple(format!("SAVEPOINT {}", quote_ident(name))).await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), ConnectorError> {
        self.simple(format!("RELEASE SAVEPOINT {}", quote_ident(name))).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), ConnectorError> {
        self.simple(format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name))).await
    }

    async fn commit(self: Box<Self>) -> Result<(), ConnectorError> {
        self.tx.commit().await.map_err(|e| classify(&e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), ConnectorError> {
        self.tx.rollback().await.map_err(|e| classify(&e))
    }
}

fn cache(types: &ColumnTypeCache) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, String>>> {
    types.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Statements that yield rows are wrapped so each row comes back as one
/// `jsonb` value, whatever its column types. Raw queries that return nothing
/// run as-is.
fn row_query(command: &SqlCommand, text: &str) -> Option<String> {
    match command {
        SqlCommand::Query { .. } if !returns_rows(text) => None,
        _ => Some(wrap_rows(text)),
    }
}

fn wrap_rows(text: &str) -> String {
    let body = text.trim().trim_end_matches(';').trim_end();
    format!("WITH portl_rows AS ({body}) SELECT to_jsonb(portl_rows) AS row FROM portl_rows")
}

fn returns_rows(sql: &str) -> bool {
    let lower = sql.trim_start().to_ascii_lowercase();
    let first = lower.split_whitespace().next().unwrap_or("");
    matches!(first, "select" | "with" | "values" | "table")
        || lower.split_whitespace().any(|w| w == "returning")
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    stmt: &SqlStatement,
) -> Query<'q, Postgres, PgArguments> {
    for value in &stmt.params {
        query = if stmt.text_params {
            query.bind(text_param(value))
        } else {
            bind_typed(query, value)
        };
    }
    query
}

/// Text form for parameters the statement casts to the column type.
fn text_param(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn bind_typed<'q>(query: Query<'q, Postgres, PgArguments>, value: &JsonValue) -> Query<'q, Postgres, PgArguments> {
    match value {
        JsonValue::Null => query.bind(None::<String>),
        JsonValue::Bool(b) => query.bind(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => query.bind(s.clone()),
        other => query.bind(sqlx::types::Json(other.clone())),
    }
}

fn json_row(row: &PgRow) -> Result<Row, ConnectorError> {
    let value: JsonValue = row.try_get(0).map_err(|e| classify(&e))?;
    match value {
        JsonValue::Object(map) => Ok(map),
        other => Err(ConnectorError::permanent(
            FailureKind::Data,
            format!("expected a row object, got {other}"),
        )),
    }
}
