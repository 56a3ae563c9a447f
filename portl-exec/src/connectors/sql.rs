//! Database commands produced by the DB step variants, and their Postgres text.
//!
//! Values never end up in SQL text: every rendered value is a bound parameter.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use portl_core::types::ConflictAction;
use serde_json::{Map, Value as JsonValue};

use crate::outbox::OutboxIntent;

pub type Row = Map<String, JsonValue>;

/// A fully rendered database operation.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SqlCommand {
    Upsert {
        table: String,
        key: Vec<String>,
        row: Row,
    },
    Insert {
        table: String,
        row: Row,
        on_conflict: ConflictAction,
        conflict_key: Vec<String>,
    },
    Update {
        table: String,
        key: Vec<String>,
        row: Row,
    },
    /// Raw SQL with `$n` placeholders.
    Query { sql: String, params: Vec<JsonValue> },
    OutboxInsert { table: String, intent: OutboxIntent },
}

impl SqlCommand {
    pub fn table(&self) -> Option<&str> {
        match self {
            SqlCommand::Upsert { table, .. }
            | SqlCommand::Insert { table, .. }
            | SqlCommand::Update { table, .. }
            | SqlCommand::OutboxInsert { table, .. } => Some(table),
            SqlCommand::Query { .. } => None,
        }
    }

    /// Postgres text for this command. `column_types` maps column names of the
    /// target table to their SQL type, used to cast the text parameters.
    pub fn to_postgres(&self, column_types: &BTreeMap<String, String>) -> SqlStatement {
        match self {
            SqlCommand::Upsert { table, key, row } => {
                let mut stmt = insert_prefix(table, row, column_types);
                let updates: Vec<&String> = row.keys().filter(|c| !key.contains(c)).collect();
                let set = if updates.is_empty() {
                    // Still a no-op update so RETURNING yields the existing row.
                    key.iter().take(1).map(|c| assign_excluded(c)).collect::<Vec<_>>()
                } else {
                    updates.into_iter().map(|c| assign_excluded(c)).collect()
                };
                let _ = write!(
                    stmt.text,
                    " ON CONFLICT ({}) DO UPDATE SET {} RETURNING *, (xmax = 0) AS was_inserted",
                    ident_list(key),
                    set.join(", ")
                );
                stmt
            }
            SqlCommand::Insert {
                table,
                row,
                on_conflict,
                conflict_key,
            } => {
                let mut stmt = insert_prefix(table, row, column_types);
                if *on_conflict == ConflictAction::Ignore {
                    if conflict_key.is_empty() {
                        stmt.text.push_str(" ON CONFLICT DO NOTHING");
                    } else {
                        let _ = write!(stmt.text, " ON CONFLICT ({}) DO NOTHING", ident_list(conflict_key));
                    }
                }
                stmt.text.push_str(" RETURNING *");
                stmt
            }
            SqlCommand::Update { table, key, row } => {
                let mut params = Vec::new();
                let mut set = Vec::new();
                for (col, value) in row.iter().filter(|(c, _)| !key.contains(c)) {
                    params.push(value.clone());
                    set.push(format!("{} = {}", quote_ident(col), placeholder(params.len(), col, column_types)));
                }
                let mut filter = Vec::new();
                for col in key {
                    params.push(row.get(col).cloned().unwrap_or(JsonValue::Null));
                    filter.push(format!("{} = {}", quote_ident(col), placeholder(params.len(), col, column_types)));
                }
                if set.is_empty() {
                    set = key.iter().take(1).map(|c| format!("{0} = {0}", quote_ident(c))).collect();
                }
                SqlStatement {
                    text: format!(
                        "UPDATE {} SET {} WHERE {} RETURNING *",
                        quote_ident(table),
                        set.join(", "),
                        filter.join(" AND ")
                    ),
                    params,
                    text_params: true,
                }
            }
            SqlCommand::Query { sql, params } => SqlStatement {
                text: sql.clone(),
                params: params.clone(),
                text_params: false,
            },
            SqlCommand::OutboxInsert { table, intent } => SqlStatement {
                text: format!(
                    "INSERT INTO {} (dedup_key, job_id, run_id, step_id, target, method, url, headers, body) \
                     VALUES ($1, $2, $3::uuid, $4, $5, $6, $7, $8::jsonb, $9::jsonb) \
                     ON CONFLICT (dedup_key) DO NOTHING RETURNING id",
                    quote_ident(table)
                ),
                params: vec![
                    JsonValue::String(intent.dedup_key.clone()),
                    JsonValue::String(intent.job_id.clone()),
                    JsonValue::String(intent.run_id.to_string()),
                    JsonValue::String(intent.step_id.clone()),
                    intent.target.clone().map(JsonValue::String).unwrap_or(JsonValue::Null),
                    JsonValue::String(intent.method.clone()),
                    JsonValue::String(intent.url.clone()),
                    // jsonb columns take JSON text, so a string body stays a JSON string.
                    JsonValue::String(serde_json::to_value(&intent.headers).unwrap_or_default().to_string()),
                    JsonValue::String(intent.body.to_string()),
                ],
                text_params: true,
            },
        }
    }
}

/// SQL text plus positional parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SqlStatement {
    pub text: String,
    pub params: Vec<JsonValue>,
    /// Bind every parameter as text and let the SQL casts convert. When false,
    /// parameters are bound with their JSON type.
    #[serde(skip)]
    pub text_params: bool,
}

/// What a statement returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlOutcome {
    pub rows: Vec<Row>,
    pub affected: u64,
}

impl SqlOutcome {
    pub fn first(&self) -> JsonValue {
        self.rows
            .first()
            .cloned()
            .map(JsonValue::Object)
            .unwrap_or(JsonValue::Null)
    }
}

fn insert_prefix(table: &str, row: &Row, column_types: &BTreeMap<String, String>) -> SqlStatement {
    let cols: Vec<&String> = row.keys().collect();
    let values: Vec<String> = cols
        .iter()
        .enumerate()
        .map(|(i, c)| placeholder(i + 1, c, column_types))
        .collect();
    SqlStatement {
        text: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            values.join(", ")
        ),
        params: row.values().cloned().collect(),
        text_params: true,
    }
}

fn placeholder(n: usize, column: &str, column_types: &BTreeMap<String, String>) -> String {
    match column_types.get(column) {
        Some(ty) => format!("${n}::{ty}"),
        None => format!("${n}"),
    }
}

fn assign_excluded(col: &str) -> String {
    let q = quote_ident(col);
    format!("{q} = EXCLUDED.{q}")
}

fn ident_list(cols: &[String]) -> String {
    cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

/// Double-quote each dot-separated part of an identifier.
pub fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}
