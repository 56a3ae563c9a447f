//! Turns a step payload into a concrete connector call.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use portl_core::expressions::value::to_text as to_text_value;
use portl_core::expressions::{Evaluator, Scope, Segment, TemplateError};
use portl_core::types::{
    AnyValue, ApiCallStep, ConnectionDef, FileReadStep, OutboxEnqueueStep, StepDefinition, StepKind,
};
use serde_json::{json, Map, Value as JsonValue};
use uuid::Uuid;

use crate::connectors::{string_map, HttpRequestParts, ReadSpec, SqlCommand, SqlOutcome};
use crate::error::{ConnectorError, StepError};
use crate::executor::types::EngineConfig;
use crate::outbox::OutboxIntent;
use crate::secrets::Redactor;

/// How a statement's result becomes the step output.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlShape {
    /// The returned row, `null` when none (`db.upsert`, `db.insert`).
    Row,
    /// `{affected, rows}` (`db.update`).
    Update,
    /// `{rows, count}` (`db.query`).
    Rows,
    /// First row or `null` (`db.query_one`).
    One,
    /// `{enqueued, dedup_key}` (`outbox.enqueue`).
    Outbox { dedup_key: String },
}

impl SqlShape {
    pub fn apply(&self, outcome: &SqlOutcome) -> JsonValue {
        match self {
            SqlShape::Row | SqlShape::One => outcome.first(),
            SqlShape::Update => json!({ "affected": outcome.affected, "rows": outcome.rows }),
            SqlShape::Rows => json!({ "rows": outcome.rows, "count": outcome.rows.len() }),
            SqlShape::Outbox { dedup_key } => {
                json!({ "enqueued": !outcome.rows.is_empty() || outcome.affected > 0, "dedup_key": dedup_key })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpCall {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<JsonValue>,
    pub expect_status: Option<Vec<u16>>,
}

impl HttpCall {
    pub fn to_request(&self) -> Result<HttpRequestParts, StepError> {
        let url = url::Url::parse(&self.url).map_err(|e| StepError::Config(format!("invalid url '{}': {e}", self.url)))?;
        let mut headers = self.headers.clone();
        let body = match &self.body {
            None | Some(JsonValue::Null) => Vec::new(),
            Some(JsonValue::String(text)) => text.clone().into_bytes(),
            Some(other) => {
                if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                    headers.insert("content-type".to_string(), "application/json".to_string());
                }
                serde_json::to_vec(other).map_err(|e| StepError::Config(e.to_string()))?
            }
        };
        Ok(HttpRequestParts {
            method: self.method.clone(),
            url,
            headers,
            body,
        })
    }

    pub fn accepts(&self, status: u16) -> bool {
        match &self.expect_status {
            Some(list) => list.contains(&status),
            None => (200..300).contains(&status),
        }
    }
}

/// A rendered step, ready for its connector.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedCall {
    ReadFile(ReadSpec),
    Sql {
        connection: String,
        command: SqlCommand,
        shape: SqlShape,
    },
    Function {
        connection: String,
        function: String,
        payload: JsonValue,
    },
    Http {
        /// `None` for an absolute `url` sent through the engine's own client.
        connection: Option<String>,
        call: HttpCall,
    },
}

impl PreparedCall {
    /// Diagnostic form of the call with secrets scrubbed.
    pub fn describe(&self, redactor: &Redactor) -> JsonValue {
        let raw = match self {
            PreparedCall::ReadFile(spec) => json!({
                "read": spec.path.display().to_string(),
                "format": spec.format,
                "limit": spec.limit,
            }),
            PreparedCall::Sql { connection, command, .. } => {
                let stmt = command.to_postgres(&BTreeMap::new());
                json!({ "connection": connection, "statement": stmt.text, "params": stmt.params })
            }
            PreparedCall::Function {
                connection,
                function,
                payload,
            } => json!({ "connection": connection, "function": function, "payload": payload }),
            PreparedCall::Http { connection, call } => json!({
                "connection": connection,
                "method": call.method,
                "url": call.url,
                "headers": redactor.redact_header_map(&call.headers),
                "body": call.body,
            }),
        };
        redactor.redact_value(&raw)
    }
}

/// Identity of the run, stamped into outbox intents.
#[derive(Debug, Clone, Copy)]
pub struct RunIds<'a> {
    pub job_id: &'a str,
    pub run_id: Uuid,
}

/// Renders payload templates against the run context. In collecting mode
/// (dry-run) unresolved references become `null` and are remembered.
pub struct Renderer<'a> {
    evaluator: &'a Evaluator,
    scope: &'a dyn Scope,
    collect: bool,
    unresolved: Vec<String>,
}

impl<'a> Renderer<'a> {
    pub fn new(evaluator: &'a Evaluator, scope: &'a dyn Scope, collect: bool) -> Self {
        Self {
            evaluator,
            scope,
            collect,
            unresolved: Vec::new(),
        }
    }

    pub fn into_unresolved(self) -> Vec<String> {
        self.unresolved
    }

    fn absorb(&mut self, unresolved: Vec<String>) {
        for path in unresolved {
            if !self.unresolved.contains(&path) {
                self.unresolved.push(path);
            }
        }
    }

    pub fn value(&mut self, value: &AnyValue) -> Result<JsonValue, TemplateError> {
        if self.collect {
            let rendered = self.evaluator.render_value_collecting(value, self.scope)?;
            self.absorb(rendered.unresolved);
            Ok(rendered.value)
        } else {
            self.evaluator.render_value(value, self.scope)
        }
    }

    /// A bare expression or `{{ }}` template (conditions, batch sources).
    pub fn expression(&mut self, source: &str) -> Result<JsonValue, TemplateError> {
        if self.collect {
            let rendered = self.evaluator.evaluate_collecting(source, self.scope)?;
            self.absorb(rendered.unresolved);
            Ok(rendered.value)
        } else {
            self.evaluator.evaluate(source, self.scope)
        }
    }

    pub fn text(&mut self, template: &str) -> Result<String, TemplateError> {
        let value = self.value(&JsonValue::String(template.to_string()))?;
        Ok(to_text_value(&value))
    }

    fn row(&mut self, mapping: &BTreeMap<String, AnyValue>) -> Result<Map<String, JsonValue>, TemplateError> {
        let mut row = Map::new();
        for (col, template) in mapping {
            row.insert(col.clone(), self.value(template)?);
        }
        Ok(row)
    }

    fn headers(&mut self, headers: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>, TemplateError> {
        let mut out = BTreeMap::new();
        for (name, template) in headers {
            out.insert(name.clone(), self.text(template)?);
        }
        Ok(out)
    }

    /// SQL text with each `{{ expr }}` and `${ENV}` replaced by the next `$n`
    /// parameter, after the explicit `params`.
    pub fn query(&mut self, query: &str, params: &[AnyValue]) -> Result<(String, Vec<JsonValue>), TemplateError> {
        let mut bound = params.iter().map(|p| self.value(p)).collect::<Result<Vec<_>, _>>()?;
        let template = self.evaluator.template(query)?;
        let mut sql = String::with_capacity(query.len());
        for seg in &template.segments {
            match seg {
                Segment::Literal(text) => sql.push_str(text),
                Segment::Expr { source, expr } => {
                    let value = if self.collect {
                        self.expression(source)?
                    } else {
                        self.evaluator.eval_expr(expr, self.scope)?
                    };
                    bound.push(value);
                    let _ = write!(sql, "${}", bound.len());
                }
                Segment::Env { name, default } => {
                    let value = match self.scope.env_var(name).or_else(|| default.clone()) {
                        Some(v) => JsonValue::String(v),
                        None if self.collect => {
                            self.absorb(vec![format!("env.{name}")]);
                            JsonValue::Null
                        }
                        None => {
                            return Err(TemplateError::UnresolvedReference {
                                path: format!("env.{name}"),
                            })
                        }
                    };
                    bound.push(value);
                    let _ = write!(sql, "${}", bound.len());
                }
            }
        }
        Ok((sql, bound))
    }
}

/// Render `step` into a call. `connections` carries env-substituted configs.
pub fn prepare(
    step: &StepDefinition,
    connections: &BTreeMap<String, ConnectionDef>,
    config: &EngineConfig,
    ids: RunIds<'_>,
    r: &mut Renderer<'_>,
) -> Result<PreparedCall, StepError> {
    let connection = || {
        step.connection
            .clone()
            .ok_or_else(|| StepError::Config(format!("step '{}' needs a connection", step.id)))
    };

    let call = match &step.kind {
        StepKind::FileRead(read) => PreparedCall::ReadFile(read_spec(read, r)?),
        StepKind::DbUpsert(s) => PreparedCall::Sql {
            connection: connection()?,
            command: SqlCommand::Upsert {
                table: s.table.clone(),
                key: s.key.clone(),
                row: r.row(&s.mapping)?,
            },
            shape: SqlShape::Row,
        },
        StepKind::DbInsert(s) => PreparedCall::Sql {
            connection: connection()?,
            command: SqlCommand::Insert {
                table: s.table.clone(),
                row: r.row(&s.mapping)?,
                on_conflict: s.on_conflict,
                conflict_key: s.conflict_key.clone(),
            },
            shape: SqlShape::Row,
        },
        StepKind::DbUpdate(s) => PreparedCall::Sql {
            connection: connection()?,
            command: SqlCommand::Update {
                table: s.table.clone(),
                key: s.key.clone(),
                row: r.row(&s.mapping)?,
            },
            shape: SqlShape::Update,
        },
        StepKind::DbQuery(q) | StepKind::DbQueryOne(q) => {
            let (sql, params) = r.query(&q.query, &q.params)?;
            let shape = if matches!(step.kind, StepKind::DbQueryOne(_)) {
                SqlShape::One
            } else {
                SqlShape::Rows
            };
            PreparedCall::Sql {
                connection: connection()?,
                command: SqlCommand::Query { sql, params },
                shape,
            }
        }
        StepKind::LambdaInvoke(s) => {
            let connection = connection()?;
            let function = match &s.function {
                Some(template) => r.text(template)?,
                None => connections
                    .get(&connection)
                    .and_then(|def| def.config_str("function_name"))
                    .map(str::to_string)
                    .ok_or_else(|| {
                        StepError::Config(format!(
                            "step '{}': no 'function' given and connection '{connection}' has no function_name",
                            step.id
                        ))
                    })?,
            };
            PreparedCall::Function {
                connection,
                function,
                payload: r.value(&s.payload)?,
            }
        }
        StepKind::ApiCall(s) => {
            let connection = match (&step.connection, &s.url) {
                (Some(name), _) => Some(name.clone()),
                (None, Some(_)) => None,
                (None, None) => Some(connection()?),
            };
            let def = connection.as_ref().and_then(|name| connections.get(name));
            PreparedCall::Http {
                call: api_call(step, s, def, config, r)?,
                connection,
            }
        }
        StepKind::OutboxEnqueue(s) => {
            let connection = connection()?;
            let intent = outbox_intent(step, s, connections, ids, r)?;
            PreparedCall::Sql {
                connection,
                shape: SqlShape::Outbox {
                    dedup_key: intent.dedup_key.clone(),
                },
                command: SqlCommand::OutboxInsert {
                    table: config.outbox_table.clone(),
                    intent,
                },
            }
        }
        StepKind::Conditional(_) => {
            return Err(StepError::Config(format!(
                "step '{}': conditionals have no connector call",
                step.id
            )))
        }
    };
    Ok(call)
}

fn read_spec(read: &FileReadStep, r: &mut Renderer<'_>) -> Result<ReadSpec, StepError> {
    let delimiter = match read.delimiter.as_deref() {
        None => b',',
        Some("\\t") | Some("\t") => b'\t',
        Some(d) if d.len() == 1 => d.as_bytes()[0],
        Some(d) => return Err(StepError::Config(format!("delimiter must be a single byte, got '{d}'"))),
    };
    Ok(ReadSpec {
        path: PathBuf::from(r.text(&read.path)?),
        format: read.format,
        delimiter,
        has_header: read.has_header,
        limit: read.limit,
    })
}

fn api_call(
    step: &StepDefinition,
    s: &ApiCallStep,
    def: Option<&ConnectionDef>,
    config: &EngineConfig,
    r: &mut Renderer<'_>,
) -> Result<HttpCall, StepError> {
    let mut url = target_url(&step.id, s.url.as_deref(), s.path.as_deref(), def, r)?;
    if !s.query.is_empty() {
        let mut qs = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &s.query {
            let value = r.value(v)?;
            match value {
                JsonValue::Null => {}
                JsonValue::Array(items) => {
                    for item in items {
                        qs.append_pair(k, &to_text_value(&item));
                    }
                }
                other => {
                    qs.append_pair(k, &to_text_value(&other));
                }
            }
        }
        let qs = qs.finish();
        if !qs.is_empty() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&qs);
        }
    }

    let mut headers = def.map(|d| string_map(d.config.get("headers"))).unwrap_or_default();
    headers.extend(r.headers(&s.headers)?);
    if let Some(key) = &s.idempotency_key {
        headers.insert(config.idempotency_header.clone(), r.text(key)?);
    }

    let body = match &s.body {
        Some(body) => Some(r.value(body)?),
        None => None,
    };

    Ok(HttpCall {
        method: s.method.to_ascii_uppercase(),
        url,
        headers,
        body,
        expect_status: s.expect_status.clone(),
    })
}

fn outbox_intent(
    step: &StepDefinition,
    s: &OutboxEnqueueStep,
    connections: &BTreeMap<String, ConnectionDef>,
    ids: RunIds<'_>,
    r: &mut Renderer<'_>,
) -> Result<OutboxIntent, StepError> {
    let def = s.target.as_ref().and_then(|t| connections.get(t));
    let url = target_url(&step.id, s.url.as_deref(), s.path.as_deref(), def, r)?;
    // Only the step's own headers are stored; the relay adds the target
    // connection's headers when it delivers.
    let headers = r.headers(&s.headers)?;
    Ok(OutboxIntent {
        dedup_key: r.text(&s.dedup_key)?,
        job_id: ids.job_id.to_string(),
        run_id: ids.run_id,
        step_id: step.id.clone(),
        target: s.target.clone(),
        method: s.method.to_ascii_uppercase(),
        url,
        headers,
        body: r.value(&s.body)?,
    })
}

/// Absolute `url`, or `path` joined onto the connection's `base_url`.
fn target_url(
    step_id: &str,
    url: Option<&str>,
    path: Option<&str>,
    def: Option<&ConnectionDef>,
    r: &mut Renderer<'_>,
) -> Result<String, StepError> {
    if let Some(url) = url {
        return Ok(r.text(url)?);
    }
    let Some(path) = path else {
        return Err(StepError::Config(format!("step '{step_id}' needs 'url' or 'path'")));
    };
    let path = r.text(path)?;
    let base = def
        .and_then(|d| d.config_str("base_url"))
        .ok_or_else(|| StepError::Config(format!("step '{step_id}': 'path' needs a connection with base_url")))?;
    Ok(format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/')))
}

/// Classify a response the call does not accept.
pub fn status_error(call: &HttpCall, status: u16, retry_after: Option<std::time::Duration>) -> ConnectorError {
    let message = format!("{} {} returned HTTP {status}", call.method, call.url);
    match portl_core::types::FailureKind::from_http_status(status) {
        Some(kind) => ConnectorError::new(kind, message).with_retry_after(retry_after),
        None => ConnectorError::permanent(portl_core::types::FailureKind::Other, message),
    }
}
