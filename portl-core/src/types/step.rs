use std::collections::BTreeMap;

use crate::types::{AnyValue, ConnectionKind, FailureKind, TemplateMap, TemplateString};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StepDefinition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<TemplateString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,

    #[serde(flatten)]
    pub kind: StepKind,
}

impl StepDefinition {
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Nested steps of a conditional (both branches), empty for every other variant.
    pub fn children(&self) -> impl Iterator<Item = &StepDefinition> {
        let (then, otherwise): (&[StepDefinition], &[StepDefinition]) = match &self.kind {
            StepKind::Conditional(c) => (c.then.as_slice(), c.else_steps.as_slice()),
            _ => (&[], &[]),
        };
        then.iter().chain(otherwise.iter())
    }
}

/// The closed set of step variants.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum StepKind {
    #[serde(rename = "file.read", alias = "csv.read")]
    FileRead(FileReadStep),
    #[serde(rename = "db.upsert")]
    DbUpsert(DbUpsertStep),
    #[serde(rename = "db.insert")]
    DbInsert(DbInsertStep),
    #[serde(rename = "db.update")]
    DbUpdate(DbUpdateStep),
    #[serde(rename = "db.query")]
    DbQuery(DbQueryStep),
    #[serde(rename = "db.query_one")]
    DbQueryOne(DbQueryStep),
    #[serde(rename = "lambda.invoke")]
    LambdaInvoke(LambdaInvokeStep),
    #[serde(rename = "api.call")]
    ApiCall(ApiCallStep),
    #[serde(rename = "outbox.enqueue")]
    OutboxEnqueue(OutboxEnqueueStep),
    #[serde(rename = "conditional")]
    Conditional(ConditionalStep),
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::FileRead(_) => "file.read",
            StepKind::DbUpsert(_) => "db.upsert",
            StepKind::DbInsert(_) => "db.insert",
            StepKind::DbUpdate(_) => "db.update",
            StepKind::DbQuery(_) => "db.query",
            StepKind::DbQueryOne(_) => "db.query_one",
            StepKind::LambdaInvoke(_) => "lambda.invoke",
            StepKind::ApiCall(_) => "api.call",
            StepKind::OutboxEnqueue(_) => "outbox.enqueue",
            StepKind::Conditional(_) => "conditional",
        }
    }

    /// Steps that run statements on the shared transaction.
    pub fn is_db(&self) -> bool {
        matches!(
            self,
            StepKind::DbUpsert(_)
                | StepKind::DbInsert(_)
                | StepKind::DbUpdate(_)
                | StepKind::DbQuery(_)
                | StepKind::DbQueryOne(_)
                | StepKind::OutboxEnqueue(_)
        )
    }

    /// Steps whose side effects live outside the database and cannot be rolled back.
    pub fn is_external(&self) -> bool {
        matches!(self, StepKind::LambdaInvoke(_) | StepKind::ApiCall(_))
    }

    pub fn required_connection_kind(&self) -> Option<ConnectionKind> {
        match self {
            StepKind::FileRead(_) | StepKind::Conditional(_) => None,
            StepKind::LambdaInvoke(_) => Some(ConnectionKind::Lambda),
            StepKind::ApiCall(_) => Some(ConnectionKind::Http),
            _ => Some(ConnectionKind::Postgres),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BatchSpec {
    pub from: TemplateString,

    #[serde(rename = "as")]
    pub alias: String,

    /// Upper bound on in-flight connector calls; honoured for external steps only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Failure kinds worth another attempt. `None` means the engine defaults for the step's family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<FailureKind>>,

    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: default_backoff_ms(),
            retry_on: None,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Csv,
    Jsonl,
    Json,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileReadStep {
    pub path: TemplateString,

    #[serde(default)]
    pub format: FileFormat,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,

    #[serde(default = "default_true")]
    pub has_header: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DbUpsertStep {
    pub table: String,
    /// Conflict target columns.
    pub key: Vec<String>,
    pub mapping: TemplateMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    #[default]
    Fail,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DbInsertStep {
    pub table: String,
    pub mapping: TemplateMap,

    #[serde(default)]
    pub on_conflict: ConflictAction,

    /// Conflict target for `on_conflict: ignore`; any unique violation when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DbUpdateStep {
    pub table: String,
    /// Columns (taken from `mapping`) that select the row(s) to update.
    pub key: Vec<String>,
    pub mapping: TemplateMap,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DbQueryStep {
    /// SQL text. Embedded `{{ expr }}` segments become bound parameters.
    pub query: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<AnyValue>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LambdaInvokeStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<TemplateString>,

    #[serde(default)]
    pub payload: AnyValue,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ApiCallStep {
    #[serde(default = "default_method")]
    pub method: String,

    /// Absolute URL; wins over `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<TemplateString>,

    /// Joined onto the connection's `base_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<TemplateString>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, TemplateString>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: TemplateMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<AnyValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<TemplateString>,

    /// Accepted statuses; any 2xx when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_status: Option<Vec<u16>>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Records a delivery intent inside the shared transaction for the outbox relay.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutboxEnqueueStep {
    /// HTTP connection whose `base_url`/`headers` the relay delivers through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default = "default_post")]
    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<TemplateString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<TemplateString>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, TemplateString>,

    #[serde(default)]
    pub body: AnyValue,

    pub dedup_key: TemplateString,
}

fn default_post() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConditionalStep {
    #[serde(default)]
    pub then: Vec<StepDefinition>,

    #[serde(rename = "else", default, skip_serializing_if = "Vec::is_empty")]
    pub else_steps: Vec<StepDefinition>,
}
