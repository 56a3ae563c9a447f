use portl_core::types::FailureKind;
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::dry_run::DryRunPlan;
use crate::error::{ErrorClass, StepError};
use crate::transaction::TransactionStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Committed,
    RolledBack,
    DryRunComplete,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Committed => "committed",
            RunStatus::RolledBack => "rolled_back",
            RunStatus::DryRunComplete => "dry_run_complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Committed | RunStatus::RolledBack | RunStatus::DryRunComplete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

/// Root cause of a failed execution, as shown to users.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FailureReport {
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idx: Option<usize>,
    /// `config`, `template`, `connector`, `retry_exhausted`, ...
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
    pub message: String,
    pub attempts: u32,
    /// Statement or request with secrets redacted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<JsonValue>,
}

impl FailureReport {
    pub fn from_step_error(
        step_id: &str,
        idx: Option<usize>,
        err: &StepError,
        attempts: u32,
        rendered: Option<JsonValue>,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            idx,
            error: err.label(),
            kind: err.failure_kind(),
            class: err.class(),
            message: err.to_string(),
            attempts,
            rendered,
        }
    }

    /// `{"$error": {...}}` marker stored in batch slots of failed items.
    pub fn marker(&self) -> JsonValue {
        serde_json::json!({
            "$error": {
                "kind": self.kind,
                "error": self.error,
                "message": self.message,
                "attempts": self.attempts,
            }
        })
    }
}

/// One execution of a step, or the aggregate of a batched step.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StepReport {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idx: Option<usize>,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReport>,
}

impl StepReport {
    pub fn new(id: &str, idx: Option<usize>, status: StepStatus) -> Self {
        Self {
            id: id.to_string(),
            idx,
            status,
            attempts: 0,
            output_summary: None,
            rendered: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    pub job_id: String,
    pub run_id: Uuid,
    pub status: RunStatus,
    pub steps: Vec<StepReport>,
    pub committed: bool,
    /// The failure that aborted the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<DryRunPlan>,
    pub transaction: TransactionStats,
    /// Final stored result of every step, by id.
    #[serde(skip_serializing)]
    pub outputs: Map<String, JsonValue>,
}

impl RunReport {
    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed)
    }
}

const SUMMARY_MAX: usize = 200;

/// A short human-readable description of a step output.
pub fn summarize(value: &JsonValue) -> String {
    match value {
        JsonValue::Array(items) => format!("{} item(s)", items.len()),
        JsonValue::Object(map) => {
            if let Some(JsonValue::Array(rows)) = map.get("rows") {
                return format!("{} row(s)", rows.len());
            }
            if let Some(status) = map.get("status").and_then(|s| s.as_u64()) {
                return format!("HTTP {status}");
            }
            truncate(value.to_string())
        }
        other => truncate(other.to_string()),
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > SUMMARY_MAX {
        let mut cut = SUMMARY_MAX;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}
