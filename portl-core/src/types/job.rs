use std::collections::BTreeMap;

use crate::types::{ConnectionDef, StepDefinition};

/// A parsed job: an ordered step list plus the connection registry it runs against.
///
/// Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JobDefinition {
    #[serde(default = "default_job_id")]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub steps: Vec<StepDefinition>,

    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionDef>,

    #[serde(default)]
    pub transaction: TransactionConfig,

    #[serde(default)]
    pub on_error: ErrorPolicy,
}

fn default_job_id() -> String {
    "job".to_string()
}

impl JobDefinition {
    /// Depth-first walk over every step, nested conditional branches included.
    pub fn walk_steps(&self) -> Vec<&StepDefinition> {
        let mut out = Vec::new();
        for s in &self.steps {
            collect_steps(s, &mut out);
        }
        out
    }

    pub fn find_step(&self, id: &str) -> Option<&StepDefinition> {
        self.walk_steps().into_iter().find(|s| s.id == id)
    }
}

fn collect_steps<'a>(step: &'a StepDefinition, out: &mut Vec<&'a StepDefinition>) {
    out.push(step);
    for child in step.children() {
        collect_steps(child, out);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionScope {
    /// All DB steps share one lazily opened transaction, committed at the end of the run.
    #[default]
    Db,
    /// Every DB statement commits on its own.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct TransactionConfig {
    #[serde(default)]
    pub scope: TransactionScope,
}

/// What happens after a non-DB step fails for good. DB failures always roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    #[default]
    Halt,
    Continue,
}
