//! Dry-run mode: connector calls are replaced by their rendered form.
//!
//! Only file reads touch the outside world (read-only, sampled). Every other
//! call yields a simulated placeholder whose lookups propagate, so later steps
//! can still be rendered.

use serde_json::Value as JsonValue;

/// What a run would have done.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct DryRunPlan {
    pub steps: Vec<PlannedStep>,
    pub warnings: Vec<PlanWarning>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PlannedStep {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idx: Option<usize>,
    #[serde(rename = "type")]
    pub step_type: &'static str,
    /// Redacted statement or request; absent for skipped executions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PlanWarning {
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idx: Option<usize>,
    pub message: String,
}

impl DryRunPlan {
    pub fn record(&mut self, step: PlannedStep) {
        self.steps.push(step);
    }

    pub fn warn(&mut self, step_id: &str, idx: Option<usize>, message: impl Into<String>) {
        let message = message.into();
        let duplicate = self
            .warnings
            .iter()
            .any(|w| w.step_id == step_id && w.idx == idx && w.message == message);
        if !duplicate {
            self.warnings.push(PlanWarning {
                step_id: step_id.to_string(),
                idx,
                message,
            });
        }
    }

    /// Planned executions that would have reached a connector.
    pub fn operations(&self) -> impl Iterator<Item = &PlannedStep> {
        self.steps.iter().filter(|s| s.operation.is_some())
    }
}
