use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ValidationError, Violation};
use crate::expressions::EvalLimits;
use crate::types::JobDefinition;

use super::rules;

pub(crate) static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("valid"));
pub(crate) static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid"));
pub(crate) static SQL_IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid")
});

pub struct Validator {
    violations: Vec<Violation>,
    limits: EvalLimits,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(EvalLimits::default())
    }
}

impl Validator {
    pub fn new(limits: EvalLimits) -> Self {
        Self {
            violations: Vec::new(),
            limits,
        }
    }

    pub fn finish(self) -> Result<(), ValidationError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(self.violations))
        }
    }

    pub fn validate_job(&mut self, job: &JobDefinition) {
        rules::job::validate_job(self, job);
    }

    pub(crate) fn limits(&self) -> &EvalLimits {
        &self.limits
    }

    pub(crate) fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation::new(path, message));
    }

    /// `save_as` keys and batch aliases become root names in expressions.
    pub(crate) fn validate_binding_name(&mut self, path: &str, name: &str) {
        if crate::types::is_reserved_name(name) {
            self.push(path, format!("'{name}' is reserved"));
        } else if !NAME_RE.is_match(name) {
            self.push(path, "must be an identifier ([A-Za-z_][A-Za-z0-9_]*)");
        }
    }

    pub(crate) fn validate_sql_ident(&mut self, path: &str, ident: &str) {
        if !SQL_IDENT_RE.is_match(ident) {
            self.push(path, format!("'{ident}' is not a valid SQL identifier"));
        }
    }
}
