use std::time::Duration;

use portl_core::expressions::TemplateError;
use portl_core::types::FailureKind;
use portl_core::ValidationError;

/// Whether another attempt could plausibly succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    /// Default class for a failure kind when the connector has no better information.
    pub fn of(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout
            | FailureKind::Network
            | FailureKind::Http429
            | FailureKind::Http5xx
            | FailureKind::DbConnection
            | FailureKind::DbSerialization
            | FailureKind::DbDeadlock
            | FailureKind::DbLockTimeout => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

/// A classified failure reported by a connector.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ConnectorError {
    pub kind: FailureKind,
    pub class: ErrorClass,
    pub message: String,
    /// Server-provided hint (HTTP `Retry-After`).
    pub retry_after: Option<Duration>,
}

impl ConnectorError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            class: ErrorClass::of(kind),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            ..Self::new(kind, message)
        }
    }

    pub fn with_retry_after(mut self, delay: Option<Duration>) -> Self {
        self.retry_after = delay;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// Why a single step execution failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("config error: {0}")]
    Config(String),
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    RetryExhausted { attempts: u32, last: ConnectorError },
    #[error("run cancelled")]
    Cancelled,
    #[error("run timed out after {0:?}")]
    TimedOut(Duration),
}

impl StepError {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            StepError::Connector(e) | StepError::RetryExhausted { last: e, .. } => Some(e.kind),
            _ => None,
        }
    }

    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            StepError::Connector(e) | StepError::RetryExhausted { last: e, .. } => Some(e.class),
            _ => None,
        }
    }

    /// Failures that abort the run regardless of `on_error`.
    pub fn always_fatal(&self) -> bool {
        matches!(
            self,
            StepError::Config(_)
                | StepError::Template(_)
                | StepError::Transaction(_)
                | StepError::Cancelled
                | StepError::TimedOut(_)
        )
    }

    /// Short machine-readable label for reports.
    pub fn label(&self) -> &'static str {
        match self {
            StepError::Config(_) => "config",
            StepError::Template(_) => "template",
            StepError::Connector(_) => "connector",
            StepError::Transaction(_) => "transaction",
            StepError::RetryExhausted { .. } => "retry_exhausted",
            StepError::Cancelled => "cancelled",
            StepError::TimedOut(_) => "timed_out",
        }
    }
}

/// Errors that prevent a run from starting at all. Failures during a run are
/// reported inside the `RunReport` instead.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid job: {0}")]
    Invalid(#[from] ValidationError),
    #[error("config error: {0}")]
    Config(String),
}
