use std::collections::BTreeSet;
use std::time::Duration;

use portl_core::types::{FailureKind, RetrySpec, StepKind};

use crate::error::{ConnectorError, ErrorClass};

/// Engine-wide retry defaults, used when a step's `retry` block leaves them out.
#[derive(Debug, Clone)]
pub struct RetryDefaults {
    pub external: Vec<FailureKind>,
    pub db: Vec<FailureKind>,
    pub max_delay: Duration,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            external: FailureKind::DEFAULT_EXTERNAL.to_vec(),
            db: FailureKind::DEFAULT_DB.to_vec(),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// The resolved retry policy for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub retry_on: BTreeSet<FailureKind>,
    /// `retry_on` came from the job rather than the defaults. An explicit list
    /// also retries failures the connector classified as permanent.
    pub explicit: bool,
    pub jitter: bool,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn for_step(spec: Option<&RetrySpec>, kind: &StepKind, defaults: &RetryDefaults) -> Self {
        let spec = spec.cloned().unwrap_or_default();
        let family = if kind.is_db() { &defaults.db } else { &defaults.external };
        let (retry_on, explicit) = match spec.retry_on {
            Some(list) => (list.into_iter().collect(), true),
            None => (family.iter().copied().collect(), false),
        };
        Self {
            max_attempts: spec.max_attempts.max(1),
            backoff: Duration::from_millis(spec.backoff_ms),
            retry_on,
            explicit,
            jitter: spec.jitter,
            max_delay: defaults.max_delay,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
            retry_on: BTreeSet::new(),
            explicit: false,
            jitter: false,
            max_delay: Duration::ZERO,
        }
    }

    pub fn retries(&self, err: &ConnectorError) -> bool {
        if err.kind.is_never_retryable() || !self.retry_on.contains(&err.kind) {
            return false;
        }
        self.explicit || err.class == ErrorClass::Transient
    }
}
