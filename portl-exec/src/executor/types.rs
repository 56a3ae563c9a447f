use std::time::Duration;

use portl_core::expressions::EvalLimits;

use crate::retry::RetryDefaults;

#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Per connector call.
    pub call_timeout: Duration,
    /// Whole run; exceeding it aborts and rolls back.
    pub max_run_time: Option<Duration>,
    pub max_response_bytes: usize,
    /// Rows kept per file read and items kept per batch in dry-run mode.
    pub dry_run_sample_size: usize,
    pub max_batch_items: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_run_time: Some(Duration::from_secs(60 * 60)),
            max_response_bytes: 10 * 1024 * 1024,
            dry_run_sample_size: 3,
            max_batch_items: 100_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryDefaults,
    pub limits: RunLimits,
    pub eval: EvalLimits,
    /// Header carrying `api.call` idempotency keys.
    pub idempotency_header: String,
    pub outbox_table: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryDefaults::default(),
            limits: RunLimits::default(),
            eval: EvalLimits::default(),
            idempotency_header: "Idempotency-Key".to_string(),
            outbox_table: "portl_outbox".to_string(),
        }
    }
}
