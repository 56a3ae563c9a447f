use std::sync::Mutex;

use async_trait::async_trait;
use portl_core::types::FailureKind;
use serde_json::json;
use uuid::Uuid;

use crate::executor::result::RunStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RunStarted {
        run_id: Uuid,
        job_id: String,
        dry_run: bool,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
        idx: Option<usize>,
    },
    StepSucceeded {
        run_id: Uuid,
        step_id: String,
        idx: Option<usize>,
    },
    StepSkipped {
        run_id: Uuid,
        step_id: String,
        idx: Option<usize>,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        idx: Option<usize>,
        error: String,
    },
    StepRetryScheduled {
        run_id: Uuid,
        step_id: String,
        idx: Option<usize>,
        delay_ms: u64,
        kind: FailureKind,
    },
    AttemptStarted {
        run_id: Uuid,
        step_id: String,
        idx: Option<usize>,
        attempt_no: u32,
    },
    AttemptFinished {
        run_id: Uuid,
        step_id: String,
        idx: Option<usize>,
        attempt_no: u32,
        succeeded: bool,
    },
    TransactionCommitted {
        run_id: Uuid,
    },
    TransactionRolledBack {
        run_id: Uuid,
        reason: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "run.started",
            Event::RunFinished { .. } => "run.finished",
            Event::StepStarted { .. } => "step.started",
            Event::StepSucceeded { .. } => "step.succeeded",
            Event::StepSkipped { .. } => "step.skipped",
            Event::StepFailed { .. } => "step.failed",
            Event::StepRetryScheduled { .. } => "step.retry_scheduled",
            Event::AttemptStarted { .. } => "attempt.started",
            Event::AttemptFinished { .. } => "attempt.finished",
            Event::TransactionCommitted { .. } => "transaction.committed",
            Event::TransactionRolledBack { .. } => "transaction.rolled_back",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut out = match self {
            Event::RunStarted { run_id, job_id, dry_run } => {
                json!({ "run_id": run_id.to_string(), "job_id": job_id, "dry_run": dry_run })
            }
            Event::RunFinished { run_id, status } => {
                json!({ "run_id": run_id.to_string(), "status": status.as_str() })
            }
            Event::StepStarted { run_id, step_id, idx }
            | Event::StepSucceeded { run_id, step_id, idx }
            | Event::StepSkipped { run_id, step_id, idx } => {
                json!({ "run_id": run_id.to_string(), "step_id": step_id, "idx": idx })
            }
            Event::StepFailed { run_id, step_id, idx, error } => {
                json!({ "run_id": run_id.to_string(), "step_id": step_id, "idx": idx, "error": error })
            }
            Event::StepRetryScheduled { run_id, step_id, idx, delay_ms, kind } => {
                json!({ "run_id": run_id.to_string(), "step_id": step_id, "idx": idx, "delay_ms": delay_ms, "kind": kind })
            }
            Event::AttemptStarted { run_id, step_id, idx, attempt_no } => {
                json!({ "run_id": run_id.to_string(), "step_id": step_id, "idx": idx, "attempt_no": attempt_no })
            }
            Event::AttemptFinished { run_id, step_id, idx, attempt_no, succeeded } => {
                json!({ "run_id": run_id.to_string(), "step_id": step_id, "idx": idx, "attempt_no": attempt_no, "succeeded": succeeded })
            }
            Event::TransactionCommitted { run_id } => json!({ "run_id": run_id.to_string() }),
            Event::TransactionRolledBack { run_id, reason } => {
                json!({ "run_id": run_id.to_string(), "reason": reason })
            }
        };
        if let Some(obj) = out.as_object_mut() {
            obj.insert("type".to_string(), json!(self.name()));
        }
        out
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

pub struct CompositeEventSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl Default for CompositeEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

#[async_trait]
impl EventSink for CompositeEventSink {
    async fn emit(&self, event: Event) {
        for sink in &self.sinks {
            sink.emit(event.clone()).await;
        }
    }
}

/// JSON lines on stdout.
pub struct StdoutEventSink;

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn emit(&self, event: Event) {
        println!("{}", serde_json::to_string(&event.to_json()).unwrap_or_default());
    }
}

/// Forwards events to `tracing` under the `portl::events` target.
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: Event) {
        match &event {
            Event::StepFailed { .. } | Event::TransactionRolledBack { .. } => {
                tracing::warn!(target: "portl::events", event = event.name(), payload = %event.to_json());
            }
            Event::AttemptStarted { .. } | Event::AttemptFinished { .. } => {
                tracing::debug!(target: "portl::events", event = event.name(), payload = %event.to_json());
            }
            _ => {
                tracing::info!(target: "portl::events", event = event.name(), payload = %event.to_json());
            }
        }
    }
}

pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: Event) {}
}

/// Keeps every event in memory; handy for embedding and tests.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
