//! Per-step execution: conditions, batch expansion, conditional branches,
//! failure policy and dry-run simulation.

use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use portl_core::expressions::value::type_name;
use portl_core::expressions::{is_simulated, is_truthy, simulated, TemplateError};
use portl_core::types::{BatchSpec, ConditionalStep, ConnectionDef, ErrorPolicy, JobDefinition, StepDefinition, StepKind};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connectors::{ConnectionHandle, SqlCommand};
use crate::context::{BatchFrame, ExecutionContext};
use crate::dry_run::{DryRunPlan, PlannedStep};
use crate::error::StepError;
use crate::executor::events::{Event, EventSink};
use crate::executor::render::{prepare, PreparedCall, Renderer, RunIds};
use crate::executor::result::{summarize, FailureReport, StepReport, StepStatus};
use crate::executor::scheduler::Engine;
use crate::executor::worker::Worker;
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::secrets::Redactor;
use crate::transaction::TransactionManager;

/// A failure that ends the run.
#[derive(Debug)]
pub(crate) struct Abort {
    pub report: FailureReport,
    pub error: StepError,
}

/// Where an execution sits: its batch index and whether its result lands in a
/// batch slot.
#[derive(Debug, Clone, Copy)]
struct At {
    idx: Option<usize>,
    batched: bool,
}

enum Cond {
    True,
    False,
    Simulated,
}

/// Mutable state of one run.
pub(crate) struct Run<'e> {
    pub engine: &'e Engine,
    pub job: &'e JobDefinition,
    pub run_id: Uuid,
    pub dry_run: bool,
    pub ctx: ExecutionContext,
    pub tx: TransactionManager,
    /// Connection configs with environment placeholders substituted.
    pub connections: BTreeMap<String, ConnectionDef>,
    /// Connections whose config could not be fully substituted, with the reason.
    pub unusable: BTreeMap<String, String>,
    pub redactor: Redactor,
    pub reports: Vec<StepReport>,
    pub plan: DryRunPlan,
    pub cancel: CancellationToken,
    pub deadline: Option<tokio::time::Instant>,
}

impl<'e> Run<'e> {
    fn events(&self) -> &'e dyn EventSink {
        self.engine.events.as_ref()
    }

    fn at(&self) -> At {
        At {
            idx: self.ctx.index(),
            batched: self.ctx.depth() > 0,
        }
    }

    pub(crate) fn run_step<'a>(&'a mut self, step: &'e StepDefinition) -> BoxFuture<'a, Result<(), Abort>> {
        Box::pin(async move {
            match (&step.kind, &step.batch) {
                (StepKind::Conditional(cond), None) => {
                    let value = self.branch(step, cond).await?;
                    self.ctx.store(&step.id, step.save_as.as_deref(), value);
                    Ok(())
                }
                (StepKind::Conditional(cond), Some(batch)) => self.run_batched_conditional(step, cond, batch).await,
                (_, Some(batch)) => self.run_batched(step, batch).await,
                (_, None) => {
                    let value = self.execute_once(step).await?;
                    self.ctx.store(&step.id, step.save_as.as_deref(), value);
                    Ok(())
                }
            }
        })
    }

    /// Stops the run between executions when it was cancelled or ran out of time.
    pub(crate) async fn checkpoint(&mut self, step: &StepDefinition) -> Result<(), Abort> {
        if self.cancel.is_cancelled() {
            let at = self.at();
            return Err(self.abort(step, at, StepError::Cancelled, 0, None).await);
        }
        if let Some(deadline) = self.deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(self.timed_out(step).await);
            }
        }
        Ok(())
    }

    pub(crate) async fn timed_out(&mut self, step: &StepDefinition) -> Abort {
        let limit = self.engine.config.limits.max_run_time.unwrap_or_default();
        let at = self.at();
        self.abort(step, at, StepError::TimedOut(limit), 0, None).await
    }

    async fn execute_once(&mut self, step: &'e StepDefinition) -> Result<JsonValue, Abort> {
        let at = self.at();
        let Some(mut call) = self.begin(step, at).await? else {
            return Ok(JsonValue::Null);
        };

        if self.dry_run {
            match &mut call {
                PreparedCall::ReadFile(spec) => {
                    let sample = self.engine.config.limits.dry_run_sample_size;
                    spec.limit = Some(spec.limit.map_or(sample, |l| l.min(sample)));
                }
                _ => {
                    let rendered = call.describe(&self.redactor);
                    return Ok(self.simulate(step, at, rendered).await);
                }
            }
        }

        let rendered = call.describe(&self.redactor);
        let outcome = self.dispatch(step, at, &call).await;
        if self.dry_run {
            if let Ok(value) = &outcome.result {
                self.plan.record(PlannedStep {
                    id: step.id.clone(),
                    idx: at.idx,
                    step_type: step.type_name(),
                    operation: Some(rendered.clone()),
                    note: Some(format!("sampled {}", summarize(value))),
                });
            }
        }
        self.settle(step, at, outcome, rendered).await
    }

    /// Announce the execution, evaluate `when` and render the call.
    /// `None` when the condition skipped it.
    async fn begin(&mut self, step: &'e StepDefinition, at: At) -> Result<Option<PreparedCall>, Abort> {
        self.events()
            .emit(Event::StepStarted {
                run_id: self.run_id,
                step_id: step.id.clone(),
                idx: at.idx,
            })
            .await;

        if let Some(when) = &step.when {
            match self.condition(step, when, at) {
                Ok(Cond::False) => {
                    self.skip(step, at, "condition is false").await;
                    return Ok(None);
                }
                Ok(Cond::Simulated) => {
                    self.plan
                        .warn(&step.id, at.idx, "condition depends on a simulated output; planned as if true");
                }
                Ok(Cond::True) => {}
                Err(e) => return Err(self.abort(step, at, e, 0, None).await),
            }
        }

        match self.render(step, at) {
            Ok(call) => Ok(Some(call)),
            Err(e) => Err(self.abort(step, at, e, 0, None).await),
        }
    }

    fn render(&mut self, step: &StepDefinition, at: At) -> Result<PreparedCall, StepError> {
        let ids = RunIds {
            job_id: &self.job.id,
            run_id: self.run_id,
        };
        let mut r = Renderer::new(&self.engine.evaluator, &self.ctx, self.dry_run);
        let call = prepare(step, &self.connections, &self.engine.config, ids, &mut r);
        let unresolved = r.into_unresolved();
        self.warn_unresolved(step, at, unresolved);
        let call = call?;
        if let PreparedCall::Sql {
            command: SqlCommand::OutboxInsert { intent, .. },
            ..
        } = &call
        {
            // Intents sit in the outbox table in plain text.
            if let Some(name) = self.redactor.secret_header(&intent.headers) {
                return Err(StepError::Config(format!(
                    "step '{}': header '{name}' holds a secret and would be stored in the outbox; \
                     set it on the target connection instead",
                    step.id
                )));
            }
            if self.redactor.redact_value(&intent.body) != intent.body {
                return Err(StepError::Config(format!(
                    "step '{}': the outbox body holds a secret and would be stored in plain text",
                    step.id
                )));
            }
        }
        Ok(call)
    }

    fn condition(&mut self, step: &StepDefinition, source: &str, at: At) -> Result<Cond, StepError> {
        let mut r = Renderer::new(&self.engine.evaluator, &self.ctx, self.dry_run);
        let value = r.expression(source)?;
        let unresolved = r.into_unresolved();
        self.warn_unresolved(step, at, unresolved);
        Ok(if is_simulated(&value) {
            Cond::Simulated
        } else if is_truthy(&value) {
            Cond::True
        } else {
            Cond::False
        })
    }

    fn warn_unresolved(&mut self, step: &StepDefinition, at: At, unresolved: Vec<String>) {
        for path in unresolved {
            self.plan.warn(&step.id, at.idx, format!("unresolved reference: {path}"));
        }
    }

    async fn simulate(&mut self, step: &StepDefinition, at: At, rendered: JsonValue) -> JsonValue {
        self.plan.record(PlannedStep {
            id: step.id.clone(),
            idx: at.idx,
            step_type: step.type_name(),
            operation: Some(rendered),
            note: None,
        });
        let mut report = StepReport::new(&step.id, at.idx, StepStatus::Succeeded);
        report.output_summary = Some("simulated".to_string());
        self.reports.push(report);
        self.events()
            .emit(Event::StepSucceeded {
                run_id: self.run_id,
                step_id: step.id.clone(),
                idx: at.idx,
            })
            .await;
        simulated(&step.id)
    }

    async fn skip(&mut self, step: &StepDefinition, at: At, reason: &str) {
        tracing::debug!(step_id = %step.id, idx = ?at.idx, reason, "step skipped");
        if self.dry_run {
            self.plan.record(PlannedStep {
                id: step.id.clone(),
                idx: at.idx,
                step_type: step.type_name(),
                operation: None,
                note: Some(format!("skipped: {reason}")),
            });
        }
        self.reports.push(StepReport::new(&step.id, at.idx, StepStatus::Skipped));
        self.events()
            .emit(Event::StepSkipped {
                run_id: self.run_id,
                step_id: step.id.clone(),
                idx: at.idx,
            })
            .await;
    }

    async fn handle(&mut self, name: &str) -> Result<ConnectionHandle, StepError> {
        if let Some(handle) = self.ctx.connection(name) {
            return Ok(handle.clone());
        }
        if let Some(reason) = self.unusable.get(name) {
            return Err(StepError::Config(format!("connection '{name}': {reason}")));
        }
        let def = self
            .connections
            .get(name)
            .ok_or_else(|| StepError::Config(format!("unknown connection '{name}'")))?;
        let handle = self.engine.resolver.resolve(name, def).await?;
        tracing::debug!(connection = name, kind = handle.kind_name(), "connection resolved");
        self.ctx.cache_connection(name, handle.clone());
        Ok(handle)
    }

    fn policy(&self, step: &StepDefinition) -> RetryPolicy {
        RetryPolicy::for_step(step.retry.as_ref(), &step.kind, &self.engine.config.retry)
    }

    /// Handle for a step without a connection: only `api.call` has one,
    /// through the engine's own HTTP client.
    fn default_handle(&self, step: &StepDefinition) -> Result<ConnectionHandle, StepError> {
        match (&step.kind, &self.engine.http) {
            (StepKind::ApiCall(_), Some(http)) => Ok(ConnectionHandle::Http(http.clone())),
            (StepKind::ApiCall(_), None) => Err(StepError::Config(format!(
                "step '{}' has no connection and the engine has no HTTP client",
                step.id
            ))),
            _ => Err(StepError::Config(format!("step '{}' needs a connection", step.id))),
        }
    }

    async fn dispatch(&mut self, step: &StepDefinition, at: At, call: &PreparedCall) -> RetryOutcome<JsonValue> {
        let handle = match (step.connection.as_deref(), call) {
            (Some(name), _) => self.handle(name).await.map(Some),
            (None, PreparedCall::ReadFile(_)) => Ok(None),
            (None, _) => self.default_handle(step).map(Some),
        };
        let handle = match handle {
            Ok(h) => h,
            Err(e) => return RetryOutcome { result: Err(e), attempts: 0 },
        };

        let policy = self.policy(step);
        let worker = Worker {
            run_id: self.run_id,
            step_id: &step.id,
            idx: at.idx,
            policy: &policy,
            events: self.engine.events.as_ref(),
            cancel: &self.cancel,
            limits: &self.engine.config.limits,
        };
        match (call, handle) {
            (PreparedCall::ReadFile(spec), None) => worker.read(self.engine.files.as_ref(), spec).await,
            (PreparedCall::ReadFile(spec), Some(ConnectionHandle::Files(source))) => {
                worker.read(source.as_ref(), spec).await
            }
            (
                PreparedCall::Sql {
                    connection,
                    command,
                    shape,
                },
                Some(ConnectionHandle::Sql(connector)),
            ) => {
                worker
                    .sql(&mut self.tx, connection, connector.as_ref(), command, shape)
                    .await
            }
            (call, Some(handle)) => worker.external(&handle, call).await,
            (_, None) => RetryOutcome {
                result: Err(StepError::Config(format!("step '{}' needs a connection", step.id))),
                attempts: 0,
            },
        }
    }

    async fn settle(
        &mut self,
        step: &StepDefinition,
        at: At,
        outcome: RetryOutcome<JsonValue>,
        rendered: JsonValue,
    ) -> Result<JsonValue, Abort> {
        match outcome.result {
            Ok(value) => {
                let mut report = StepReport::new(&step.id, at.idx, StepStatus::Succeeded);
                report.attempts = outcome.attempts;
                report.output_summary = Some(self.redactor.redact_str(&summarize(&value)));
                self.reports.push(report);
                self.events()
                    .emit(Event::StepSucceeded {
                        run_id: self.run_id,
                        step_id: step.id.clone(),
                        idx: at.idx,
                    })
                    .await;
                Ok(value)
            }
            Err(err) => self.fail(step, at, err, outcome.attempts, Some(rendered)).await,
        }
    }

    /// A failed execution. DB failures and unrecoverable errors end the run;
    /// other failures only do so under `on_error: halt`.
    async fn fail(
        &mut self,
        step: &StepDefinition,
        at: At,
        err: StepError,
        attempts: u32,
        rendered: Option<JsonValue>,
    ) -> Result<JsonValue, Abort> {
        let fatal = err.always_fatal() || step.kind.is_db() || self.job.on_error == ErrorPolicy::Halt;
        if fatal {
            return Err(self.abort(step, at, err, attempts, rendered).await);
        }

        let failure = self.failure(step, at, &err, attempts, rendered);
        tracing::warn!(step_id = %step.id, idx = ?at.idx, error = %failure.message, "step failed, continuing");
        let slot = if at.batched { failure.marker() } else { JsonValue::Null };
        self.record_failure(step, at, failure).await;
        Ok(slot)
    }

    async fn abort(
        &mut self,
        step: &StepDefinition,
        at: At,
        err: StepError,
        attempts: u32,
        rendered: Option<JsonValue>,
    ) -> Abort {
        let failure = self.failure(step, at, &err, attempts, rendered);
        tracing::error!(step_id = %step.id, idx = ?at.idx, error = %failure.message, "step failed, aborting run");
        self.record_failure(step, at, failure.clone()).await;
        Abort {
            report: failure,
            error: err,
        }
    }

    fn failure(
        &self,
        step: &StepDefinition,
        at: At,
        err: &StepError,
        attempts: u32,
        rendered: Option<JsonValue>,
    ) -> FailureReport {
        let mut failure = FailureReport::from_step_error(&step.id, at.idx, err, attempts, rendered);
        failure.message = self.redactor.redact_str(&failure.message);
        failure
    }

    async fn record_failure(&mut self, step: &StepDefinition, at: At, failure: FailureReport) {
        let message = failure.message.clone();
        let mut report = StepReport::new(&step.id, at.idx, StepStatus::Failed);
        report.attempts = failure.attempts;
        report.rendered = failure.rendered.clone();
        report.error = Some(failure);
        self.reports.push(report);
        self.events()
            .emit(Event::StepFailed {
                run_id: self.run_id,
                step_id: step.id.clone(),
                idx: at.idx,
                error: message,
            })
            .await;
    }

    /// Evaluate `batch.from` into the item list.
    fn batch_items(&mut self, step: &StepDefinition, batch: &BatchSpec, at: At) -> Result<Vec<JsonValue>, StepError> {
        let mut r = Renderer::new(&self.engine.evaluator, &self.ctx, self.dry_run);
        let value = r.expression(&batch.from)?;
        let unresolved = r.into_unresolved();
        self.warn_unresolved(step, at, unresolved);

        let mut items = match value {
            JsonValue::Null => Vec::new(),
            JsonValue::Array(items) => items,
            v if is_simulated(&v) => {
                self.plan
                    .warn(&step.id, at.idx, "batch source is a simulated output; planned for one item");
                vec![v]
            }
            other => {
                return Err(TemplateError::Type(format!(
                    "batch.from must evaluate to a list, got {}",
                    type_name(&other)
                ))
                .into())
            }
        };

        let limits = &self.engine.config.limits;
        if items.len() > limits.max_batch_items {
            return Err(StepError::Config(format!(
                "batch of {} items exceeds the limit of {}",
                items.len(),
                limits.max_batch_items
            )));
        }
        if self.dry_run && items.len() > limits.dry_run_sample_size {
            let total = items.len();
            items.truncate(limits.dry_run_sample_size);
            self.plan.warn(
                &step.id,
                at.idx,
                format!("batch sampled: planned {} of {total} items", items.len()),
            );
        }
        Ok(items)
    }

    async fn items_or_abort(&mut self, step: &StepDefinition, batch: &BatchSpec) -> Result<Vec<JsonValue>, Abort> {
        let at = self.at();
        match self.batch_items(step, batch, at) {
            Ok(items) => Ok(items),
            Err(e) => Err(self.abort(step, at, e, 0, None).await),
        }
    }

    async fn run_batched(&mut self, step: &'e StepDefinition, batch: &'e BatchSpec) -> Result<(), Abort> {
        let items = self.items_or_abort(step, batch).await?;
        let concurrency = batch.concurrency.unwrap_or(1);

        let slots = if concurrency > 1 && step.kind.is_external() && !self.dry_run {
            self.run_concurrent(step, batch, items, concurrency).await?
        } else {
            let mut slots = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                self.checkpoint(step).await?;
                self.ctx.push_frame(frame(batch, index, item));
                let res = self.execute_once(step).await;
                self.ctx.pop_frame();
                slots.push(res?);
            }
            slots
        };

        self.ctx.store(&step.id, step.save_as.as_deref(), JsonValue::Array(slots));
        Ok(())
    }

    /// External calls with up to `concurrency` in flight. Items are rendered in
    /// order first, so the context is never read concurrently; results keep
    /// item order.
    async fn run_concurrent(
        &mut self,
        step: &'e StepDefinition,
        batch: &'e BatchSpec,
        items: Vec<JsonValue>,
        concurrency: usize,
    ) -> Result<Vec<JsonValue>, Abort> {
        let mut slots = vec![JsonValue::Null; items.len()];
        let mut calls = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            self.checkpoint(step).await?;
            self.ctx.push_frame(frame(batch, index, item));
            let at = self.at();
            let prepared = self.begin(step, at).await;
            self.ctx.pop_frame();
            if let Some(call) = prepared? {
                let rendered = call.describe(&self.redactor);
                calls.push((index, call, rendered));
            }
        }
        if calls.is_empty() {
            return Ok(slots);
        }

        let handle = match step.connection.as_deref() {
            Some(name) => self.handle(name).await,
            None => self.default_handle(step),
        };
        let handle = match handle {
            Ok(h) => h,
            Err(err) => {
                for (index, _, rendered) in calls {
                    let at = At { idx: Some(index), batched: true };
                    slots[index] = self.fail(step, at, err.clone(), 0, Some(rendered)).await?;
                }
                return Ok(slots);
            }
        };

        let policy = self.policy(step);
        let base = Worker {
            run_id: self.run_id,
            step_id: &step.id,
            idx: None,
            policy: &policy,
            events: self.engine.events.as_ref(),
            cancel: &self.cancel,
            limits: &self.engine.config.limits,
        };
        let handle = &handle;
        let outcomes: Vec<(usize, JsonValue, RetryOutcome<JsonValue>)> = stream::iter(
            calls.into_iter().map(|(index, call, rendered)| {
                let worker = Worker { idx: Some(index), ..base };
                async move {
                    let outcome = worker.external(handle, &call).await;
                    (index, rendered, outcome)
                }
            }),
        )
        .buffered(concurrency)
        .collect()
        .await;

        self.checkpoint(step).await?;
        for (index, rendered, outcome) in outcomes {
            let at = At { idx: Some(index), batched: true };
            slots[index] = self.settle(step, at, outcome, rendered).await?;
        }
        Ok(slots)
    }

    /// Evaluate the condition, run the chosen branch and return the
    /// conditional's own result.
    async fn branch(&mut self, step: &'e StepDefinition, cond: &'e ConditionalStep) -> Result<JsonValue, Abort> {
        let at = self.at();
        self.events()
            .emit(Event::StepStarted {
                run_id: self.run_id,
                step_id: step.id.clone(),
                idx: at.idx,
            })
            .await;

        let source = step.when.as_deref().unwrap_or("false");
        let choice = match self.condition(step, source, at) {
            Ok(c) => c,
            Err(e) => return Err(self.abort(step, at, e, 0, None).await),
        };
        let (taken, skipped, value): (Vec<&'e [StepDefinition]>, &'e [StepDefinition], JsonValue) = match choice {
            Cond::True => (vec![cond.then.as_slice()], cond.else_steps.as_slice(), json!({ "branch": "then" })),
            Cond::False => (vec![cond.else_steps.as_slice()], cond.then.as_slice(), json!({ "branch": "else" })),
            Cond::Simulated => {
                self.plan
                    .warn(&step.id, at.idx, "condition depends on a simulated output; planned both branches");
                (vec![cond.then.as_slice(), cond.else_steps.as_slice()], &[][..], simulated(&step.id))
            }
        };

        self.skip_all(skipped, at).await;
        for steps in taken {
            for child in steps {
                self.checkpoint(child).await?;
                self.run_step(child).await?;
            }
        }

        let mut report = StepReport::new(&step.id, at.idx, StepStatus::Succeeded);
        report.output_summary = Some(summarize(&value));
        self.reports.push(report);
        self.events()
            .emit(Event::StepSucceeded {
                run_id: self.run_id,
                step_id: step.id.clone(),
                idx: at.idx,
            })
            .await;
        Ok(value)
    }

    /// Steps of the branch not taken, nested ones included, resolve to `null`.
    async fn skip_all(&mut self, steps: &'e [StepDefinition], at: At) {
        let mut stack: Vec<&'e StepDefinition> = steps.iter().rev().collect();
        while let Some(step) = stack.pop() {
            self.ctx.store(&step.id, step.save_as.as_deref(), JsonValue::Null);
            self.skip(step, at, "branch not taken").await;
            let children: Vec<&'e StepDefinition> = step.children().collect();
            stack.extend(children.into_iter().rev());
        }
    }

    /// A conditional over a list. Every nested step ends up with one result
    /// per item (`null` where it did not run).
    async fn run_batched_conditional(
        &mut self,
        step: &'e StepDefinition,
        cond: &'e ConditionalStep,
        batch: &'e BatchSpec,
    ) -> Result<(), Abort> {
        let items = self.items_or_abort(step, batch).await?;
        let n = items.len();
        let nested = descendants(step);
        let mut collected = vec![vec![JsonValue::Null; n]; nested.len()];
        let mut branches = Vec::with_capacity(n);

        for (index, item) in items.into_iter().enumerate() {
            self.checkpoint(step).await?;
            for s in &nested {
                self.ctx.forget(&s.id, s.save_as.as_deref());
            }
            self.ctx.push_frame(frame(batch, index, item));
            let res = self.branch(step, cond).await;
            self.ctx.pop_frame();
            branches.push(res?);
            for (k, s) in nested.iter().enumerate() {
                if let Some(v) = self.ctx.result(&s.id) {
                    collected[k][index] = v.clone();
                }
            }
        }

        for (s, values) in nested.iter().zip(collected) {
            self.ctx.store(&s.id, s.save_as.as_deref(), JsonValue::Array(values));
        }
        self.ctx.store(&step.id, step.save_as.as_deref(), JsonValue::Array(branches));
        Ok(())
    }
}

fn frame(batch: &BatchSpec, index: usize, item: JsonValue) -> BatchFrame {
    BatchFrame {
        source: batch.from.clone(),
        alias: batch.alias.clone(),
        index,
        item,
    }
}

fn descendants(step: &StepDefinition) -> Vec<&StepDefinition> {
    let mut out = Vec::new();
    let mut stack: Vec<&StepDefinition> = step.children().collect();
    stack.reverse();
    while let Some(s) = stack.pop() {
        out.push(s);
        let mut children: Vec<&StepDefinition> = s.children().collect();
        children.reverse();
        stack.extend(children);
    }
    out
}
