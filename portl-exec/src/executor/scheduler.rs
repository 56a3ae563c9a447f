use std::collections::BTreeMap;
use std::sync::Arc;

use portl_core::expressions::Evaluator;
use portl_core::types::{is_reserved_name, ConnectionDef, JobDefinition};
use portl_core::validate_job_with;
use serde_json::{Map, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connectors::{ConnectionResolver, FileRowSource, HttpClient, ReqwestHttpClient, RowSource};
use crate::context::ExecutionContext;
use crate::dry_run::DryRunPlan;
use crate::error::{RunError, StepError};
use crate::executor::events::{Event, EventSink, NoOpEventSink};
use crate::executor::result::{FailureReport, RunReport, RunStatus};
use crate::executor::step_runner::{Abort, Run};
use crate::executor::types::EngineConfig;
use crate::secrets::Redactor;
use crate::transaction::TransactionManager;

/// Step id used in reports for failures of the final commit.
pub const COMMIT_STEP: &str = "<commit>";

/// Runs jobs: one sequential pass over the steps, a lazily opened shared
/// transaction for DB steps, and a commit or rollback at the end.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) resolver: Arc<dyn ConnectionResolver>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) files: Arc<dyn RowSource>,
    pub(crate) http: Option<Arc<dyn HttpClient>>,
    pub(crate) evaluator: Evaluator,
    env: Option<BTreeMap<String, String>>,
}

impl Engine {
    pub fn new(config: EngineConfig, resolver: Arc<dyn ConnectionResolver>) -> Self {
        let evaluator = Evaluator::new(config.eval);
        Self {
            config,
            resolver,
            events: Arc::new(NoOpEventSink),
            files: Arc::new(FileRowSource::new()),
            http: ReqwestHttpClient::new()
                .ok()
                .map(|client| Arc::new(client) as Arc<dyn HttpClient>),
            evaluator,
            env: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Source for `file.read` steps without a connection.
    pub fn with_files(mut self, files: Arc<dyn RowSource>) -> Self {
        self.files = files;
        self
    }

    /// Client for `api.call` steps that give an absolute `url` and no
    /// connection. Defaults to a plain reqwest client.
    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Use a fixed environment instead of the process environment.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn run(
        &self,
        job: &JobDefinition,
        seed: Map<String, JsonValue>,
        dry_run: bool,
    ) -> Result<RunReport, RunError> {
        self.run_with_cancel(job, seed, dry_run, CancellationToken::new()).await
    }

    /// Like [`Engine::run`]; cancelling `cancel` stops the run at the next
    /// step, batch item or retry wait and rolls it back.
    pub async fn run_with_cancel(
        &self,
        job: &JobDefinition,
        seed: Map<String, JsonValue>,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Result<RunReport, RunError> {
        validate_job_with(job, &self.config.eval)?;
        if let Some(key) = seed.keys().find(|k| is_reserved_name(k)) {
            return Err(RunError::Config(format!("seed key '{key}' is a reserved name")));
        }

        let env = self.env.clone().unwrap_or_else(|| std::env::vars().collect());
        let mut run = self.start(job, seed, env, dry_run, cancel);
        tracing::info!(run_id = %run.run_id, job_id = %job.id, dry_run, "run started");
        self.events
            .emit(Event::RunStarted {
                run_id: run.run_id,
                job_id: job.id.clone(),
                dry_run,
            })
            .await;

        let mut abort = None;
        for step in &job.steps {
            if let Err(a) = run.checkpoint(step).await {
                abort = Some(a);
                break;
            }
            let res = match run.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, run.run_step(step)).await,
                None => Ok(run.run_step(step).await),
            };
            let res = match res {
                Ok(r) => r,
                Err(_) => Err(run.timed_out(step).await),
            };
            if let Err(a) = res {
                abort = Some(a);
                break;
            }
        }

        let report = finish(&mut run, abort).await;
        tracing::info!(run_id = %report.run_id, status = report.status.as_str(), "run finished");
        self.events
            .emit(Event::RunFinished {
                run_id: report.run_id,
                status: report.status,
            })
            .await;
        Ok(report)
    }

    fn start<'e>(
        &'e self,
        job: &'e JobDefinition,
        seed: Map<String, JsonValue>,
        env: BTreeMap<String, String>,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Run<'e> {
        let ctx = ExecutionContext::new(seed, env);

        let mut connections = BTreeMap::new();
        let mut unusable = BTreeMap::new();
        for (name, def) in &job.connections {
            let raw = JsonValue::Object(def.config.clone().into_iter().collect());
            let config = match self.evaluator.render_value_collecting(&raw, &ctx) {
                Ok(rendered) => {
                    if !rendered.unresolved.is_empty() {
                        unusable.insert(name.clone(), format!("unresolved: {}", rendered.unresolved.join(", ")));
                    }
                    match rendered.value {
                        JsonValue::Object(map) => map.into_iter().collect(),
                        _ => def.config.clone(),
                    }
                }
                Err(e) => {
                    unusable.insert(name.clone(), e.to_string());
                    def.config.clone()
                }
            };
            connections.insert(name.clone(), ConnectionDef { kind: def.kind, config });
        }

        let redactor = Redactor::for_run(connections.values(), ctx.env());
        Run {
            engine: self,
            job,
            run_id: Uuid::new_v4(),
            dry_run,
            ctx,
            tx: TransactionManager::new(job.transaction.scope),
            connections,
            unusable,
            redactor,
            reports: Vec::new(),
            plan: DryRunPlan::default(),
            cancel,
            deadline: self
                .config
                .limits
                .max_run_time
                .map(|limit| tokio::time::Instant::now() + limit),
        }
    }
}

/// Commit or roll back, then assemble the report.
async fn finish(run: &mut Run<'_>, abort: Option<Abort>) -> RunReport {
    let events = run.engine.events.clone();
    let (status, error) = match abort {
        Some(abort) => {
            if !run.dry_run {
                rollback(run, events.as_ref(), &abort.report.message).await;
            }
            let status = if run.dry_run {
                RunStatus::DryRunComplete
            } else {
                RunStatus::RolledBack
            };
            (status, Some(abort.report))
        }
        None if run.dry_run => (RunStatus::DryRunComplete, None),
        None => match run.tx.commit().await {
            Ok(opened) => {
                if opened {
                    events.emit(Event::TransactionCommitted { run_id: run.run_id }).await;
                }
                (RunStatus::Committed, None)
            }
            Err(e) => {
                let message = run.redactor.redact_str(&e.to_string());
                tracing::error!(run_id = %run.run_id, error = %message, "commit failed");
                events
                    .emit(Event::TransactionRolledBack {
                        run_id: run.run_id,
                        reason: message.clone(),
                    })
                    .await;
                let err = StepError::Transaction(message);
                (
                    RunStatus::RolledBack,
                    Some(FailureReport::from_step_error(COMMIT_STEP, None, &err, 1, None)),
                )
            }
        },
    };

    RunReport {
        job_id: run.job.id.clone(),
        run_id: run.run_id,
        status,
        steps: std::mem::take(&mut run.reports),
        committed: status == RunStatus::Committed,
        error,
        plan: run.dry_run.then(|| std::mem::take(&mut run.plan)),
        transaction: run.tx.stats(),
        outputs: run.ctx.results(),
    }
}

async fn rollback(run: &mut Run<'_>, events: &dyn EventSink, reason: &str) {
    match run.tx.rollback().await {
        Ok(false) => {}
        Ok(true) => {
            events
                .emit(Event::TransactionRolledBack {
                    run_id: run.run_id,
                    reason: reason.to_string(),
                })
                .await;
        }
        Err(e) => {
            // The session is gone either way; the server discards the transaction.
            tracing::error!(run_id = %run.run_id, error = %e, "rollback failed");
            events
                .emit(Event::TransactionRolledBack {
                    run_id: run.run_id,
                    reason: format!("{reason} (rollback failed: {e})"),
                })
                .await;
        }
    }
}
