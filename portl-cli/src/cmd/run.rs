use std::path::Path;
use std::sync::Arc;

use portl_core::Validate;
use portl_exec::connectors::{DefaultResolver, FileRowSource, HttpClient, ReqwestHttpClient};
use portl_exec::executor::{EventSink, NoOpEventSink, StdoutEventSink, TracingEventSink};
use portl_exec::{Engine, RunError};
use portl_store::PgConnectorFactory;
use tokio_util::sync::CancellationToken;

use crate::exit_codes;
use crate::output::{print_error, print_report};
use crate::{EventsArg, LimitArgs, OutputArgs};

use super::config::{build_engine_config, job_dir, load_seed, merge_set_values, read_job};

#[allow(clippy::too_many_arguments)]
pub async fn run_cmd(
    path: &Path,
    dry_run: bool,
    seed_path: Option<&Path>,
    set_values: &[String],
    events: EventsArg,
    limits: LimitArgs,
    output: OutputArgs,
) -> i32 {
    let parsed = match read_job(path, &output) {
        Ok(p) => p,
        Err(code) => return code,
    };
    if let Err(err) = parsed.job.validate() {
        print_error(output.format, output.quiet, "job validation failed");
        if !output.quiet {
            for v in &err.violations {
                eprintln!("- {v}");
            }
        }
        return exit_codes::VALIDATION_FAILED;
    }

    let mut seed = match load_seed(seed_path, &output) {
        Ok(s) => s,
        Err(code) => return code,
    };
    if let Err(code) = merge_set_values(&mut seed, set_values, &output) {
        return code;
    }

    let http: Arc<dyn HttpClient> = match ReqwestHttpClient::new() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            print_error(output.format, output.quiet, &format!("failed to build HTTP client: {e}"));
            return exit_codes::RUNTIME_ERROR;
        }
    };
    let sql = Arc::new(PgConnectorFactory::new(limits.call_timeout()));
    let resolver = DefaultResolver::new(http.clone())
        .with_sql(sql)
        .with_limits(limits.call_timeout(), limits.max_response_bytes);

    let sink: Arc<dyn EventSink> = match events {
        EventsArg::Log => Arc::new(TracingEventSink),
        EventsArg::Stdout => Arc::new(StdoutEventSink),
        EventsArg::None => Arc::new(NoOpEventSink),
    };
    let engine = Engine::new(build_engine_config(&limits), Arc::new(resolver))
        .with_events(sink)
        .with_files(Arc::new(FileRowSource::with_base_dir(job_dir(path))))
        .with_http(http);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; rolling back");
            on_signal.cancel();
        }
    });

    let result = engine.run_with_cancel(&parsed.job, seed, dry_run, cancel).await;
    signal_task.abort();

    match result {
        Ok(report) => {
            print_report(output.format, output.quiet, &report);
            exit_codes::for_report(&report)
        }
        Err(RunError::Invalid(err)) => {
            print_error(output.format, output.quiet, &err.to_string());
            exit_codes::VALIDATION_FAILED
        }
        Err(RunError::Config(message)) => {
            print_error(output.format, output.quiet, &message);
            exit_codes::VALIDATION_FAILED
        }
    }
}
