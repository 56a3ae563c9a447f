use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use portl_core::types::ConnectionDef;

use portl_exec::connectors::{HttpClient, ReqwestHttpClient};
use portl_exec::outbox::{OutboxRelay, RelayConfig, RelayStats};
use portl_store::PgOutboxStore;
use tokio_util::sync::CancellationToken;

use crate::exit_codes;
use crate::output::{print_error, print_result, OutputFormat};
use crate::utils::redact_url_password;
use crate::{DatabaseArgs, OutputArgs};

use super::config::{get_database_url, read_job};

pub struct RelayArgs {
    pub once: bool,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub table: String,
    pub call_timeout: Duration,
    pub max_response_bytes: usize,
    pub jobs: Vec<PathBuf>,
}

pub async fn relay_cmd(args: RelayArgs, database: DatabaseArgs, output: OutputArgs) -> i32 {
    if args.max_attempts == 0 || args.batch_size == 0 {
        print_error(output.format, output.quiet, "--max-attempts and --batch-size must be at least 1");
        return exit_codes::VALIDATION_FAILED;
    }
    let mut targets: BTreeMap<String, ConnectionDef> = BTreeMap::new();
    for path in &args.jobs {
        match read_job(path, &output) {
            Ok(parsed) => targets.extend(parsed.job.connections),
            Err(code) => return code,
        }
    }
    let database_url = match get_database_url(database.database_url, &output) {
        Some(v) => v,
        None => return exit_codes::RUNTIME_ERROR,
    };

    let store = match PgOutboxStore::connect(&database_url, database.max_connections).await {
        Ok(s) => s.with_table(args.table),
        Err(e) => {
            print_error(
                output.format,
                output.quiet,
                &format!("failed to connect to {}: {e}", redact_url_password(&database_url)),
            );
            return exit_codes::RUNTIME_ERROR;
        }
    };
    let http: Arc<dyn HttpClient> = match ReqwestHttpClient::new() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            print_error(output.format, output.quiet, &format!("failed to build HTTP client: {e}"));
            return exit_codes::RUNTIME_ERROR;
        }
    };

    let relay = OutboxRelay::new(
        Arc::new(store),
        http,
        RelayConfig {
            max_attempts: args.max_attempts,
            batch_size: args.batch_size,
            call_timeout: args.call_timeout,
            max_response_bytes: args.max_response_bytes,
            poll_interval: args.poll_interval,
            ..RelayConfig::default()
        },
    )
    .with_targets(&targets, std::env::vars().collect());

    let result = if args.once {
        relay.relay_once().await
    } else {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            }
        });
        tracing::info!("outbox relay started");
        relay.run(&cancel).await
    };

    match result {
        Ok(stats) => {
            print_stats(&output, &stats);
            exit_codes::SUCCESS
        }
        Err(e) => {
            print_error(output.format, output.quiet, &format!("outbox relay failed: {e}"));
            exit_codes::RUNTIME_ERROR
        }
    }
}

fn print_stats(output: &OutputArgs, stats: &RelayStats) {
    if output.format == OutputFormat::Text && !output.quiet {
        println!(
            "claimed {}, delivered {}, failed {}, dead-lettered {}",
            stats.claimed, stats.delivered, stats.failed, stats.dead_lettered
        );
    } else {
        print_result(output.format, output.quiet, stats);
    }
}
