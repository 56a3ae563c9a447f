use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod args;
mod cmd;
mod commands;
mod exit_codes;
mod output;
mod utils;

pub use args::*;
use commands::{Command, OutboxCommand};

#[derive(Debug, Parser)]
#[command(name = "portl", version, about = "Run transactional data jobs")]
struct Cli {
    /// Log as JSON lines instead of text. Levels come from RUST_LOG.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {e}");
            std::process::exit(exit_codes::RUNTIME_ERROR);
        }
    };

    let exit_code = rt.block_on(run_command(cli.command));
    std::process::exit(exit_code);
}

/// Logs go to stderr so `--format json` output on stdout stays parseable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_command(command: Command) -> i32 {
    match command {
        Command::Validate { path, output } => cmd::validate::validate_cmd(&path, output).await,
        Command::Run {
            path,
            dry_run,
            seed,
            set_values,
            events,
            limits,
            output,
        } => cmd::run::run_cmd(&path, dry_run, seed.as_deref(), &set_values, events, limits, output).await,
        Command::Outbox {
            command:
                OutboxCommand::Relay {
                    once,
                    batch_size,
                    max_attempts,
                    poll_interval_ms,
                    table,
                    call_timeout_ms,
                    max_response_bytes,
                    jobs,
                    database,
                    output,
                },
        } => {
            let args = cmd::outbox::RelayArgs {
                once,
                batch_size,
                max_attempts,
                poll_interval: Duration::from_millis(poll_interval_ms),
                table,
                call_timeout: Duration::from_millis(call_timeout_ms),
                max_response_bytes,
                jobs,
            };
            cmd::outbox::relay_cmd(args, database, output).await
        }
        Command::Migrate { database, output } => cmd::migrate::migrate_cmd(database, output).await,
    }
}
