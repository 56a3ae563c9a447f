use std::path::PathBuf;

use clap::Subcommand;

use crate::args::*;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse and validate a job definition without running it.
    Validate {
        path: PathBuf,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Run a job. All database writes commit together or not at all.
    Run {
        path: PathBuf,
        /// Render every step and read sampled input, but write nothing and call nothing.
        #[arg(long)]
        dry_run: bool,
        /// JSON or YAML object used as the run seed.
        #[arg(long)]
        seed: Option<PathBuf>,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set_values: Vec<String>,
        #[arg(long, value_enum, default_value_t = EventsArg::Log)]
        events: EventsArg,
        #[command(flatten)]
        limits: LimitArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Work with the transactional outbox.
    Outbox {
        #[command(subcommand)]
        command: OutboxCommand,
    },
    /// Create or upgrade the outbox table.
    Migrate {
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Debug, Subcommand)]
pub enum OutboxCommand {
    /// Deliver committed outbox intents until interrupted.
    Relay {
        /// Relay one batch and exit.
        #[arg(long)]
        once: bool,
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        /// Delivery attempts before an intent is dead-lettered.
        #[arg(long, default_value_t = 5)]
        max_attempts: u32,
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,
        #[arg(long, default_value = "portl_outbox")]
        table: String,
        #[arg(long, default_value_t = 30_000)]
        call_timeout_ms: u64,
        #[arg(long, default_value_t = 1024 * 1024)]
        max_response_bytes: usize,
        /// Job files whose connections intents name as `target`; their
        /// headers are added at delivery. Repeatable.
        #[arg(long = "job", value_name = "PATH")]
        jobs: Vec<PathBuf>,
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
}
