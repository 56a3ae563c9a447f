use std::time::Duration;

use clap::Args;

use crate::output::OutputFormat;

#[derive(Debug, Args, Clone)]
pub struct OutputArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,
    #[arg(long, short, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Args, Clone)]
pub struct DatabaseArgs {
    /// Postgres URL holding the outbox table. Falls back to DATABASE_URL.
    #[arg(long, env = "PORTL_DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
    #[arg(long, default_value_t = 5)]
    pub max_connections: u32,
}

#[derive(Debug, Args, Clone)]
pub struct LimitArgs {
    /// Timeout for each connector call (HTTP request, function invoke, SQL statement).
    #[arg(long, default_value_t = 30_000)]
    pub call_timeout_ms: u64,
    /// Abort and roll back runs that take longer; 0 disables the limit.
    #[arg(long, default_value_t = 3600)]
    pub max_run_time_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_response_bytes: usize,
    /// Rows sampled per read and items per batch during a dry run.
    #[arg(long, default_value_t = 3)]
    pub sample_size: usize,
}

impl LimitArgs {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EventsArg {
    /// Lifecycle events go to the log at debug level.
    Log,
    /// Lifecycle events are printed to stdout as JSON lines.
    Stdout,
    None,
}
