use portl_exec::{RunReport, RunStatus};

/// Exit codes for CI/automation.
pub const SUCCESS: i32 = 0;
/// The job failed to parse or validate, or the run was rejected before it started.
pub const VALIDATION_FAILED: i32 = 2;
/// The run started and rolled back, or a dry run stopped on an error.
pub const RUN_FAILED: i32 = 3;
/// Anything environmental: unreadable files, no database, no runtime.
pub const RUNTIME_ERROR: i32 = 4;

pub fn for_report(report: &RunReport) -> i32 {
    match (report.status, &report.error) {
        (RunStatus::Committed, _) => SUCCESS,
        (RunStatus::DryRunComplete, None) => SUCCESS,
        _ => RUN_FAILED,
    }
}
