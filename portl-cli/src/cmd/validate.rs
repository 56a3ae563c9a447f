use std::path::Path;

use portl_core::Validate;
use serde::Serialize;

use crate::exit_codes;
use crate::output::{print_result, OutputFormat};
use crate::OutputArgs;

use super::config::{job_summary, read_job};

#[derive(Serialize)]
struct ValidateResult {
    valid: bool,
    job_id: String,
    format: String,
    steps: usize,
    connections: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

pub async fn validate_cmd(path: &Path, output: OutputArgs) -> i32 {
    let parsed = match read_job(path, &output) {
        Ok(p) => p,
        Err(code) => return code,
    };
    let (steps, connections) = job_summary(&parsed.job);

    let errors: Vec<String> = match parsed.job.validate() {
        Ok(()) => vec![],
        Err(err) => err.violations.iter().map(|v| v.to_string()).collect(),
    };
    let result = ValidateResult {
        valid: errors.is_empty(),
        job_id: parsed.job.id.clone(),
        format: format!("{:?}", parsed.format),
        steps,
        connections,
        errors,
    };

    if output.format == OutputFormat::Text && !output.quiet {
        if result.valid {
            println!(
                "ok: valid job '{}' ({} step(s), {} connection(s))",
                result.job_id, result.steps, result.connections
            );
        } else {
            eprintln!("error: validation failed");
            for e in &result.errors {
                eprintln!("- {e}");
            }
        }
    } else {
        print_result(output.format, output.quiet, &result);
    }

    if result.valid {
        exit_codes::SUCCESS
    } else {
        exit_codes::VALIDATION_FAILED
    }
}
