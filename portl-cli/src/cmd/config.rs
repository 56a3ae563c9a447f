use std::path::Path;
use std::time::Duration;

use portl_core::{parse_job_str, DocumentFormat, JobDefinition, ParseError, ParsedJob};
use portl_exec::EngineConfig;
use serde_json::{Map, Value as JsonValue};

use crate::exit_codes;
use crate::output::print_error;
use crate::{LimitArgs, OutputArgs};

/// Read and parse a job file, printing the failure and returning the exit code on error.
pub fn read_job(path: &Path, output: &OutputArgs) -> Result<ParsedJob, i32> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        print_error(output.format, output.quiet, &format!("failed to read {}: {e}", path.display()));
        exit_codes::RUNTIME_ERROR
    })?;

    parse_job_str(&content, DocumentFormat::from_path(path)).map_err(|e| {
        let message = match e {
            ParseError::Json(e) => format!("JSON parse failed: {e}"),
            ParseError::Yaml(e) => format!("YAML parse failed: {e}"),
            ParseError::UnknownFormat => "input is neither valid JSON nor valid YAML".to_string(),
        };
        print_error(output.format, output.quiet, &message);
        exit_codes::VALIDATION_FAILED
    })
}

/// The `--seed` file, if any, must hold an object.
pub fn load_seed(path: Option<&Path>, output: &OutputArgs) -> Result<Map<String, JsonValue>, i32> {
    let Some(path) = path else {
        return Ok(Map::new());
    };
    let fail = |message: String| {
        print_error(output.format, output.quiet, &message);
        exit_codes::RUNTIME_ERROR
    };

    let content = std::fs::read_to_string(path).map_err(|e| fail(format!("failed to read seed: {e}")))?;
    let value: JsonValue = serde_json::from_str(&content)
        .or_else(|_| serde_yaml::from_str(&content))
        .map_err(|_| fail("seed file is neither valid JSON nor YAML".to_string()))?;
    match value {
        JsonValue::Object(map) => Ok(map),
        JsonValue::Null => Ok(Map::new()),
        _ => Err(fail("seed file must contain an object".to_string())),
    }
}

/// `--set key=value` entries override seed keys; values stay strings.
pub fn merge_set_values(seed: &mut Map<String, JsonValue>, set_values: &[String], output: &OutputArgs) -> Result<(), i32> {
    for s in set_values {
        match s.split_once('=') {
            Some((k, v)) if !k.is_empty() => {
                seed.insert(k.to_string(), JsonValue::String(v.to_string()));
            }
            _ => {
                print_error(output.format, output.quiet, &format!("invalid --set '{s}', expected KEY=VALUE"));
                return Err(exit_codes::VALIDATION_FAILED);
            }
        }
    }
    Ok(())
}

pub fn build_engine_config(limits: &LimitArgs) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.limits.call_timeout = limits.call_timeout();
    config.limits.max_run_time = match limits.max_run_time_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    config.limits.max_response_bytes = limits.max_response_bytes;
    config.limits.dry_run_sample_size = limits.sample_size;
    config
}

/// Directory that relative file paths in `job` resolve against.
pub fn job_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

pub fn get_database_url(explicit: Option<String>, output: &OutputArgs) -> Option<String> {
    match explicit.or_else(|| std::env::var("DATABASE_URL").ok()) {
        Some(v) => Some(v),
        None => {
            print_error(
                output.format,
                output.quiet,
                "missing database url (use --database-url or set PORTL_DATABASE_URL / DATABASE_URL)",
            );
            None
        }
    }
}

pub fn job_summary(job: &JobDefinition) -> (usize, usize) {
    (job.steps.len(), job.connections.len())
}
