use portl_exec::{DryRunPlan, RunReport, StepReport};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn print_result<T: Serialize>(format: OutputFormat, quiet: bool, result: &T) {
    if quiet {
        return;
    }
    let rendered = match format {
        OutputFormat::Text => serde_json::to_string_pretty(result),
        OutputFormat::Json => serde_json::to_string(result),
    };
    if let Ok(json) = rendered {
        println!("{json}");
    }
}

pub fn print_error(format: OutputFormat, quiet: bool, message: &str) {
    if quiet {
        return;
    }
    match format {
        OutputFormat::Text => eprintln!("error: {message}"),
        OutputFormat::Json => {
            let err = serde_json::json!({ "error": message });
            eprintln!("{}", serde_json::to_string(&err).unwrap_or_default());
        }
    }
}

pub fn print_report(format: OutputFormat, quiet: bool, report: &RunReport) {
    if format == OutputFormat::Json {
        print_result(format, quiet, report);
        return;
    }
    if quiet {
        return;
    }

    println!("run {} (job {}): {}", report.run_id, report.job_id, report.status.as_str());
    for step in &report.steps {
        println!("  {}", step_line(step));
    }
    if let Some(plan) = &report.plan {
        print_plan(plan);
    }
    let tx = &report.transaction;
    println!(
        "transaction: {} begin(s), {} commit(s), {} rollback(s), {} savepoint(s)",
        tx.begins, tx.commits, tx.rollbacks, tx.savepoints
    );
    if let Some(err) = &report.error {
        let at = match err.idx {
            Some(idx) => format!("{}[{idx}]", err.step_id),
            None => err.step_id.clone(),
        };
        eprintln!("error: {at} failed ({}): {}", err.error, err.message);
        if let Some(rendered) = &err.rendered {
            eprintln!("  rendered: {rendered}");
        }
    }
}

fn step_line(step: &StepReport) -> String {
    let id = match step.idx {
        Some(idx) => format!("{}[{idx}]", step.id),
        None => step.id.clone(),
    };
    let status = serde_json::to_value(step.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let mut line = format!("{id:<24} {status:<10}");
    if step.attempts > 1 {
        line.push_str(&format!(" attempts={}", step.attempts));
    }
    if let Some(summary) = &step.output_summary {
        line.push(' ');
        line.push_str(summary);
    }
    line
}

fn print_plan(plan: &DryRunPlan) {
    println!("plan:");
    for step in &plan.steps {
        let id = match step.idx {
            Some(idx) => format!("{}[{idx}]", step.id),
            None => step.id.clone(),
        };
        match &step.operation {
            Some(op) => println!("  {id} {} {op}", step.step_type),
            None => println!("  {id} {} (skipped)", step.step_type),
        }
    }
    for warning in &plan.warnings {
        let at = match warning.idx {
            Some(idx) => format!("{}[{idx}]", warning.step_id),
            None => warning.step_id.clone(),
        };
        println!("warning: {at}: {}", warning.message);
    }
}
