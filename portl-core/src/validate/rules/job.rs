use std::collections::{BTreeSet, HashMap};

use crate::types::{ConnectionKind, JobDefinition, StepDefinition, TransactionScope};
use crate::validate::rules::{step, templates};
use crate::validate::validator::{Validator, ID_RE};

/// Everything a step rule needs to know about the rest of the job.
pub(crate) struct JobContext<'a> {
    pub job: &'a JobDefinition,
    pub step_ids: BTreeSet<&'a str>,
}

pub(crate) fn validate_job(v: &mut Validator, job: &JobDefinition) {
    if job.id.trim().is_empty() {
        v.push("$.id", "must not be empty");
    } else if !ID_RE.is_match(&job.id) {
        v.push("$.id", "must match ^[A-Za-z0-9_\\-]+$");
    }

    if job.steps.is_empty() {
        v.push("$.steps", "must contain at least one step");
    }

    for (name, conn) in &job.connections {
        let path = format!("$.connections.{name}");
        if !ID_RE.is_match(name) {
            v.push(&path, "connection name must match ^[A-Za-z0-9_\\-]+$");
        }
        for (key, value) in &conn.config {
            templates::validate_env_only(v, &format!("{path}.config.{key}"), value);
        }
    }

    let located = located_steps(&job.steps, "$.steps");

    let mut seen_ids: HashMap<&str, &str> = HashMap::new();
    let mut seen_save_as: HashMap<&str, &str> = HashMap::new();
    for (path, s) in &located {
        if let Some(first) = seen_ids.insert(s.id.as_str(), path.as_str()) {
            v.push(format!("{path}.id"), format!("duplicate step id '{}' (first defined at {first})", s.id));
        }
        if let Some(save_as) = &s.save_as {
            if let Some(first) = seen_save_as.insert(save_as.as_str(), path.as_str()) {
                v.push(format!("{path}.save_as"), format!("duplicate save_as '{save_as}' (first defined at {first})"));
            }
        }
    }

    let ctx = JobContext {
        job,
        step_ids: located.iter().map(|(_, s)| s.id.as_str()).collect(),
    };
    for (path, s) in &located {
        step::validate_step(v, s, path, &ctx);
    }

    if job.transaction.scope == TransactionScope::Db {
        validate_single_db_connection(v, job, &located);
    }
}

/// With one shared transaction, every DB step must talk to the same database.
fn validate_single_db_connection(v: &mut Validator, job: &JobDefinition, located: &[(String, &StepDefinition)]) {
    let names: BTreeSet<&str> = located
        .iter()
        .filter(|(_, s)| s.kind.is_db())
        .filter_map(|(_, s)| s.connection.as_deref())
        .filter(|name| {
            job.connections
                .get(*name)
                .map(|c| c.kind == ConnectionKind::Postgres)
                .unwrap_or(false)
        })
        .collect();
    if names.len() > 1 {
        let list = names.into_iter().collect::<Vec<_>>().join(", ");
        v.push(
            "$.transaction.scope",
            format!("scope 'db' requires every DB step to use one connection, found: {list}"),
        );
    }
}

/// Depth-first list of `(json path, step)`, nested branches included.
fn located_steps<'a>(steps: &'a [StepDefinition], prefix: &str) -> Vec<(String, &'a StepDefinition)> {
    let mut out = Vec::new();
    for (i, s) in steps.iter().enumerate() {
        let path = format!("{prefix}[{i}]");
        if let crate::types::StepKind::Conditional(c) = &s.kind {
            out.push((path.clone(), s));
            out.extend(located_steps(&c.then, &format!("{path}.then")));
            out.extend(located_steps(&c.else_steps, &format!("{path}.else")));
        } else {
            out.push((path, s));
        }
    }
    out
}
