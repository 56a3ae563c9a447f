use crate::types::{ConnectionKind, StepDefinition, StepKind, TemplateMap};
use crate::validate::rules::job::JobContext;
use crate::validate::rules::templates;
use crate::validate::validator::{Validator, ID_RE};

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

pub(crate) fn validate_step(v: &mut Validator, step: &StepDefinition, path: &str, ctx: &JobContext<'_>) {
    if step.id.trim().is_empty() {
        v.push(format!("{path}.id"), "must not be empty");
    } else if !ID_RE.is_match(&step.id) {
        v.push(format!("{path}.id"), "must match ^[A-Za-z0-9_\\-]+$");
    }

    if let Some(save_as) = &step.save_as {
        v.validate_binding_name(&format!("{path}.save_as"), save_as);
    }

    validate_connection(v, step, path, ctx);

    if let Some(batch) = &step.batch {
        if batch.from.trim().is_empty() {
            v.push(format!("{path}.batch.from"), "must not be empty");
        }
        if batch.alias.trim().is_empty() {
            v.push(format!("{path}.batch.as"), "must not be empty");
        } else {
            v.validate_binding_name(&format!("{path}.batch.as"), &batch.alias);
        }
        if batch.concurrency == Some(0) {
            v.push(format!("{path}.batch.concurrency"), "must be at least 1");
        }
    }

    if let Some(retry) = &step.retry {
        if matches!(step.kind, StepKind::Conditional(_)) {
            v.push(format!("{path}.retry"), "conditional steps cannot be retried");
        }
        if retry.max_attempts < 1 {
            v.push(format!("{path}.retry.max_attempts"), "must be at least 1");
        }
        for (i, kind) in retry.retry_on.iter().flatten().enumerate() {
            if kind.is_never_retryable() {
                v.push(
                    format!("{path}.retry.retry_on[{i}]"),
                    format!("'{kind}' failures are deterministic and can never be retried"),
                );
            }
        }
    }

    validate_payload(v, step, path);
    templates::validate_step_templates(v, step, path, ctx);
}

fn validate_connection(v: &mut Validator, step: &StepDefinition, path: &str, ctx: &JobContext<'_>) {
    let conn_path = format!("{path}.connection");
    let required = step.kind.required_connection_kind();

    let Some(name) = &step.connection else {
        match &step.kind {
            kind if kind.is_db() => v.push(conn_path, format!("{} steps require a connection", step.type_name())),
            StepKind::LambdaInvoke(_) => v.push(conn_path, "lambda.invoke steps require a connection"),
            StepKind::ApiCall(call) if call.url.is_none() => {
                v.push(conn_path, "api.call without an absolute url requires a connection")
            }
            _ => {}
        }
        return;
    };

    let Some(def) = ctx.job.connections.get(name) else {
        v.push(conn_path, format!("unknown connection '{name}'"));
        return;
    };

    let expected = match (&step.kind, required) {
        (StepKind::FileRead(_), _) => Some(ConnectionKind::File),
        (StepKind::Conditional(_), _) => {
            v.push(conn_path, "conditional steps do not take a connection");
            return;
        }
        (_, kind) => kind,
    };
    if let Some(expected) = expected {
        if def.kind != expected {
            v.push(
                conn_path,
                format!(
                    "{} steps need a '{}' connection, '{name}' is '{}'",
                    step.type_name(),
                    expected.as_str(),
                    def.kind.as_str()
                ),
            );
        }
    }
}

fn validate_payload(v: &mut Validator, step: &StepDefinition, path: &str) {
    match &step.kind {
        StepKind::FileRead(f) => {
            if f.path.trim().is_empty() {
                v.push(format!("{path}.path"), "must not be empty");
            }
            if let Some(d) = &f.delimiter {
                if d.len() != 1 {
                    v.push(format!("{path}.delimiter"), "must be a single ASCII character");
                }
            }
        }
        StepKind::DbUpsert(u) => {
            v.validate_sql_ident(&format!("{path}.table"), &u.table);
            validate_mapping(v, path, &u.mapping);
            validate_key(v, path, "key", &u.key, &u.mapping);
        }
        StepKind::DbInsert(i) => {
            v.validate_sql_ident(&format!("{path}.table"), &i.table);
            validate_mapping(v, path, &i.mapping);
            if !i.conflict_key.is_empty() {
                validate_key(v, path, "conflict_key", &i.conflict_key, &i.mapping);
            }
        }
        StepKind::DbUpdate(u) => {
            v.validate_sql_ident(&format!("{path}.table"), &u.table);
            validate_mapping(v, path, &u.mapping);
            validate_key(v, path, "key", &u.key, &u.mapping);
            if u.mapping.keys().all(|col| u.key.contains(col)) {
                v.push(format!("{path}.mapping"), "must set at least one column outside the key");
            }
        }
        StepKind::DbQuery(q) | StepKind::DbQueryOne(q) => {
            if q.query.trim().is_empty() {
                v.push(format!("{path}.query"), "must not be empty");
            }
        }
        StepKind::LambdaInvoke(_) => {}
        StepKind::ApiCall(call) => {
            validate_method(v, path, &call.method);
            if call.url.is_none() && call.path.is_none() {
                v.push(path, "one of url or path must be provided");
            }
            for (i, status) in call.expect_status.iter().flatten().enumerate() {
                if !(100..=599).contains(status) {
                    v.push(format!("{path}.expect_status[{i}]"), "must be an HTTP status code");
                }
            }
        }
        StepKind::OutboxEnqueue(o) => {
            validate_method(v, path, &o.method);
            if o.dedup_key.trim().is_empty() {
                v.push(format!("{path}.dedup_key"), "must not be empty");
            }
            match (&o.url, &o.path, &o.target) {
                (None, None, _) => v.push(path, "one of url or path must be provided"),
                (None, Some(_), None) => v.push(format!("{path}.target"), "path requires a target http connection"),
                _ => {}
            }
        }
        StepKind::Conditional(_) => {
            if step.when.is_none() {
                v.push(format!("{path}.when"), "conditional steps require a when expression");
            }
        }
    }
}

fn validate_method(v: &mut Validator, path: &str, method: &str) {
    if !HTTP_METHODS.contains(&method.to_ascii_uppercase().as_str()) {
        v.push(format!("{path}.method"), format!("unsupported HTTP method '{method}'"));
    }
}

fn validate_mapping(v: &mut Validator, path: &str, mapping: &TemplateMap) {
    if mapping.is_empty() {
        v.push(format!("{path}.mapping"), "must map at least one column");
    }
    for col in mapping.keys() {
        v.validate_sql_ident(&format!("{path}.mapping.{col}"), col);
    }
}

fn validate_key(v: &mut Validator, path: &str, field: &str, key: &[String], mapping: &TemplateMap) {
    if key.is_empty() {
        v.push(format!("{path}.{field}"), "must name at least one column");
    }
    for (i, col) in key.iter().enumerate() {
        if !mapping.contains_key(col) {
            v.push(format!("{path}.{field}[{i}]"), format!("key column '{col}' is not in mapping"));
        }
    }
}
