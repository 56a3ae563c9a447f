use crate::expressions::{
    collect_templates, has_template_syntax, is_known_function, parse_expression, parse_template, Expr, Template,
    TemplateError,
};
use crate::types::{AnyValue, StepDefinition};
use crate::validate::rules::job::JobContext;
use crate::validate::validator::Validator;

/// Parse every template a step carries and check function names and `steps.*` references.
pub(crate) fn validate_step_templates(v: &mut Validator, step: &StepDefinition, path: &str, ctx: &JobContext<'_>) {
    if let Some(when) = &step.when {
        let parsed = parse_source(v, when);
        check(v, &format!("{path}.when"), parsed, ctx);
    }
    if let Some(batch) = &step.batch {
        let parsed = parse_source(v, &batch.from);
        check(v, &format!("{path}.batch.from"), parsed, ctx);
    }

    let payload = match serde_json::to_value(&step.kind) {
        Ok(AnyValue::Object(mut map)) => {
            map.remove("type");
            // Nested steps are validated on their own.
            map.remove("then");
            map.remove("else");
            AnyValue::Object(map)
        }
        _ => return,
    };
    let mut found = Vec::new();
    collect_templates(&payload, path, v.limits(), &mut found);
    for (p, parsed) in found {
        check(v, &p, parsed.map(Parsed::Template), ctx);
    }
}

/// Connection config values may only use `${VAR}` placeholders.
pub(crate) fn validate_env_only(v: &mut Validator, path: &str, value: &AnyValue) {
    let mut found = Vec::new();
    collect_templates(value, path, v.limits(), &mut found);
    for (p, parsed) in found {
        match parsed {
            Ok(t) if t.exprs().next().is_some() => {
                v.push(p, "connection config only supports ${VAR} placeholders, not {{ }} expressions")
            }
            Ok(_) => {}
            Err(e) => v.push(p, e.to_string()),
        }
    }
}

enum Parsed {
    Template(Template),
    Expr(Expr),
}

fn parse_source(v: &Validator, source: &str) -> Result<Parsed, TemplateError> {
    if has_template_syntax(source) {
        parse_template(source, v.limits()).map(Parsed::Template)
    } else {
        parse_expression(source.trim(), v.limits()).map(Parsed::Expr)
    }
}

fn check(v: &mut Validator, path: &str, parsed: Result<Parsed, TemplateError>, ctx: &JobContext<'_>) {
    let parsed = match parsed {
        Ok(p) => p,
        Err(e) => {
            v.push(path, e.to_string());
            return;
        }
    };
    let exprs: Vec<&Expr> = match &parsed {
        Parsed::Template(t) => t.exprs().collect(),
        Parsed::Expr(e) => vec![e],
    };
    for expr in exprs {
        for name in expr.function_names() {
            if !is_known_function(name) {
                v.push(path, format!("unknown function '{name}'"));
            }
        }
        for id in expr.step_refs() {
            if !ctx.step_ids.contains(id) {
                v.push(path, format!("reference to unknown step '{id}'"));
            }
        }
    }
}
