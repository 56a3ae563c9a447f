use std::sync::LazyLock;

use regex::Regex;

use super::ast::Expr;
use super::parser::parse_expression;
use super::{EvalLimits, TemplateError};

static ENV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{(?:env:)?([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    /// `{{ expr }}`; `source` is the trimmed text between the braces.
    Expr { source: String, expr: Expr },
    /// `${NAME}`, `${NAME:-default}`, `${env:NAME}`, `${env:NAME:-default}`.
    Env { name: String, default: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub segments: Vec<Segment>,
}

impl Template {
    /// The whole string is one `{{ expr }}` (surrounding whitespace ignored), so it
    /// evaluates to a typed value instead of text.
    pub fn single_expr(&self) -> Option<&Expr> {
        let mut found = None;
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) if text.trim().is_empty() => {}
                Segment::Expr { expr, .. } if found.is_none() => found = Some(expr),
                _ => return None,
            }
        }
        found
    }

    /// No expressions or env placeholders at all.
    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr { expr, .. } => Some(expr),
            _ => None,
        })
    }

    pub fn env_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Env { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Whether a string needs the template machinery at all.
pub fn has_template_syntax(input: &str) -> bool {
    input.contains("{{") || input.contains("${")
}

pub fn parse_template(input: &str, limits: &EvalLimits) -> Result<Template, TemplateError> {
    let mut segments = Vec::new();
    let mut buf = String::new();
    let mut i = 0;

    while i < input.len() {
        let rest = &input[i..];
        if rest.starts_with("{{") {
            let body_start = i + 2;
            let end = find_expr_end(input, body_start)?;
            let source = input[body_start..end].trim();
            let expr = parse_expression(source, limits).map_err(|e| shift_offset(e, body_start))?;
            if !buf.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut buf)));
            }
            segments.push(Segment::Expr {
                source: source.to_string(),
                expr,
            });
            i = end + 2;
            continue;
        }

        if rest.starts_with("${") {
            if let Some(caps) = ENV_RE.captures(rest) {
                let whole = caps.get(0).map(|m| m.len()).unwrap_or(2);
                if !buf.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut buf)));
                }
                segments.push(Segment::Env {
                    name: caps[1].to_string(),
                    default: caps.get(2).map(|m| m.as_str().to_string()),
                });
                i += whole;
                continue;
            }
        }

        let ch = rest.chars().next().unwrap_or_default();
        buf.push(ch);
        i += ch.len_utf8().max(1);
    }

    if !buf.is_empty() {
        segments.push(Segment::Literal(buf));
    }
    Ok(Template { segments })
}

/// Byte index of the `}}` closing an expression body that starts at `start`.
/// Braces of object literals and quoted strings do not terminate it.
fn find_expr_end(input: &str, start: usize) -> Result<usize, TemplateError> {
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'{' => depth += 1,
            b'}' if depth > 0 => depth -= 1,
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Ok(i),
            _ => {}
        }
        i += 1;
    }
    Err(TemplateError::UnclosedExpression)
}

fn shift_offset(err: TemplateError, by: usize) -> TemplateError {
    match err {
        TemplateError::Syntax { offset, message } => TemplateError::Syntax {
            offset: offset + by,
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Template {
        parse_template(input, &EvalLimits::default()).unwrap()
    }

    #[test]
    fn single_expression_is_detected() {
        assert!(parse("{{ row.id }}").single_expr().is_some());
        assert!(parse("  {{ row.id }} ").single_expr().is_some());
        assert!(parse("id={{ row.id }}").single_expr().is_none());
        assert!(parse("{{ a }}{{ b }}").single_expr().is_none());
    }

    #[test]
    fn object_literals_do_not_close_the_expression() {
        let t = parse(r#"{{ {"a": {"b": 1}} | tojson }}"#);
        assert!(t.single_expr().is_some());
    }

    #[test]
    fn closing_braces_inside_strings_are_ignored() {
        let t = parse("{{ 'x}}y' }}");
        assert_eq!(t.exprs().count(), 1);
    }

    #[test]
    fn env_placeholders() {
        let t = parse("postgres://${env:DB_USER}:${DB_PASS:-secret}@host");
        let names: Vec<_> = t.env_names().collect();
        assert_eq!(names, vec!["DB_USER", "DB_PASS"]);
        assert!(t.segments.contains(&Segment::Env {
            name: "DB_PASS".into(),
            default: Some("secret".into())
        }));
    }

    #[test]
    fn lone_dollar_and_braces_stay_literal() {
        let t = parse("cost: ${ 5 } {x}");
        assert!(t.is_literal());
    }

    #[test]
    fn unclosed_expression_is_an_error() {
        assert_eq!(
            parse_template("{{ row.id ", &EvalLimits::default()),
            Err(TemplateError::UnclosedExpression)
        );
    }
}
