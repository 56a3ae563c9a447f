//! The `{{ expr }}` template language.
//!
//! Expressions are parsed into a small AST and walked by [`Evaluator`] against a
//! [`Scope`]. There is no host access beyond the fixed function table in
//! [`functions`], and every evaluation is bounded by [`EvalLimits`].

mod ast;
pub mod functions;
mod lexer;
mod parser;
mod template;
pub mod value;

mod eval;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use eval::{Evaluator, MapScope, Rendered, Scope};
pub use functions::{is_known_function, FUNCTION_NAMES};
pub use parser::parse_expression;
pub use template::{has_template_syntax, parse_template, Segment, Template};
pub use value::{is_simulated, is_truthy, simulated, simulated_source, SIMULATED_KEY};

use crate::types::AnyValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EvalLimits {
    /// Bytes of source per expression.
    pub max_expr_len: usize,
    /// Nesting of parentheses, collections, calls and unary operators.
    pub max_depth: usize,
    /// Node visits per evaluation.
    pub max_steps: usize,
    pub max_range_len: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            max_expr_len: 4096,
            max_depth: 64,
            max_steps: 10_000,
            max_range_len: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("unclosed expression (missing '}}}}')")]
    UnclosedExpression,
    #[error("unresolved reference: {path}")]
    UnresolvedReference { path: String },
    #[error("type error: {0}")]
    Type(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("{function}(): {message}")]
    Function { function: String, message: String },
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
}

/// Parse every template string inside a payload. Each entry carries the
/// JSON-ish path of the string (`payload.items[0].id`) and its parse outcome.
pub fn collect_templates(
    value: &AnyValue,
    path: &str,
    limits: &EvalLimits,
    out: &mut Vec<(String, Result<Template, TemplateError>)>,
) {
    match value {
        AnyValue::String(s) if has_template_syntax(s) => {
            out.push((path.to_string(), parse_template(s, limits)));
        }
        AnyValue::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                collect_templates(v, &format!("{path}[{i}]"), limits, out);
            }
        }
        AnyValue::Object(map) => {
            for (k, v) in map {
                collect_templates(v, &format!("{path}.{k}"), limits, out);
            }
        }
        _ => {}
    }
}
