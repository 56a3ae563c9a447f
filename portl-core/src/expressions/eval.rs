use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Number, Value as JsonValue};

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::functions::{self, is_known_function, is_lenient};
use super::parser::parse_expression;
use super::template::{has_template_syntax, parse_template, Segment, Template};
use super::value::{is_simulated, is_truthy, json_cmp, json_eq, to_text, type_name};
use super::{EvalLimits, TemplateError};

/// Name resolution for expressions. Implemented by the run context.
pub trait Scope {
    /// Root names: `steps`, `env`, `idx`, batch aliases, `save_as` keys and seed values.
    fn lookup(&self, name: &str) -> Option<Cow<'_, JsonValue>>;

    fn env_var(&self, name: &str) -> Option<String>;
}

/// A fixed set of root values and environment variables.
#[derive(Debug, Clone, Default)]
pub struct MapScope {
    pub values: Map<String, JsonValue>,
    pub env: BTreeMap<String, String>,
}

impl MapScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }
}

impl Scope for MapScope {
    fn lookup(&self, name: &str) -> Option<Cow<'_, JsonValue>> {
        if name == "env" && !self.values.contains_key("env") {
            let env = self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                .collect();
            return Some(Cow::Owned(JsonValue::Object(env)));
        }
        self.values.get(name).map(Cow::Borrowed)
    }

    fn env_var(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }
}

/// Output of a lenient evaluation: unresolved references evaluated to `null`
/// and are listed (deduplicated, in order of appearance) instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub value: JsonValue,
    pub unresolved: Vec<String>,
}

const TEMPLATE_CACHE_CAP: usize = 1024;

/// Sandboxed evaluator for `{{ expr }}` templates and bare expressions.
///
/// Parsed templates are cached; the evaluator is meant to be shared for a whole run.
#[derive(Debug, Default)]
pub struct Evaluator {
    limits: EvalLimits,
    cache: Mutex<HashMap<String, Arc<Template>>>,
}

impl Evaluator {
    pub fn new(limits: EvalLimits) -> Self {
        Self {
            limits,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &EvalLimits {
        &self.limits
    }

    /// Evaluate a `when`/`from`-style source: a template string when it contains
    /// `{{ }}` or `${ }`, a bare expression otherwise.
    pub fn evaluate(&self, source: &str, scope: &dyn Scope) -> Result<JsonValue, TemplateError> {
        let mut run = Run::new(&self.limits, scope, false);
        self.evaluate_in(&mut run, source)
    }

    pub fn evaluate_collecting(&self, source: &str, scope: &dyn Scope) -> Result<Rendered, TemplateError> {
        let mut run = Run::new(&self.limits, scope, true);
        let value = self.evaluate_in(&mut run, source)?;
        Ok(run.finish(value))
    }

    pub fn eval_expr(&self, expr: &Expr, scope: &dyn Scope) -> Result<JsonValue, TemplateError> {
        Run::new(&self.limits, scope, false).eval(expr)
    }

    /// Render a single payload string: typed value for a lone `{{ expr }}`, text otherwise.
    pub fn render_str(&self, input: &str, scope: &dyn Scope) -> Result<JsonValue, TemplateError> {
        let mut run = Run::new(&self.limits, scope, false);
        self.render_str_in(&mut run, input)
    }

    /// Render every string inside a payload. Object keys are left untouched.
    pub fn render_value(&self, value: &JsonValue, scope: &dyn Scope) -> Result<JsonValue, TemplateError> {
        let mut run = Run::new(&self.limits, scope, false);
        self.render_value_in(&mut run, value)
    }

    pub fn render_value_collecting(&self, value: &JsonValue, scope: &dyn Scope) -> Result<Rendered, TemplateError> {
        let mut run = Run::new(&self.limits, scope, true);
        let value = self.render_value_in(&mut run, value)?;
        Ok(run.finish(value))
    }

    pub fn template(&self, input: &str) -> Result<Arc<Template>, TemplateError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(t) = cache.get(input) {
                return Ok(Arc::clone(t));
            }
        }
        let parsed = Arc::new(parse_template(input, &self.limits)?);
        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() >= TEMPLATE_CACHE_CAP {
                cache.clear();
            }
            cache.insert(input.to_string(), Arc::clone(&parsed));
        }
        Ok(parsed)
    }

    fn evaluate_in(&self, run: &mut Run<'_>, source: &str) -> Result<JsonValue, TemplateError> {
        if has_template_syntax(source) {
            return self.render_str_in(run, source);
        }
        let expr = parse_expression(source.trim(), &self.limits)?;
        run.eval(&expr)
    }

    fn render_value_in(&self, run: &mut Run<'_>, value: &JsonValue) -> Result<JsonValue, TemplateError> {
        match value {
            JsonValue::String(s) => self.render_str_in(run, s),
            JsonValue::Array(items) => items
                .iter()
                .map(|v| self.render_value_in(run, v))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            JsonValue::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value_in(run, v)?);
                }
                Ok(JsonValue::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn render_str_in(&self, run: &mut Run<'_>, input: &str) -> Result<JsonValue, TemplateError> {
        if !has_template_syntax(input) {
            return Ok(JsonValue::String(input.to_string()));
        }
        let template = self.template(input)?;
        if let Some(expr) = template.single_expr() {
            return run.eval(expr);
        }

        let mut out = String::with_capacity(input.len());
        for seg in &template.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr { expr, .. } => out.push_str(&to_text(&run.eval(expr)?)),
                Segment::Env { name, default } => {
                    let value = match run.scope.env_var(name).or_else(|| default.clone()) {
                        Some(v) => v,
                        None => {
                            let missing = Err(TemplateError::UnresolvedReference {
                                path: format!("env.{name}"),
                            });
                            to_text(&run.absorb(missing)?)
                        }
                    };
                    out.push_str(&value);
                }
            }
        }
        Ok(JsonValue::String(out))
    }
}

/// Per-evaluation state: budget counters and, in collecting mode, the unresolved paths.
struct Run<'a> {
    limits: &'a EvalLimits,
    scope: &'a dyn Scope,
    steps: usize,
    depth: usize,
    lenient: usize,
    unresolved: Option<Vec<String>>,
}

enum Slot {
    Key(String),
    Pos(usize),
}

impl<'a> Run<'a> {
    fn new(limits: &'a EvalLimits, scope: &'a dyn Scope, collect: bool) -> Self {
        Self {
            limits,
            scope,
            steps: 0,
            depth: 0,
            lenient: 0,
            unresolved: collect.then(Vec::new),
        }
    }

    fn finish(self, value: JsonValue) -> Rendered {
        Rendered {
            value,
            unresolved: self.unresolved.unwrap_or_default(),
        }
    }

    fn tick(&mut self) -> Result<(), TemplateError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(TemplateError::LimitExceeded(format!(
                "evaluation exceeded {} steps",
                self.limits.max_steps
            )));
        }
        Ok(())
    }

    /// In collecting mode, outside lenient arguments, an unresolved reference
    /// is recorded and evaluates to `null`.
    fn absorb(&mut self, result: Result<JsonValue, TemplateError>) -> Result<JsonValue, TemplateError> {
        match result {
            Err(TemplateError::UnresolvedReference { path }) if self.lenient == 0 && self.unresolved.is_some() => {
                if let Some(list) = self.unresolved.as_mut() {
                    if !list.contains(&path) {
                        list.push(path);
                    }
                }
                Ok(JsonValue::Null)
            }
            other => other,
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<JsonValue, TemplateError> {
        self.tick()?;
        self.depth += 1;
        let out = if self.depth > self.limits.max_depth {
            Err(TemplateError::LimitExceeded(format!(
                "evaluation nesting exceeds {}",
                self.limits.max_depth
            )))
        } else {
            self.eval_node(expr)
        };
        self.depth -= 1;
        out
    }

    fn eval_lenient(&mut self, expr: &Expr) -> Result<JsonValue, TemplateError> {
        self.lenient += 1;
        let out = self.eval(expr);
        self.lenient -= 1;
        match out {
            Err(TemplateError::UnresolvedReference { .. }) => Ok(JsonValue::Null),
            other => other,
        }
    }

    fn eval_node(&mut self, expr: &Expr) -> Result<JsonValue, TemplateError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::List(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            Expr::Object(entries) => {
                let mut out = Map::with_capacity(entries.len());
                for (k, e) in entries {
                    out.insert(k.clone(), self.eval(e)?);
                }
                Ok(JsonValue::Object(out))
            }
            Expr::Var(_) | Expr::Member(..) | Expr::Index(..) => {
                let resolved = self.eval_path(expr).map(Cow::into_owned);
                self.absorb(resolved)
            }
            Expr::Call { name, args } => {
                if !is_known_function(name) {
                    return Err(TemplateError::UnknownFunction(name.clone()));
                }
                let lenient = is_lenient(name);
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(if lenient {
                        self.eval_lenient(a)?
                    } else {
                        self.eval(a)?
                    });
                }
                let result = functions::call(name, values, self.scope, self.limits);
                self.absorb(result)
            }
            Expr::Unary(UnaryOp::Not, inner) => {
                let v = self.eval_lenient(inner)?;
                if is_simulated(&v) {
                    return Ok(v);
                }
                Ok(JsonValue::Bool(!is_truthy(&v)))
            }
            Expr::Unary(UnaryOp::Neg, inner) => {
                let v = self.eval(inner)?;
                if is_simulated(&v) {
                    return Ok(v);
                }
                match &v {
                    JsonValue::Number(n) => match n.as_i64().and_then(i64::checked_neg) {
                        Some(i) => Ok(i.into()),
                        None => float(-n.as_f64().unwrap_or(f64::NAN)),
                    },
                    other => Err(TemplateError::Type(format!("cannot negate {}", type_name(other)))),
                }
            }
            Expr::Binary(BinaryOp::Or, l, r) => {
                let lv = self.eval_lenient(l)?;
                if is_simulated(&lv) || is_truthy(&lv) {
                    return Ok(lv);
                }
                self.eval(r)
            }
            Expr::Binary(BinaryOp::And, l, r) => {
                let lv = self.eval(l)?;
                if is_simulated(&lv) || !is_truthy(&lv) {
                    return Ok(lv);
                }
                self.eval(r)
            }
            Expr::Binary(op, l, r) => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                if is_simulated(&lv) {
                    return Ok(lv);
                }
                if is_simulated(&rv) {
                    return Ok(rv);
                }
                binary(*op, lv, rv)
            }
        }
    }

    /// Resolve a path expression, borrowing from the scope where possible.
    fn eval_path(&mut self, expr: &Expr) -> Result<Cow<'a, JsonValue>, TemplateError> {
        let scope = self.scope;
        match expr {
            Expr::Var(name) => {
                self.tick()?;
                scope.lookup(name).ok_or_else(|| unresolved(expr))
            }
            Expr::Member(base, field) => {
                let b = self.eval_path(base)?;
                self.tick()?;
                if is_simulated(&b) {
                    return Ok(b);
                }
                step_into(b, &JsonValue::String(field.clone()), expr)
            }
            Expr::Index(base, key) => {
                let b = self.eval_path(base)?;
                if is_simulated(&b) {
                    return Ok(b);
                }
                let k = self.eval(key)?;
                if is_simulated(&k) {
                    return Ok(Cow::Owned(k));
                }
                step_into(b, &k, expr)
            }
            other => self.eval(other).map(Cow::Owned),
        }
    }
}

fn unresolved(expr: &Expr) -> TemplateError {
    TemplateError::UnresolvedReference {
        path: expr.to_string(),
    }
}

fn step_into<'v>(base: Cow<'v, JsonValue>, key: &JsonValue, expr: &Expr) -> Result<Cow<'v, JsonValue>, TemplateError> {
    let slot = match slot_for(&base, key)? {
        Some(slot) => slot,
        None => return Err(unresolved(expr)),
    };
    let found = match base {
        Cow::Borrowed(v) => match (v, &slot) {
            (JsonValue::Object(m), Slot::Key(k)) => m.get(k).map(Cow::Borrowed),
            (JsonValue::Array(a), Slot::Pos(i)) => a.get(*i).map(Cow::Borrowed),
            _ => None,
        },
        Cow::Owned(v) => match (v, slot) {
            (JsonValue::Object(mut m), Slot::Key(k)) => m.remove(&k).map(Cow::Owned),
            (JsonValue::Array(mut a), Slot::Pos(i)) if i < a.len() => Some(Cow::Owned(a.swap_remove(i))),
            _ => None,
        },
    };
    found.ok_or_else(|| unresolved(expr))
}

/// Where `key` points inside `base`; `None` when there is nothing there.
fn slot_for(base: &JsonValue, key: &JsonValue) -> Result<Option<Slot>, TemplateError> {
    match (base, key) {
        (JsonValue::Null, _) => Ok(None),
        (JsonValue::Object(m), JsonValue::String(k)) => Ok(m.contains_key(k).then(|| Slot::Key(k.clone()))),
        (JsonValue::Object(m), JsonValue::Number(n)) => {
            let k = n.to_string();
            Ok(m.contains_key(&k).then_some(Slot::Key(k)))
        }
        (JsonValue::Array(a), JsonValue::Number(n)) => {
            let i = match n.as_i64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)) {
                Some(i) => i,
                None => return Err(TemplateError::Type(format!("list index must be an integer, got {n}"))),
            };
            let len = a.len() as i64;
            let pos = if i < 0 { len + i } else { i };
            Ok((0..len).contains(&pos).then_some(Slot::Pos(pos as usize)))
        }
        (b, k) => Err(TemplateError::Type(format!(
            "cannot index {} with {}",
            type_name(b),
            type_name(k)
        ))),
    }
}

fn float(x: f64) -> Result<JsonValue, TemplateError> {
    Number::from_f64(x)
        .map(JsonValue::Number)
        .ok_or_else(|| TemplateError::Type("arithmetic produced a non-finite number".to_string()))
}

fn binary(op: BinaryOp, l: JsonValue, r: JsonValue) -> Result<JsonValue, TemplateError> {
    use std::cmp::Ordering::*;

    let compare = |l: &JsonValue, r: &JsonValue| {
        json_cmp(l, r).ok_or_else(|| {
            TemplateError::Type(format!(
                "cannot compare {} with {} using '{}'",
                type_name(l),
                type_name(r),
                op.symbol()
            ))
        })
    };

    match op {
        BinaryOp::Eq => Ok(JsonValue::Bool(json_eq(&l, &r))),
        BinaryOp::Ne => Ok(JsonValue::Bool(!json_eq(&l, &r))),
        BinaryOp::Lt => Ok(JsonValue::Bool(compare(&l, &r)? == Less)),
        BinaryOp::Le => Ok(JsonValue::Bool(compare(&l, &r)? != Greater)),
        BinaryOp::Gt => Ok(JsonValue::Bool(compare(&l, &r)? == Greater)),
        BinaryOp::Ge => Ok(JsonValue::Bool(compare(&l, &r)? != Less)),
        BinaryOp::In => contains(&r, &l).map(JsonValue::Bool),
        BinaryOp::NotIn => contains(&r, &l).map(|b| JsonValue::Bool(!b)),
        BinaryOp::Concat => Ok(JsonValue::String(to_text(&l) + &to_text(&r))),
        BinaryOp::Add => match (l, r) {
            (JsonValue::String(a), JsonValue::String(b)) => Ok(JsonValue::String(a + &b)),
            (JsonValue::Array(mut a), JsonValue::Array(b)) => {
                a.extend(b);
                Ok(JsonValue::Array(a))
            }
            (JsonValue::Number(a), JsonValue::Number(b)) => arith(op, &a, &b),
            (a, b) => Err(type_mismatch(op, &a, &b)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => match (&l, &r) {
            (JsonValue::Number(a), JsonValue::Number(b)) => arith(op, a, b),
            _ => Err(type_mismatch(op, &l, &r)),
        },
        BinaryOp::Or | BinaryOp::And => Err(TemplateError::Type("logical operator evaluated eagerly".to_string())),
    }
}

fn type_mismatch(op: BinaryOp, l: &JsonValue, r: &JsonValue) -> TemplateError {
    TemplateError::Type(format!(
        "unsupported operand types for '{}': {} and {}",
        op.symbol(),
        type_name(l),
        type_name(r)
    ))
}

fn contains(haystack: &JsonValue, needle: &JsonValue) -> Result<bool, TemplateError> {
    match haystack {
        JsonValue::Null => Ok(false),
        JsonValue::Array(items) => Ok(items.iter().any(|v| json_eq(v, needle))),
        JsonValue::Object(map) => Ok(match needle {
            JsonValue::String(k) => map.contains_key(k),
            _ => false,
        }),
        JsonValue::String(s) => match needle {
            JsonValue::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(TemplateError::Type(format!(
                "'in <string>' requires a string operand, got {}",
                type_name(other)
            ))),
        },
        other => Err(TemplateError::Type(format!("{} is not a container", type_name(other)))),
    }
}

fn arith(op: BinaryOp, a: &Number, b: &Number) -> Result<JsonValue, TemplateError> {
    if let (Some(x), Some(y), false) = (a.as_i64(), b.as_i64(), op == BinaryOp::Div) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Rem => {
                if y == 0 {
                    return Err(TemplateError::Type("modulo by zero".to_string()));
                }
                x.checked_rem(y).map(|r| if r != 0 && (r < 0) != (y < 0) { r + y } else { r })
            }
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(v.into());
        }
    }

    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    match op {
        BinaryOp::Add => float(x + y),
        BinaryOp::Sub => float(x - y),
        BinaryOp::Mul => float(x * y),
        BinaryOp::Div if y == 0.0 => Err(TemplateError::Type("division by zero".to_string())),
        BinaryOp::Div => float(x / y),
        BinaryOp::Rem if y == 0.0 => Err(TemplateError::Type("modulo by zero".to_string())),
        BinaryOp::Rem => {
            let r = x % y;
            float(if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r })
        }
        _ => Err(TemplateError::Type(format!("'{}' is not arithmetic", op.symbol()))),
    }
}
