use chrono::format::{Item, StrftimeItems};
use serde_json::Value as JsonValue;
use serde_json_path::JsonPath;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use super::eval::Scope;
use super::value::{is_truthy, simulated_source, to_text, type_name};
use super::{EvalLimits, TemplateError};

/// Every function an expression may call. Anything else is rejected at validation time.
pub const FUNCTION_NAMES: &[&str] = &[
    "hash",
    "sha256",
    "tojson",
    "json",
    "fromjson",
    "jsonpath",
    "jsonpath_one",
    "now",
    "coalesce",
    "default",
    "range",
    "int",
    "float",
    "string",
    "bool",
    "length",
    "env",
    "lower",
    "upper",
];

pub fn is_known_function(name: &str) -> bool {
    FUNCTION_NAMES.contains(&name)
}

/// Functions whose arguments are evaluated leniently (unresolved → null).
pub(crate) fn is_lenient(name: &str) -> bool {
    matches!(name, "coalesce" | "default")
}

pub(crate) fn call(
    name: &str,
    args: Vec<JsonValue>,
    scope: &dyn Scope,
    limits: &EvalLimits,
) -> Result<JsonValue, TemplateError> {
    if !is_known_function(name) {
        return Err(TemplateError::UnknownFunction(name.to_string()));
    }

    // A simulated input makes the result simulated too, except where null-coalescing
    // already returns the first usable argument unchanged.
    if !is_lenient(name) {
        if let Some(sim) = args.iter().find(|a| simulated_source(a).is_some()) {
            return Ok(sim.clone());
        }
    }

    let f = Call { name, args };
    match name {
        "hash" => {
            f.arity(1, 2)?;
            let alg = match f.args.get(1) {
                Some(JsonValue::String(alg)) => alg.to_ascii_lowercase(),
                Some(other) => return Err(f.fail(format!("algorithm must be a string, got {}", type_name(other)))),
                None => "sha256".to_string(),
            };
            let bytes = hash_input(&f.args[0]);
            let digest = match alg.as_str() {
                "sha224" => hex::encode(Sha224::digest(&bytes)),
                "sha256" => hex::encode(Sha256::digest(&bytes)),
                "sha384" => hex::encode(Sha384::digest(&bytes)),
                "sha512" => hex::encode(Sha512::digest(&bytes)),
                other => return Err(f.fail(format!("unsupported algorithm '{other}'"))),
            };
            Ok(JsonValue::String(digest))
        }
        "sha256" => {
            f.arity(1, 1)?;
            Ok(JsonValue::String(hex::encode(Sha256::digest(hash_input(&f.args[0])))))
        }
        "tojson" | "json" => {
            f.arity(1, 1)?;
            serde_json::to_string(&f.args[0])
                .map(JsonValue::String)
                .map_err(|e| f.fail(e.to_string()))
        }
        "fromjson" => {
            f.arity(1, 1)?;
            let s = f.string_arg(0)?;
            serde_json::from_str(s).map_err(|e| f.fail(format!("invalid JSON: {e}")))
        }
        "jsonpath" | "jsonpath_one" => {
            f.arity(2, 2)?;
            let path = JsonPath::parse(f.string_arg(1)?).map_err(|e| f.fail(format!("invalid JSONPath: {e}")))?;
            let nodes = path.query(&f.args[0]).all();
            if name == "jsonpath" {
                Ok(JsonValue::Array(nodes.into_iter().cloned().collect()))
            } else {
                Ok(nodes.first().map(|v| (*v).clone()).unwrap_or(JsonValue::Null))
            }
        }
        "now" => {
            f.arity(0, 1)?;
            let now = chrono::Utc::now();
            match f.args.first() {
                None | Some(JsonValue::Null) => Ok(JsonValue::String(now.to_rfc3339())),
                Some(JsonValue::String(fmt)) => {
                    let items: Vec<Item<'_>> = StrftimeItems::new(fmt).collect();
                    if items.iter().any(|i| matches!(i, Item::Error)) {
                        return Err(f.fail(format!("invalid format string '{fmt}'")));
                    }
                    Ok(JsonValue::String(now.format_with_items(items.into_iter()).to_string()))
                }
                Some(other) => Err(f.fail(format!("format must be a string, got {}", type_name(other)))),
            }
        }
        "coalesce" => Ok(f.args.into_iter().find(|v| !v.is_null()).unwrap_or(JsonValue::Null)),
        "default" => {
            f.arity(2, 2)?;
            let mut args = f.args.into_iter();
            let value = args.next().unwrap_or(JsonValue::Null);
            Ok(if value.is_null() {
                args.next().unwrap_or(JsonValue::Null)
            } else {
                value
            })
        }
        "range" => {
            f.arity(1, 3)?;
            let ints = (0..f.args.len())
                .map(|i| f.int_arg(i))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, end, step) = match ints.as_slice() {
                [end] => (0, *end, 1),
                [start, end] => (*start, *end, 1),
                [start, end, step] => (*start, *end, *step),
                _ => return Err(f.fail("expected 1..=3 arguments")),
            };
            if step == 0 {
                return Err(f.fail("step must not be zero"));
            }
            // Exact in i128: no i64 intermediate can overflow.
            let (start, end, step) = (i128::from(start), i128::from(end), i128::from(step));
            let distance = if step > 0 { end - start } else { start - end };
            let len = if distance > 0 {
                (distance + step.abs() - 1) / step.abs()
            } else {
                0
            };
            if len > limits.max_range_len as i128 {
                return Err(TemplateError::LimitExceeded(format!(
                    "range of {len} items exceeds {}",
                    limits.max_range_len
                )));
            }
            let out = (0..len)
                .map(|i| {
                    start
                        .checked_add(i * step)
                        .and_then(|v| i64::try_from(v).ok())
                        .map(JsonValue::from)
                        .ok_or_else(|| TemplateError::LimitExceeded("range value overflows a 64-bit integer".to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(JsonValue::Array(out))
        }
        "int" => {
            f.arity(1, 1)?;
            let v = &f.args[0];
            let n = match v {
                JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|x| x.trunc() as i64)),
                JsonValue::String(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().filter(|x| x.is_finite()).map(|x| x.trunc() as i64))
                }
                JsonValue::Bool(b) => Some(i64::from(*b)),
                _ => None,
            };
            n.map(JsonValue::from)
                .ok_or_else(|| f.fail(format!("cannot convert {} to int", type_name(v))))
        }
        "float" => {
            f.arity(1, 1)?;
            let v = &f.args[0];
            let x = match v {
                JsonValue::Number(n) => n.as_f64(),
                JsonValue::String(s) => s.trim().parse::<f64>().ok(),
                JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            };
            x.and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number)
                .ok_or_else(|| f.fail(format!("cannot convert {} to float", type_name(v))))
        }
        "string" => {
            f.arity(1, 1)?;
            Ok(JsonValue::String(to_text(&f.args[0])))
        }
        "bool" => {
            f.arity(1, 1)?;
            Ok(JsonValue::Bool(match &f.args[0] {
                JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "yes" | "1" => true,
                    "false" | "no" | "0" | "" => false,
                    _ => true,
                },
                other => is_truthy(other),
            }))
        }
        "length" => {
            f.arity(1, 1)?;
            let n = match &f.args[0] {
                JsonValue::String(s) => s.chars().count(),
                JsonValue::Array(a) => a.len(),
                JsonValue::Object(o) => o.len(),
                JsonValue::Null => 0,
                other => return Err(f.fail(format!("{} has no length", type_name(other)))),
            };
            Ok(JsonValue::from(n))
        }
        "env" => {
            f.arity(1, 2)?;
            let var = f.string_arg(0)?;
            match scope.env_var(var) {
                Some(value) => Ok(JsonValue::String(value)),
                None => match f.args.get(1) {
                    Some(default) => Ok(default.clone()),
                    None => Err(TemplateError::UnresolvedReference {
                        path: format!("env.{var}"),
                    }),
                },
            }
        }
        "lower" | "upper" => {
            f.arity(1, 1)?;
            let s = f.string_arg(0)?;
            Ok(JsonValue::String(if name == "lower" {
                s.to_lowercase()
            } else {
                s.to_uppercase()
            }))
        }
        other => Err(TemplateError::UnknownFunction(other.to_string())),
    }
}

struct Call<'n> {
    name: &'n str,
    args: Vec<JsonValue>,
}

impl Call<'_> {
    fn fail(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Function {
            function: self.name.to_string(),
            message: message.into(),
        }
    }

    fn arity(&self, min: usize, max: usize) -> Result<(), TemplateError> {
        let n = self.args.len();
        if n < min || n > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{min}..={max}")
            };
            return Err(self.fail(format!("expected {expected} arguments, got {n}")));
        }
        Ok(())
    }

    fn string_arg(&self, i: usize) -> Result<&str, TemplateError> {
        match self.args.get(i) {
            Some(JsonValue::String(s)) => Ok(s),
            Some(other) => Err(self.fail(format!("argument {} must be a string, got {}", i + 1, type_name(other)))),
            None => Err(self.fail(format!("missing argument {}", i + 1))),
        }
    }

    fn int_arg(&self, i: usize) -> Result<i64, TemplateError> {
        match self.args.get(i) {
            Some(JsonValue::Number(n)) if n.is_i64() || n.is_u64() => n
                .as_i64()
                .ok_or_else(|| self.fail(format!("argument {} is out of range", i + 1))),
            Some(other) => Err(self.fail(format!("argument {} must be an integer, got {}", i + 1, type_name(other)))),
            None => Err(self.fail(format!("missing argument {}", i + 1))),
        }
    }
}

/// Strings hash as their raw bytes; everything else as canonical JSON.
fn hash_input(value: &JsonValue) -> Vec<u8> {
    match value {
        JsonValue::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}
