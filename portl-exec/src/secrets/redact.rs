use std::collections::BTreeMap;

use portl_core::types::ConnectionDef;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;

use crate::secrets::SecretValue;

pub const REDACTED: &str = "<redacted>";

/// Shorter values would blank out ordinary text.
const MIN_SECRET_LEN: usize = 4;

const SECRET_NAME_HINTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "credential",
    "private_key",
];

/// Whether a config key, header or env var name usually holds a secret.
pub fn looks_secret(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SECRET_NAME_HINTS.iter().any(|hint| lower.contains(hint))
}

#[derive(Debug, Clone)]
pub struct RedactionPolicy {
    pub redact_authorization: bool,
    pub redact_cookie: bool,
    pub redact_set_cookie: bool,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            redact_authorization: true,
            redact_cookie: true,
            redact_set_cookie: true,
        }
    }
}

pub fn redact_headers(
    headers: &BTreeMap<String, String>,
    policy: &RedactionPolicy,
    extra_names: &[&str],
) -> BTreeMap<String, String> {
    let mut out = headers.clone();

    if policy.redact_authorization {
        replace_case_insensitive(&mut out, "authorization");
    }
    if policy.redact_cookie {
        replace_case_insensitive(&mut out, "cookie");
    }
    if policy.redact_set_cookie {
        replace_case_insensitive(&mut out, "set-cookie");
    }
    for name in extra_names {
        replace_case_insensitive(&mut out, name);
    }
    out
}

fn replace_case_insensitive(map: &mut BTreeMap<String, String>, header: &str) {
    for (_, v) in map.iter_mut().filter(|(k, _)| k.eq_ignore_ascii_case(header)) {
        *v = REDACTED.to_string();
    }
}

/// Scrubs known secret values out of rendered statements and requests.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<SecretValue>,
    policy: RedactionPolicy,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Secrets from connection configs (after env substitution) and from
    /// secret-looking environment variables.
    pub fn for_run<'a>(
        connections: impl IntoIterator<Item = &'a ConnectionDef>,
        env: &BTreeMap<String, String>,
    ) -> Self {
        let mut r = Self::new();
        for def in connections {
            for (key, value) in &def.config {
                r.collect(key, value);
            }
        }
        for (name, value) in env {
            if looks_secret(name) {
                r.add(value);
            }
        }
        r
    }

    fn collect(&mut self, key: &str, value: &JsonValue) {
        match value {
            JsonValue::String(s) if looks_secret(key) => self.add(s),
            JsonValue::Object(map) => {
                for (k, v) in map {
                    self.collect(k, v);
                }
            }
            _ => {}
        }
    }

    pub fn add(&mut self, secret: &str) {
        if secret.len() < MIN_SECRET_LEN || self.secrets.iter().any(|s| s.expose() == secret) {
            return;
        }
        self.secrets.push(SecretValue::new(secret));
        // Longest first so a secret containing another is replaced whole.
        self.secrets.sort_by_key(|s| std::cmp::Reverse(s.expose().len()));
    }

    pub fn add_secret(&mut self, secret: &SecretString) {
        self.add(secret.expose_secret());
    }

    pub fn redact_str(&self, input: &str) -> String {
        let mut out = input.to_string();
        for secret in &self.secrets {
            if out.contains(secret.expose()) {
                out = out.replace(secret.expose(), REDACTED);
            }
        }
        out
    }

    pub fn redact_value(&self, value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) => JsonValue::String(self.redact_str(s)),
            JsonValue::Array(items) => JsonValue::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            JsonValue::Object(map) => {
                JsonValue::Object(map.iter().map(|(k, v)| (k.clone(), self.redact_value(v))).collect())
            }
            other => other.clone(),
        }
    }

    /// First header the redaction would touch, by name or by value.
    pub fn secret_header<'h>(&self, headers: &'h BTreeMap<String, String>) -> Option<&'h str> {
        let redacted = self.redact_header_map(headers);
        headers
            .iter()
            .find(|(k, v)| redacted.get(k.as_str()) != Some(*v))
            .map(|(k, _)| k.as_str())
    }

    pub fn redact_header_map(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let secret_names: Vec<&str> = headers
            .keys()
            .filter(|k| looks_secret(k) || k.eq_ignore_ascii_case("x-api-key"))
            .map(String::as_str)
            .collect();
        redact_headers(headers, &self.policy, &secret_names)
            .into_iter()
            .map(|(k, v)| {
                let v = self.redact_str(&v);
                (k, v)
            })
            .collect()
    }
}
