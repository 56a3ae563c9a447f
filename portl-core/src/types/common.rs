use std::collections::BTreeMap;

pub type AnyValue = serde_json::Value;

/// A `{{ ... }}` template string, evaluated against the run context.
pub type TemplateString = String;

/// Payload values (mappings, bodies, params) that may embed templates at any depth.
pub type TemplateMap = BTreeMap<String, AnyValue>;

/// Context names that steps may not claim through `save_as` or a batch alias.
pub const RESERVED_NAMES: &[&str] = &["steps", "env", "idx"];

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}
