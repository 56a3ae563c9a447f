use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use portl_core::expressions::Scope;
use serde_json::{Map, Value as JsonValue};

use crate::connectors::ConnectionHandle;

/// One level of batch expansion.
#[derive(Debug, Clone)]
pub struct BatchFrame {
    /// The `batch.from` expression the items came from.
    pub source: String,
    pub alias: String,
    pub index: usize,
    pub item: JsonValue,
}

/// Mutable state of one run: step results, named values, batch frames, resolved
/// connections and the environment snapshot taken when the run started.
pub struct ExecutionContext {
    steps: JsonValue,
    named: Map<String, JsonValue>,
    frames: Vec<BatchFrame>,
    env: BTreeMap<String, String>,
    env_json: JsonValue,
    connections: HashMap<String, ConnectionHandle>,
}

impl ExecutionContext {
    pub fn new(seed: Map<String, JsonValue>, env: BTreeMap<String, String>) -> Self {
        let env_json = JsonValue::Object(
            env.iter()
                .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                .collect(),
        );
        Self {
            steps: JsonValue::Object(Map::new()),
            named: seed,
            frames: Vec::new(),
            env,
            env_json,
            connections: HashMap::new(),
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn result(&self, step_id: &str) -> Option<&JsonValue> {
        self.steps.get(step_id)
    }

    pub fn results(&self) -> Map<String, JsonValue> {
        self.steps.as_object().cloned().unwrap_or_default()
    }

    pub fn named(&self, name: &str) -> Option<&JsonValue> {
        self.named.get(name)
    }

    /// Store a step's result under its id and, when given, its `save_as` key.
    pub fn store(&mut self, step_id: &str, save_as: Option<&str>, value: JsonValue) {
        if let Some(name) = save_as {
            self.named.insert(name.to_string(), value.clone());
        }
        if let Some(steps) = self.steps.as_object_mut() {
            steps.insert(step_id.to_string(), value);
        }
    }

    /// Forget a step's result (and `save_as` value) so a new batch iteration
    /// can tell whether it ran.
    pub fn forget(&mut self, step_id: &str, save_as: Option<&str>) {
        if let Some(name) = save_as {
            self.named.remove(name);
        }
        if let Some(steps) = self.steps.as_object_mut() {
            steps.remove(step_id);
        }
    }

    pub fn push_frame(&mut self, frame: BatchFrame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<BatchFrame> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Item index of the innermost batch frame.
    pub fn index(&self) -> Option<usize> {
        self.frames.last().map(|f| f.index)
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionHandle> {
        self.connections.get(name)
    }

    pub fn cache_connection(&mut self, name: &str, handle: ConnectionHandle) {
        self.connections.insert(name.to_string(), handle);
    }
}

impl Scope for ExecutionContext {
    fn lookup(&self, name: &str) -> Option<Cow<'_, JsonValue>> {
        match name {
            "steps" => return Some(Cow::Borrowed(&self.steps)),
            "env" => return Some(Cow::Borrowed(&self.env_json)),
            "idx" => {
                return self
                    .frames
                    .last()
                    .map(|f| Cow::Owned(JsonValue::from(f.index)))
            }
            _ => {}
        }
        if let Some(frame) = self.frames.iter().rev().find(|f| f.alias == name) {
            return Some(Cow::Borrowed(&frame.item));
        }
        self.named.get(name).map(Cow::Borrowed)
    }

    fn env_var(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portl_core::expressions::Evaluator;
    use serde_json::json;

    #[test]
    fn innermost_frame_wins() {
        let mut ctx = ExecutionContext::new(Map::new(), BTreeMap::new());
        ctx.push_frame(BatchFrame {
            source: "outer".into(),
            alias: "row".into(),
            index: 0,
            item: json!({"sku": "outer"}),
        });
        ctx.push_frame(BatchFrame {
            source: "inner".into(),
            alias: "row".into(),
            index: 4,
            item: json!({"sku": "inner"}),
        });
        let ev = Evaluator::default();
        assert_eq!(ev.evaluate("row.sku", &ctx).unwrap(), json!("inner"));
        assert_eq!(ev.evaluate("idx", &ctx).unwrap(), json!(4));

        ctx.pop_frame();
        assert_eq!(ev.evaluate("row.sku", &ctx).unwrap(), json!("outer"));
        assert_eq!(ev.evaluate("idx", &ctx).unwrap(), json!(0));
    }

    #[test]
    fn results_and_save_as_are_both_visible() {
        let mut seed = Map::new();
        seed.insert("tenant".into(), json!("acme"));
        let mut ctx = ExecutionContext::new(seed, BTreeMap::from([("HOME".into(), "/root".into())]));
        ctx.store("read", Some("rows"), json!([1, 2]));

        let ev = Evaluator::default();
        assert_eq!(ev.evaluate("steps.read[1]", &ctx).unwrap(), json!(2));
        assert_eq!(ev.evaluate("rows | length", &ctx).unwrap(), json!(2));
        assert_eq!(ev.evaluate("tenant", &ctx).unwrap(), json!("acme"));
        assert_eq!(ev.evaluate("env.HOME", &ctx).unwrap(), json!("/root"));

        ctx.forget("read", Some("rows"));
        assert!(ev.evaluate("rows", &ctx).is_err());
    }
}
