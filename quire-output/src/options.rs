use crate::error::Error;
use crate::lock;
use crate::surface::SurfaceSpec;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Per-batch shared state.
///
/// A JSON object owned by the evaluator for one batch and replaced at the
/// start of the next. Strategies keep their data under their own namespace.
#[derive(Clone, Default)]
pub struct GlobalState {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl fmt::Debug for GlobalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobalState").field(&self.snapshot()).finish()
    }
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with mutable access to the object stored under `namespace`,
    /// creating it when missing or not an object.
    pub fn with_namespace<R>(&self, namespace: &str, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let mut state = lock(&self.inner);
        let entry = state
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => f(map),
            _ => unreachable!("namespace entry was just made an object"),
        }
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        lock(&self.inner)
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
    }

    pub fn set(&self, namespace: &str, key: impl Into<String>, value: Value) {
        self.with_namespace(namespace, |ns| {
            ns.insert(key.into(), value);
        });
    }

    pub fn snapshot(&self) -> Value {
        Value::Object(lock(&self.inner).clone())
    }

    pub fn ptr_eq(&self, other: &GlobalState) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Options accepted by every renderer invocation.
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Style properties for the rendered output.
    pub style: BTreeMap<String, String>,
    /// Classes for the rendered output; entries must not contain whitespace.
    pub class: Vec<String>,
    /// Render as inline (`span`) rather than block (`div`) output.
    pub inline: bool,
    /// Overrides the session's global state for this invocation.
    pub global_state: Option<GlobalState>,
}

impl RenderOptions {
    pub fn inline() -> Self {
        Self {
            inline: true,
            ..Self::default()
        }
    }

    pub fn with_style(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.style.insert(property.into(), value.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class.push(class.into());
        self
    }

    pub fn with_global_state(mut self, global_state: GlobalState) -> Self {
        self.global_state = Some(global_state);
        self
    }

    /// Validate the options and describe the child surface they require.
    ///
    /// Returns `None` when the existing surface can be used as is, which is
    /// the case when neither style nor class is given and `always_create` is
    /// false.
    pub fn creation_spec(&self, always_create: bool) -> Result<Option<SurfaceSpec>, Error> {
        if let Some(class) = self
            .class
            .iter()
            .find(|class| class.is_empty() || class.chars().any(char::is_whitespace))
        {
            return Err(Error::InvalidOptions(format!(
                "class entries must be non-empty and contain no whitespace: {:?}",
                class
            )));
        }
        if self.style.keys().any(|property| property.trim().is_empty()) {
            return Err(Error::InvalidOptions(
                "style property names must not be empty".to_string(),
            ));
        }

        if !always_create && self.style.is_empty() && self.class.is_empty() {
            return Ok(None);
        }

        let mut spec = SurfaceSpec::new(if self.inline { "span" } else { "div" });
        spec.classes = self.class.clone();
        spec.style = self.style.clone();
        Ok(Some(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn namespaces_are_isolated() {
        let state = GlobalState::new();
        state.set("latex", "macros", json!({"R": "\\mathbb{R}"}));
        state.set("script", "counter", json!(1));
        assert_eq!(state.get("script", "counter"), Some(json!(1)));
        assert_eq!(state.get("latex", "counter"), None);
        state.with_namespace("script", |ns| ns.insert("counter".into(), json!(2)));
        assert_eq!(
            state.snapshot(),
            json!({"latex": {"macros": {"R": "\\mathbb{R}"}}, "script": {"counter": 2}})
        );
    }

    #[test]
    fn creation_spec_only_when_needed() {
        assert_eq!(RenderOptions::default().creation_spec(false).unwrap(), None);
        let spec = RenderOptions::inline()
            .with_class("note")
            .creation_spec(false)
            .unwrap()
            .unwrap();
        assert_eq!(spec.tag, "span");
        assert_eq!(spec.classes, vec!["note".to_string()]);
        assert_eq!(
            RenderOptions::default().creation_spec(true).unwrap().map(|s| s.tag),
            Some("div".to_string())
        );
    }

    #[test]
    fn class_with_space_is_rejected() {
        let err = RenderOptions::default()
            .with_class("two words")
            .creation_spec(false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }
}
