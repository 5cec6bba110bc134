//! # Environment & Variables
//!
//! Placeholder interpolation for request text and the run-scoped variable
//! store. Both `{{name}}` and `${name}` forms are recognised; unknown
//! placeholders are left untouched.
//!
//! Precedence when layers are merged, lowest first:
//! environment < run-supplied < sequence-local < step-extracted.

use parking_lot::RwLock;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}|\$\{\s*([A-Za-z0-9_.\-]+)\s*\}")
            .expect("placeholder pattern is valid")
    })
}

fn capture_name<'a>(caps: &'a Captures<'_>) -> Option<&'a str> {
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str())
}

/// Replace every `{{key}}` / `${key}` placeholder whose key is present in
/// `variables`. Replacement is single-pass: substituted values are never
/// scanned again.
pub fn interpolate(input: &str, variables: &HashMap<String, String>) -> String {
    if variables.is_empty() || (!input.contains("{{") && !input.contains("${")) {
        return input.to_string();
    }

    placeholder_pattern()
        .replace_all(input, |caps: &Captures<'_>| {
            match capture_name(caps).and_then(|name| variables.get(name)) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Names of every placeholder in `input`, in order of appearance.
pub fn placeholders(input: &str) -> Vec<String> {
    placeholder_pattern()
        .captures_iter(input)
        .filter_map(|caps| capture_name(&caps).map(str::to_string))
        .collect()
}

/// Thread-safe, cheaply clonable name → value map shared by everything that
/// executes within one run.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.write().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.inner.write().remove(key)
    }

    /// Last write wins for keys present in both.
    pub fn merge(&self, values: &HashMap<String, String>) {
        let mut guard = self.inner.write();
        for (key, value) in values {
            guard.insert(key.clone(), value.clone());
        }
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

/// Builds the combined map used at the point of substitution.
#[derive(Debug, Clone, Default)]
pub struct VariableLayers<'a> {
    environment: Option<&'a HashMap<String, String>>,
    run: Option<&'a HashMap<String, String>>,
    sequence: Option<&'a HashMap<String, String>>,
    step: Option<&'a HashMap<String, String>>,
}

impl<'a> VariableLayers<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn environment(mut self, values: &'a HashMap<String, String>) -> Self {
        self.environment = Some(values);
        self
    }

    pub fn run(mut self, values: &'a HashMap<String, String>) -> Self {
        self.run = Some(values);
        self
    }

    pub fn sequence(mut self, values: &'a HashMap<String, String>) -> Self {
        self.sequence = Some(values);
        self
    }

    pub fn step(mut self, values: &'a HashMap<String, String>) -> Self {
        self.step = Some(values);
        self
    }

    pub fn resolve(&self) -> HashMap<String, String> {
        let mut resolved = HashMap::new();
        for layer in [self.environment, self.run, self.sequence, self.step]
            .into_iter()
            .flatten()
        {
            for (key, value) in layer {
                if !key.is_empty() {
                    resolved.insert(key.clone(), value.clone());
                }
            }
        }
        resolved
    }
}
