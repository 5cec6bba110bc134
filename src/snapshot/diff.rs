use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDiff {
    pub expected: u16,
    pub actual: u16,
    pub equal: bool,
}

impl StatusDiff {
    pub fn new(expected: u16, actual: u16) -> Self {
        Self {
            expected,
            actual,
            equal: expected == actual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderValueDiff {
    pub expected: Vec<String>,
    pub actual: Vec<String>,
}

/// Header differences keyed by lowercased header name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderDiff {
    /// In the snapshot, absent from the response.
    pub missing: BTreeMap<String, Vec<String>>,
    /// In the response, absent from the snapshot.
    pub extra: BTreeMap<String, Vec<String>>,
    pub different: BTreeMap<String, HeaderValueDiff>,
}

impl HeaderDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.different.is_empty()
    }
}

fn normalize_headers(
    headers: &BTreeMap<String, Vec<String>>,
    ignore: &BTreeSet<String>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut normalized: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, values) in headers {
        let name = name.trim().to_ascii_lowercase();
        if ignore.contains(&name) {
            continue;
        }
        normalized
            .entry(name)
            .or_default()
            .extend(values.iter().map(|v| v.trim().to_string()));
    }
    normalized
}

/// Case-insensitive header comparison. Values are compared as sets, so
/// ordering and duplicates don't matter.
pub fn diff_headers(
    expected: &BTreeMap<String, Vec<String>>,
    actual: &BTreeMap<String, Vec<String>>,
    ignore: &[String],
) -> HeaderDiff {
    let ignore: BTreeSet<String> = ignore.iter().map(|h| h.trim().to_ascii_lowercase()).collect();
    let expected = normalize_headers(expected, &ignore);
    let actual = normalize_headers(actual, &ignore);

    let mut diff = HeaderDiff::default();
    for (name, expected_values) in &expected {
        match actual.get(name) {
            None => {
                diff.missing
                    .insert(name.clone(), expected_values.iter().cloned().collect());
            }
            Some(actual_values) if actual_values != expected_values => {
                diff.different.insert(
                    name.clone(),
                    HeaderValueDiff {
                        expected: expected_values.iter().cloned().collect(),
                        actual: actual_values.iter().cloned().collect(),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for (name, actual_values) in &actual {
        if !expected.contains_key(name) {
            diff.extra
                .insert(name.clone(), actual_values.iter().cloned().collect());
        }
    }
    diff
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonMismatch {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonDiff {
    pub missing_fields: Vec<String>,
    pub extra_fields: Vec<String>,
    pub type_mismatches: Vec<JsonMismatch>,
    pub value_mismatches: Vec<JsonMismatch>,
}

impl JsonDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_fields.is_empty()
            && self.extra_fields.is_empty()
            && self.type_mismatches.is_empty()
            && self.value_mismatches.is_empty()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn field_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

/// Structural diff. Paths read like `items[2].name`; the document root is `$`.
pub fn diff_json(expected: &Value, actual: &Value) -> JsonDiff {
    let mut diff = JsonDiff::default();
    walk(expected, actual, "", &mut diff);
    diff
}

fn walk(expected: &Value, actual: &Value, path: &str, diff: &mut JsonDiff) {
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => {
            for (key, exp_value) in exp {
                let child = field_path(path, key);
                match act.get(key) {
                    Some(act_value) => walk(exp_value, act_value, &child, diff),
                    None => diff.missing_fields.push(child),
                }
            }
            for key in act.keys() {
                if !exp.contains_key(key) {
                    diff.extra_fields.push(field_path(path, key));
                }
            }
        }
        (Value::Array(exp), Value::Array(act)) => {
            for (index, (exp_item, act_item)) in exp.iter().zip(act).enumerate() {
                walk(exp_item, act_item, &format!("{path}[{index}]"), diff);
            }
            if exp.len() != act.len() {
                diff.value_mismatches.push(JsonMismatch {
                    path: display_path(path),
                    expected: format!("length {}", exp.len()),
                    actual: format!("length {}", act.len()),
                });
            }
        }
        _ if type_name(expected) != type_name(actual) => {
            diff.type_mismatches.push(JsonMismatch {
                path: display_path(path),
                expected: type_name(expected).to_string(),
                actual: type_name(actual).to_string(),
            });
        }
        _ if expected != actual => {
            diff.value_mismatches.push(JsonMismatch {
                path: display_path(path),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        _ => {}
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyDiff {
    pub content_type: String,
    pub expected_size: usize,
    pub actual_size: usize,
    pub equal: bool,
    /// Human-readable diff; empty when equal.
    #[serde(default)]
    pub diff: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<JsonDiff>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDiff {
    pub equal: bool,
    pub status: StatusDiff,
    pub headers: HeaderDiff,
    pub body: BodyDiff,
}

impl SnapshotDiff {
    pub fn new(status: StatusDiff, headers: HeaderDiff, body: BodyDiff) -> Self {
        Self {
            equal: status.equal && headers.is_empty() && body.equal,
            status,
            headers,
            body,
        }
    }

    /// One-line description of what differs, for logs and result messages.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.status.equal {
            parts.push(format!("status {} -> {}", self.status.expected, self.status.actual));
        }
        if !self.headers.is_empty() {
            parts.push(format!(
                "headers ({} missing, {} extra, {} different)",
                self.headers.missing.len(),
                self.headers.extra.len(),
                self.headers.different.len()
            ));
        }
        if !self.body.equal {
            parts.push(format!(
                "body ({} -> {} bytes)",
                self.body.expected_size, self.body.actual_size
            ));
        }
        if parts.is_empty() {
            "no differences".to_string()
        } else {
            parts.join(", ")
        }
    }
}
