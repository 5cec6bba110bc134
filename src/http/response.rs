use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::request::Request;

/// A fully received response. Owned by the execution that produced it and
/// read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub content_type: String,
    pub content_length: u64,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    /// The substituted request that produced this response.
    pub request: Arc<Request>,
    pub correlation_id: String,
    /// Number of sends, including the first.
    pub attempts: u32,
}

impl Response {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// Headers grouped under their lower-cased names.
    pub fn header_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &self.headers {
            map.entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.clone());
        }
        map
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn body_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Media type without parameters, lower-cased: `Application/JSON; charset=utf-8`
/// becomes `application/json`.
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
pub(crate) fn test_response(status: u16, content_type: &str, body: &str) -> Response {
    Response {
        status,
        status_text: reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("Unknown")
            .to_string(),
        headers: vec![("Content-Type".to_string(), content_type.to_string())],
        body: Bytes::from(body.to_string()),
        content_type: content_type.to_string(),
        content_length: body.len() as u64,
        duration: Duration::from_millis(5),
        timestamp: Utc::now(),
        request: Arc::new(Request::new("GET", "http://localhost/users")),
        correlation_id: "test".to_string(),
        attempts: 1,
    }
}
