use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use std::collections::HashMap;

use super::diff::{diff_json, BodyDiff};
use super::text_diff::line_diff;
use crate::error::{CheckError, CheckResult};
use crate::http::response::essence;

/// Payloads above this size on either side only get a size summary.
const MAX_HEX_DIFF_BYTES: usize = 1024;
const HEX_BYTES_PER_LINE: usize = 16;

/// Content-type specific normalization and comparison strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formatter {
    Json,
    Text,
    Binary,
}

fn normalize_text(body: &str) -> String {
    body.replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

fn hex_lines(bytes: &[u8]) -> String {
    bytes
        .chunks(HEX_BYTES_PER_LINE)
        .map(|chunk| {
            chunk
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl Formatter {
    pub fn name(self) -> &'static str {
        match self {
            Formatter::Json => "json",
            Formatter::Text => "text",
            Formatter::Binary => "binary",
        }
    }

    /// Normalized content as stored in a snapshot file. Binary payloads are
    /// base64 encoded; JSON that fails to parse is normalized as text.
    pub fn format(self, body: &[u8]) -> String {
        match self {
            Formatter::Json => match serde_json::from_slice::<serde_json::Value>(body) {
                Ok(value) => serde_json::to_string_pretty(&value)
                    .unwrap_or_else(|_| normalize_text(&String::from_utf8_lossy(body))),
                Err(_) => normalize_text(&String::from_utf8_lossy(body)),
            },
            Formatter::Text => normalize_text(&String::from_utf8_lossy(body)),
            Formatter::Binary => STANDARD.encode(body),
        }
    }

    /// Inverse of [`Formatter::format`] as far as the body bytes go.
    pub fn restore(self, content: &str) -> CheckResult<Bytes> {
        match self {
            Formatter::Json | Formatter::Text => Ok(Bytes::from(content.to_string())),
            Formatter::Binary => STANDARD
                .decode(content.trim())
                .map(Bytes::from)
                .map_err(|err| CheckError::SnapshotCorrupt {
                    path: String::new(),
                    reason: format!("binary content is not valid base64: {err}"),
                }),
        }
    }

    /// Compares two already-normalized contents.
    pub fn compare(self, expected: &str, actual: &str, content_type: &str) -> BodyDiff {
        match self {
            Formatter::Json => compare_json(expected, actual, content_type),
            Formatter::Text => compare_text(expected, actual, content_type),
            Formatter::Binary => compare_binary(expected, actual, content_type),
        }
    }
}

fn compare_text(expected: &str, actual: &str, content_type: &str) -> BodyDiff {
    let equal = expected == actual;
    BodyDiff {
        content_type: content_type.to_string(),
        expected_size: expected.len(),
        actual_size: actual.len(),
        equal,
        diff: if equal { String::new() } else { line_diff(expected, actual) },
        json: None,
    }
}

fn compare_json(expected: &str, actual: &str, content_type: &str) -> BodyDiff {
    if expected == actual {
        return compare_text(expected, actual, content_type);
    }

    let parsed = (
        serde_json::from_str::<serde_json::Value>(expected),
        serde_json::from_str::<serde_json::Value>(actual),
    );
    let (Ok(expected_value), Ok(actual_value)) = parsed else {
        return compare_text(expected, actual, content_type);
    };

    let structural = diff_json(&expected_value, &actual_value);
    let equal = structural.is_empty();
    BodyDiff {
        content_type: content_type.to_string(),
        expected_size: expected.len(),
        actual_size: actual.len(),
        equal,
        diff: if equal { String::new() } else { line_diff(expected, actual) },
        json: Some(structural),
    }
}

fn compare_binary(expected: &str, actual: &str, content_type: &str) -> BodyDiff {
    let decode = |content: &str| STANDARD.decode(content.trim()).unwrap_or_else(|_| content.as_bytes().to_vec());
    let expected_bytes = decode(expected);
    let actual_bytes = decode(actual);
    let equal = expected_bytes == actual_bytes;

    let diff = if equal {
        String::new()
    } else if expected_bytes.len() <= MAX_HEX_DIFF_BYTES && actual_bytes.len() <= MAX_HEX_DIFF_BYTES {
        line_diff(&hex_lines(&expected_bytes), &hex_lines(&actual_bytes))
    } else {
        format!(
            "content differs (sizes: expected {} bytes, actual {} bytes)",
            expected_bytes.len(),
            actual_bytes.len()
        )
    };

    BodyDiff {
        content_type: content_type.to_string(),
        expected_size: expected_bytes.len(),
        actual_size: actual_bytes.len(),
        equal,
        diff,
        json: None,
    }
}

/// Content-type to formatter table. Lookup order is exact media type, then
/// the `type/*` wildcard, then [`Formatter::Binary`].
#[derive(Debug, Clone)]
pub struct FormatterRegistry {
    by_type: HashMap<String, Formatter>,
}

impl Default for FormatterRegistry {
    fn default() -> Self {
        let mut registry = Self {
            by_type: HashMap::new(),
        };
        for json in [
            "application/json",
            "text/json",
            "application/problem+json",
            "application/vnd.api+json",
            "application/hal+json",
        ] {
            registry.register(json, Formatter::Json);
        }
        for text in [
            "text/*",
            "application/xml",
            "application/xhtml+xml",
            "application/javascript",
            "application/x-www-form-urlencoded",
        ] {
            registry.register(text, Formatter::Text);
        }
        registry
    }
}

impl FormatterRegistry {
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
        }
    }

    /// Registers `formatter` for an exact media type or a `type/*` pattern.
    pub fn register(&mut self, media_type: &str, formatter: Formatter) {
        self.by_type
            .insert(media_type.trim().to_ascii_lowercase(), formatter);
    }

    pub fn for_content_type(&self, content_type: &str) -> Formatter {
        let media_type = essence(content_type);
        if let Some(formatter) = self.by_type.get(&media_type) {
            return *formatter;
        }
        if let Some((main, _)) = media_type.split_once('/') {
            if let Some(formatter) = self.by_type.get(&format!("{main}/*")) {
                return *formatter;
            }
        }
        Formatter::Binary
    }
}
