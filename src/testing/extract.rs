use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::json_path::{lookup, value_to_string};
use crate::error::{CheckError, CheckResult};
use crate::http::response::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    #[default]
    Body,
    Header,
    Status,
}

/// Pulls a named value out of a response into the variable scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub name: String,
    #[serde(default)]
    pub source: ExtractionSource,
    /// JSON path for body extraction, header name for header extraction.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

impl Extraction {
    pub fn body(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ExtractionSource::Body,
            path: path.into(),
            required: false,
            default: None,
        }
    }

    pub fn header(name: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            source: ExtractionSource::Header,
            ..Self::body(name, header)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    fn raw_value(&self, response: &Response) -> Option<String> {
        match self.source {
            ExtractionSource::Status => Some(response.status.to_string()),
            ExtractionSource::Header => response.header(self.path.trim()).map(str::to_string),
            ExtractionSource::Body => match response.body_json() {
                Some(document) => lookup(&document, &self.path).map(value_to_string),
                None if self.path.trim().is_empty() => Some(response.body_text()),
                None => None,
            },
        }
    }
}

/// Runs every extraction. Values that cannot be found fall back to their
/// declared default or are left out; a `required` one with neither is a
/// [`CheckError::VariableExtraction`].
pub fn extract_all(extractions: &[Extraction], response: &Response) -> CheckResult<HashMap<String, String>> {
    let mut values = HashMap::with_capacity(extractions.len());
    for extraction in extractions {
        match extraction.raw_value(response).or_else(|| extraction.default.clone()) {
            Some(value) => {
                values.insert(extraction.name.clone(), value);
            }
            None if extraction.required => {
                return Err(CheckError::VariableExtraction {
                    name: extraction.name.clone(),
                    reason: format!("{:?} `{}` not present in response", extraction.source, extraction.path),
                });
            }
            None => debug!(name = %extraction.name, path = %extraction.path, "optional variable not found"),
        }
    }
    Ok(values)
}
