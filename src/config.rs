use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{CheckError, CheckResult};
use crate::http::transport::RetryPolicy;
use crate::schema::SchemaOptions;
use crate::testing::filter::RequestFilter;

/// When snapshots get written instead of (or after) being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    #[default]
    None,
    /// Overwrite every snapshot.
    All,
    /// Overwrite snapshots that no longer match.
    Failed,
    /// Create snapshots that don't exist yet.
    Missing,
}

fn default_ignore_headers() -> Vec<String> {
    vec![
        "date".to_string(),
        "x-request-id".to_string(),
        "x-correlation-id".to_string(),
    ]
}

fn default_concurrency() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_snapshot_dir() -> String {
    "__snapshots__".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    #[serde(default)]
    pub update_mode: UpdateMode,
    #[serde(default)]
    pub fail_on_missing: bool,
    #[serde(default = "default_ignore_headers")]
    pub ignore_headers: Vec<String>,
    /// Per-attempt timeout; `0` or absent means no timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub stop_on_failure: bool,
    #[serde(default)]
    pub filter: RequestFilter,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub schema_validation: bool,
    #[serde(default)]
    pub schema_options: SchemaOptions,
    #[serde(default = "default_true")]
    pub extract_variables: bool,
    #[serde(default)]
    pub save_variables: bool,
    #[serde(default)]
    pub variable_file: Option<String>,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
    #[serde(default)]
    pub cleanup_obsolete: bool,
    #[serde(default = "default_true")]
    pub sessions: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            update_mode: UpdateMode::default(),
            fail_on_missing: false,
            ignore_headers: default_ignore_headers(),
            timeout_ms: None,
            parallel: false,
            concurrency: default_concurrency(),
            stop_on_failure: false,
            filter: RequestFilter::default(),
            environment: HashMap::new(),
            schema_validation: false,
            schema_options: SchemaOptions::default(),
            extract_variables: true,
            save_variables: false,
            variable_file: None,
            fail_fast: false,
            retry: RetryPolicy::default(),
            snapshot_dir: default_snapshot_dir(),
            cleanup_obsolete: false,
            sessions: true,
        }
    }
}

impl RunOptions {
    pub fn from_json(raw: &str) -> CheckResult<Self> {
        let options: RunOptions = serde_json::from_str(raw)
            .map_err(|err| CheckError::Config(format!("Failed to parse run options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn load(path: impl AsRef<Path>) -> CheckResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| CheckError::persistence(path.display().to_string(), err))?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> CheckResult<()> {
        if self.concurrency == 0 {
            return Err(CheckError::Config("concurrency must be at least 1".to_string()));
        }
        if self.snapshot_dir.trim().is_empty() {
            return Err(CheckError::Config("snapshotDir cannot be empty".to_string()));
        }
        self.retry.validate()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_document() {
        let options = RunOptions::from_json("{}").unwrap();
        assert_eq!(options, RunOptions::default());
        assert_eq!(options.concurrency, 4);
        assert!(options.extract_variables);
        assert!(options.sessions);
        assert_eq!(options.snapshot_dir, "__snapshots__");
        assert!(options.ignore_headers.contains(&"date".to_string()));
        assert_eq!(options.retry.max_retries, 3);
        assert_eq!(options.timeout(), None);
    }

    #[test]
    fn parses_camel_case_fields() {
        let options = RunOptions::from_json(
            r#"{
                "updateMode": "failed",
                "failOnMissing": true,
                "parallel": true,
                "concurrency": 8,
                "timeoutMs": 2500,
                "filter": {"tags": ["smoke"]},
                "retry": {"maxRetries": 1, "idempotentOnly": true},
                "environment": {"base": "http://localhost"}
            }"#,
        )
        .unwrap();
        assert_eq!(options.update_mode, UpdateMode::Failed);
        assert!(options.fail_on_missing);
        assert_eq!(options.concurrency, 8);
        assert_eq!(options.timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(options.filter.tags, vec!["smoke"]);
        assert_eq!(options.retry.max_retries, 1);
        assert!(options.retry.idempotent_only);
        assert_eq!(options.retry.initial_backoff_ms, 500);
        assert_eq!(options.environment["base"], "http://localhost");
    }

    #[test]
    fn validation_rejects_bad_values() {
        for raw in [
            r#"{"concurrency": 0}"#,
            r#"{"snapshotDir": " "}"#,
            r#"{"retry": {"jitter": 2.0}}"#,
            r#"{"retry": {"backoffFactor": 0.5}}"#,
            r#"{"updateMode": "sometimes"}"#,
        ] {
            assert!(matches!(RunOptions::from_json(raw), Err(CheckError::Config(_))), "{raw}");
        }
    }
}
