use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::diff::{diff_headers, SnapshotDiff, StatusDiff};
use super::formatter::FormatterRegistry;
use crate::error::{CheckError, CheckResult};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::persistence::Persistence;

pub const SNAPSHOT_EXTENSION: &str = ".snap.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub request_path: String,
    pub request_method: String,
    pub content_type: String,
    pub status_code: u16,
    /// Lower-cased header name to every value received under it.
    pub headers: BTreeMap<String, Vec<String>>,
    pub created_at: DateTime<Utc>,
}

/// On-disk shape of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile {
    pub metadata: SnapshotMetadata,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    Created,
    Updated,
}

/// Per-test snapshot verdict, fed into [`SnapshotStore::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOutcome {
    Matched,
    Mismatched,
    Created,
    Updated,
    Missing,
}

impl From<SaveOutcome> for SnapshotOutcome {
    fn from(outcome: SaveOutcome) -> Self {
        match outcome {
            SaveOutcome::Created => SnapshotOutcome::Created,
            SaveOutcome::Updated => SnapshotOutcome::Updated,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub created: u64,
    pub updated: u64,
}

/// Lower-cases ASCII alphanumerics, maps everything else to `_`, trims
/// leading and trailing `_`. Empty input becomes `root`.
pub fn sanitize(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches('_');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct SnapshotStore {
    persistence: Arc<dyn Persistence>,
    root: String,
    formatters: FormatterRegistry,
    ignore_headers: Vec<String>,
    stats: Mutex<SnapshotStats>,
}

impl SnapshotStore {
    pub fn new(persistence: Arc<dyn Persistence>, root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            persistence,
            root: root.trim_end_matches('/').to_string(),
            formatters: FormatterRegistry::default(),
            ignore_headers: Vec::new(),
            stats: Mutex::new(SnapshotStats::default()),
        }
    }

    pub fn with_formatters(mut self, formatters: FormatterRegistry) -> Self {
        self.formatters = formatters;
        self
    }

    /// Headers left out of header comparison (matched case-insensitively).
    pub fn with_ignore_headers(mut self, headers: Vec<String>) -> Self {
        self.ignore_headers = headers;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Directory holding every snapshot of one collection.
    pub fn collection_dir(&self, collection: &str) -> String {
        let stem = Path::new(collection)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| collection.to_string());
        let stem = stem.strip_suffix(".snap").unwrap_or(&stem).to_string();
        join(&self.root, &sanitize(&stem))
    }

    /// `<root>/<collection stem>/<method>_<name or url path>.snap.json`
    pub fn snapshot_path(&self, collection: &str, request: &Request) -> String {
        let identifier = request
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| request.url_path());
        let file = format!(
            "{}_{}{SNAPSHOT_EXTENSION}",
            sanitize(&request.method),
            sanitize(&identifier)
        );
        join(&self.collection_dir(collection), &file)
    }

    fn to_file(&self, response: &Response) -> SnapshotFile {
        let formatter = self.formatters.for_content_type(&response.content_type);
        SnapshotFile {
            metadata: SnapshotMetadata {
                request_path: response.request.url_path(),
                request_method: response.request.method.to_ascii_uppercase(),
                content_type: response.content_type.clone(),
                status_code: response.status,
                headers: response.header_map(),
                created_at: Utc::now(),
            },
            content: formatter.format(&response.body),
        }
    }

    /// Writes `response` as the snapshot for its request in `collection`.
    pub fn save(&self, response: &Response, collection: &str) -> CheckResult<(String, SaveOutcome)> {
        let path = self.snapshot_path(collection, &response.request);
        let outcome = self.save_at(response, &path)?;
        Ok((path, outcome))
    }

    pub fn save_at(&self, response: &Response, path: &str) -> CheckResult<SaveOutcome> {
        let outcome = if self.persistence.exists(path)? {
            SaveOutcome::Updated
        } else {
            SaveOutcome::Created
        };

        let file = self.to_file(response);
        let encoded = serde_json::to_vec_pretty(&file)?;
        self.persistence.write(path, &encoded)?;

        info!(path, status = response.status, outcome = ?outcome, "snapshot saved");
        Ok(outcome)
    }

    /// Raw stored snapshot. A missing snapshot is [`CheckError::SnapshotMissing`];
    /// one that exists but does not parse is [`CheckError::SnapshotCorrupt`].
    pub fn load_file(&self, path: &str) -> CheckResult<SnapshotFile> {
        let bytes = self
            .persistence
            .read(path)?
            .ok_or_else(|| CheckError::SnapshotMissing(path.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| CheckError::SnapshotCorrupt {
            path: path.to_string(),
            reason: err.to_string(),
        })
    }

    /// Rebuilds a [`Response`] from a stored snapshot. The body is the
    /// normalized content, decoded back to bytes for binary payloads.
    pub fn load(&self, path: &str) -> CheckResult<Response> {
        let file = self.load_file(path)?;
        let meta = file.metadata;

        let body = self
            .formatters
            .for_content_type(&meta.content_type)
            .restore(&file.content)
            .map_err(|err| match err {
                CheckError::SnapshotCorrupt { reason, .. } => CheckError::SnapshotCorrupt {
                    path: path.to_string(),
                    reason,
                },
                other => other,
            })?;

        let mut request = Request::new(meta.request_method, meta.request_path.clone());
        request.path = Some(meta.request_path);

        Ok(Response {
            status: meta.status_code,
            status_text: reqwest::StatusCode::from_u16(meta.status_code)
                .ok()
                .and_then(|code| code.canonical_reason())
                .unwrap_or("Unknown")
                .to_string(),
            headers: meta
                .headers
                .into_iter()
                .flat_map(|(name, values)| values.into_iter().map(move |v| (name.clone(), v)))
                .collect(),
            content_length: body.len() as u64,
            body,
            content_type: meta.content_type,
            duration: Duration::ZERO,
            timestamp: meta.created_at,
            request: Arc::new(request),
            correlation_id: String::new(),
            attempts: 0,
        })
    }

    /// Diffs `response` against the snapshot stored at `path`.
    pub fn compare(&self, response: &Response, path: &str) -> CheckResult<SnapshotDiff> {
        let file = self.load_file(path)?;

        let status = StatusDiff::new(file.metadata.status_code, response.status);
        let headers = diff_headers(&file.metadata.headers, &response.header_map(), &self.ignore_headers);

        let formatter = self.formatters.for_content_type(&response.content_type);
        let actual = formatter.format(&response.body);
        let body = formatter.compare(&file.content, &actual, &response.content_type);

        let diff = SnapshotDiff::new(status, headers, body);
        debug!(path, equal = diff.equal, formatter = formatter.name(), "snapshot compared");
        Ok(diff)
    }

    pub fn record(&self, outcome: SnapshotOutcome) {
        let mut stats = self.stats.lock();
        stats.total += 1;
        match outcome {
            SnapshotOutcome::Matched => stats.passed += 1,
            SnapshotOutcome::Mismatched => stats.failed += 1,
            SnapshotOutcome::Created => {
                stats.passed += 1;
                stats.created += 1;
            }
            SnapshotOutcome::Updated => {
                stats.passed += 1;
                stats.updated += 1;
            }
            SnapshotOutcome::Missing => {}
        }
    }

    pub fn stats(&self) -> SnapshotStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = SnapshotStats::default();
    }

    /// Deletes every snapshot under `dir` that is not in `used`. Returns the
    /// deleted paths.
    pub fn cleanup(&self, used: &HashSet<String>, dir: &str) -> CheckResult<Vec<String>> {
        let mut removed = Vec::new();
        for path in self.persistence.list(dir)? {
            if path.ends_with(SNAPSHOT_EXTENSION) && !used.contains(&path) {
                self.persistence.delete(&path)?;
                info!(path = %path, "removed obsolete snapshot");
                removed.push(path);
            }
        }
        Ok(removed)
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::test_response;
    use crate::persistence::MemoryPersistence;

    fn store() -> SnapshotStore {
        SnapshotStore::new(Arc::new(MemoryPersistence::new()), "__snapshots__/")
            .with_ignore_headers(vec!["date".into()])
    }

    #[test]
    fn sanitize_rules() {
        assert_eq!(sanitize("/users/{id}/Orders"), "users__id__orders");
        assert_eq!(sanitize("GET"), "get");
        assert_eq!(sanitize("///"), "root");
        assert_eq!(sanitize("Créer user"), "cr_er_user");
    }

    #[test]
    fn path_uses_collection_stem_and_identifier() {
        let store = store();
        let by_path = Request::new("get", "http://api.local/users/42?x=1");
        assert_eq!(
            store.snapshot_path("collections/Users API.json", &by_path),
            "__snapshots__/users_api/get_users_42.snap.json"
        );

        let named = by_path.clone().with_name("List users");
        assert_eq!(
            store.snapshot_path("collections/Users API.json", &named),
            "__snapshots__/users_api/get_list_users.snap.json"
        );
    }

    #[test]
    fn save_then_compare_is_equal() {
        let store = store();
        let response = test_response(200, "application/json", r#"{"id":1,"name":"a"}"#);

        let (path, outcome) = store.save(&response, "users.json").unwrap();
        assert_eq!(outcome, SaveOutcome::Created);
        assert_eq!(path, "__snapshots__/users/get_users.snap.json");

        let diff = store.compare(&response, &path).unwrap();
        assert!(diff.equal, "{diff:?}");
        assert!(diff.headers.is_empty());
        assert_eq!(diff.body.json, None);

        let (_, outcome) = store.save(&response, "users.json").unwrap();
        assert_eq!(outcome, SaveOutcome::Updated);
    }

    #[test]
    fn compare_detects_each_dimension() {
        let store = store();
        let mut original = test_response(200, "application/json", r#"{"a":1,"b":2}"#);
        original.headers.push(("Date".into(), "Mon".into()));
        let (path, _) = store.save(&original, "c").unwrap();

        let mut changed = test_response(201, "application/json", r#"{"a":1,"c":3}"#);
        changed.headers.push(("date".into(), "Tue".into()));
        changed.headers.push(("X-New".into(), "1".into()));

        let diff = store.compare(&changed, &path).unwrap();
        assert!(!diff.equal);
        assert!(!diff.status.equal);
        assert_eq!(diff.headers.extra.keys().collect::<Vec<_>>(), vec!["x-new"]);
        let json = diff.body.json.unwrap();
        assert_eq!(json.missing_fields, vec!["b"]);
        assert_eq!(json.extra_fields, vec!["c"]);
    }

    #[test]
    fn missing_and_corrupt_are_distinguished() {
        let store = store();
        assert!(matches!(
            store.load("__snapshots__/x/get_a.snap.json"),
            Err(CheckError::SnapshotMissing(_))
        ));

        store
            .persistence()
            .write("__snapshots__/x/get_b.snap.json", b"{not json")
            .unwrap();
        assert!(matches!(
            store.load("__snapshots__/x/get_b.snap.json"),
            Err(CheckError::SnapshotCorrupt { .. })
        ));
    }

    #[test]
    fn load_restores_binary_bodies() {
        let store = store();
        let mut response = test_response(200, "image/png", "");
        response.body = bytes::Bytes::from_static(&[137, 80, 78, 71]);
        let (path, _) = store.save(&response, "img").unwrap();

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.body.as_ref(), &[137, 80, 78, 71]);
        assert_eq!(loaded.status, 200);
        assert_eq!(loaded.request.method, "GET");
        assert_eq!(loaded.header("content-type"), Some("image/png"));
    }

    #[test]
    fn stats_accumulate_and_reset() {
        let store = store();
        store.record(SnapshotOutcome::Matched);
        store.record(SnapshotOutcome::Created);
        store.record(SnapshotOutcome::Mismatched);
        store.record(SnapshotOutcome::Updated);
        assert_eq!(
            store.stats(),
            SnapshotStats {
                total: 4,
                passed: 3,
                failed: 1,
                created: 1,
                updated: 1,
            }
        );
        store.reset_stats();
        assert_eq!(store.stats(), SnapshotStats::default());
    }

    #[test]
    fn cleanup_removes_only_unused() {
        let store = store();
        let response = test_response(200, "text/plain", "ok");
        let (kept, _) = store.save(&response, "a").unwrap();
        store.persistence().write("__snapshots__/a/get_old.snap.json", b"{}").unwrap();
        store.persistence().write("__snapshots__/a/notes.txt", b"keep").unwrap();

        let used: HashSet<String> = [kept.clone()].into_iter().collect();
        let removed = store.cleanup(&used, "__snapshots__").unwrap();
        assert_eq!(removed, vec!["__snapshots__/a/get_old.snap.json".to_string()]);
        assert!(store.persistence().exists(&kept).unwrap());
        assert!(store.persistence().exists("__snapshots__/a/notes.txt").unwrap());
    }
}
