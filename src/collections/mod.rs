//! # Collections
//!
//! Request sources: ordered requests grouped into named files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{CheckError, CheckResult};
use crate::http::request::Request;

/// One collection file. `path` identifies it for snapshot naming.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFile {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Collection-level variables, applied beneath run variables.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub requests: Vec<Request>,
}

impl RequestFile {
    pub fn new(path: impl Into<String>, requests: Vec<Request>) -> Self {
        Self {
            path: path.into(),
            requests,
            ..Self::default()
        }
    }

    /// Parses a collection document. `path` wins over any path stored inside.
    pub fn from_json(path: impl Into<String>, raw: &str) -> CheckResult<Self> {
        let path = path.into();
        let mut file: RequestFile = serde_json::from_str(raw)
            .map_err(|err| CheckError::Config(format!("Failed to parse collection `{path}`: {err}")))?;
        file.path = path;
        Ok(file)
    }

    pub fn load(path: impl AsRef<Path>) -> CheckResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| CheckError::persistence(path.display().to_string(), err))?;
        Self::from_json(path.display().to_string(), &raw)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }
}

/// Supplies request files in run order.
pub trait RequestSource {
    fn files(&self) -> CheckResult<Vec<RequestFile>>;
}

impl RequestSource for Vec<RequestFile> {
    fn files(&self) -> CheckResult<Vec<RequestFile>> {
        Ok(self.clone())
    }
}

/// Collection JSON files on disk, loaded in the given order.
#[derive(Debug, Clone, Default)]
pub struct JsonFileSource {
    paths: Vec<String>,
}

impl JsonFileSource {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl RequestSource for JsonFileSource {
    fn files(&self) -> CheckResult<Vec<RequestFile>> {
        self.paths.iter().map(RequestFile::load).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use crate::testing::extract::ExtractionSource;

    const COLLECTION: &str = r#"{
        "name": "Users",
        "variables": {"base": "http://localhost:8080"},
        "requests": [
            {
                "name": "Create user",
                "method": "POST",
                "url": "{{base}}/users",
                "headers": [["Content-Type", "application/json"]],
                "body": "{\"name\":\"Alice\"}",
                "tags": ["smoke"],
                "extract": [{"name": "id", "path": "id", "required": true}]
            },
            {
                "method": "GET",
                "url": "{{base}}/users/${id}",
                "auth": {"type": "bearer", "token": "{{token}}"}
            }
        ]
    }"#;

    #[test]
    fn parses_collection_document() {
        let file = RequestFile::from_json("collections/users.json", COLLECTION).unwrap();
        assert_eq!(file.path, "collections/users.json");
        assert_eq!(file.display_name(), "Users");
        assert_eq!(file.requests.len(), 2);

        let create = &file.requests[0];
        assert_eq!(create.header("content-type"), Some("application/json"));
        assert_eq!(create.extract[0].source, ExtractionSource::Body);
        assert!(create.extract[0].required);

        assert!(matches!(file.requests[1].auth, Some(AuthConfig::Bearer { .. })));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        fs::write(&path, COLLECTION).unwrap();

        let source = JsonFileSource::new([path.to_string_lossy().into_owned()]);
        let files = source.files().unwrap();
        assert_eq!(files[0].requests[0].display_name(), "Create user");
    }

    #[test]
    fn invalid_document_is_a_config_error() {
        assert!(matches!(
            RequestFile::from_json("x.json", "[1,2"),
            Err(CheckError::Config(_))
        ));
    }
}
