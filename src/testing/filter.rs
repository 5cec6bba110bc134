use serde::{Deserialize, Serialize};

use crate::http::request::Request;

/// Request selection. Each non-empty criterion must match; within a
/// criterion any listed value is enough. Comparisons ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestFilter {
    pub tags: Vec<String>,
    pub methods: Vec<String>,
    /// Substrings of the request's URL path.
    pub paths: Vec<String>,
    /// Substrings of the request's display name.
    pub names: Vec<String>,
}

fn any_contains(haystack: &str, needles: &[String]) -> bool {
    let haystack = haystack.to_ascii_lowercase();
    needles
        .iter()
        .any(|needle| haystack.contains(&needle.to_ascii_lowercase()))
}

impl RequestFilter {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.methods.is_empty() && self.paths.is_empty() && self.names.is_empty()
    }

    pub fn matches(&self, request: &Request) -> bool {
        if !self.tags.is_empty()
            && !request
                .tags
                .iter()
                .any(|tag| self.tags.iter().any(|wanted| wanted.eq_ignore_ascii_case(tag)))
        {
            return false;
        }
        if !self.methods.is_empty()
            && !self
                .methods
                .iter()
                .any(|method| method.trim().eq_ignore_ascii_case(request.method.trim()))
        {
            return false;
        }
        if !self.paths.is_empty() && !any_contains(&request.url_path(), &self.paths) {
            return false;
        }
        if !self.names.is_empty() && !any_contains(&request.display_name(), &self.names) {
            return false;
        }
        true
    }
}
