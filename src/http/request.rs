use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::AuthConfig;
use crate::environment::interpolate;
use crate::testing::assertion::Assertion;
use crate::testing::extract::Extraction;

/// A request template as it comes out of a collection. Placeholders stay
/// unresolved; [`Request::substituted`] produces the per-execution copy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// API path this request exercises (e.g. `/users/{id}`), if known.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub extract: Vec<Extraction>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Copy of this request with placeholders resolved in the URL, every
    /// header name and value, the body and the auth descriptor.
    pub fn substituted(&self, variables: &HashMap<String, String>) -> Request {
        Request {
            method: self.method.clone(),
            url: interpolate(&self.url, variables),
            headers: self
                .headers
                .iter()
                .map(|(name, value)| (interpolate(name, variables), interpolate(value, variables)))
                .collect(),
            body: self.body.as_ref().map(|body| interpolate(body, variables)),
            auth: self.auth.as_ref().map(|auth| auth.substituted(variables)),
            name: self.name.clone(),
            tags: self.tags.clone(),
            path: self.path.clone(),
            extract: self.extract.clone(),
            assertions: self.assertions.clone(),
        }
    }

    /// Human-readable label: the request name, else `METHOD url`.
    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("{} {}", self.method.to_ascii_uppercase(), self.url),
        }
    }

    /// Path portion of the URL (no scheme, host or query). Falls back to the
    /// raw URL text when it does not parse, e.g. while placeholders remain.
    pub fn url_path(&self) -> String {
        if let Some(path) = self.path.as_deref().filter(|p| !p.is_empty()) {
            return path.to_string();
        }
        match reqwest::Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => {
                let without_query = self.url.split(['?', '#']).next().unwrap_or_default();
                match without_query.split_once("://") {
                    Some((_, rest)) => rest
                        .find('/')
                        .map(|idx| rest[idx..].to_string())
                        .unwrap_or_else(|| "/".to_string()),
                    None => without_query.to_string(),
                }
            }
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substituted_resolves_every_part_and_leaves_template_alone() {
        let template = Request::new("POST", "{{base}}/users")
            .with_header("X-{{kind}}", "Bearer {{token}}")
            .with_body(r#"{"name":"${name}"}"#);

        let mut vars = HashMap::new();
        vars.insert("base".to_string(), "http://localhost:8080".to_string());
        vars.insert("kind".to_string(), "Auth".to_string());
        vars.insert("token".to_string(), "abc".to_string());
        vars.insert("name".to_string(), "Alice".to_string());

        let resolved = template.substituted(&vars);
        assert_eq!(resolved.url, "http://localhost:8080/users");
        assert_eq!(resolved.headers[0], ("X-Auth".to_string(), "Bearer abc".to_string()));
        assert_eq!(resolved.body.as_deref(), Some(r#"{"name":"Alice"}"#));
        assert_eq!(template.url, "{{base}}/users");
    }

    #[test]
    fn url_path_strips_host_and_query() {
        let request = Request::new("GET", "https://api.example.com/v1/users?page=2");
        assert_eq!(request.url_path(), "/v1/users");
    }

    #[test]
    fn url_path_handles_unresolved_placeholders() {
        let request = Request::new("GET", "{{base}}/users/{{id}}?x=1");
        assert_eq!(request.url_path(), "{{base}}/users/{{id}}");

        let request = Request::new("GET", "http://{{host}}/users");
        assert_eq!(request.url_path(), "/users");
    }

    #[test]
    fn display_name_prefers_name() {
        let request = Request::new("get", "http://x/a");
        assert_eq!(request.display_name(), "GET http://x/a");
        assert_eq!(request.with_name("List").display_name(), "List");
    }
}
