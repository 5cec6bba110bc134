//! # Authentication
//!
//! Providers that decorate an outbound request with credentials. Basic,
//! Bearer and API-key providers are static; OAuth2 owns a token that it
//! fetches and refreshes on demand.

mod oauth2;

pub use oauth2::{OAuth2Config, OAuth2GrantType, OAuth2Provider};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::environment::interpolate;
use crate::error::{CheckError, CheckResult};
use crate::http::transport::{OutboundRequest, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Basic,
    Bearer,
    ApiKey,
    OAuth2,
}

impl Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthKind::Basic => "basic",
            AuthKind::Bearer => "bearer",
            AuthKind::ApiKey => "api_key",
            AuthKind::OAuth2 => "oauth2",
        };
        write!(f, "{label}")
    }
}

/// Where to place the API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

/// Auth descriptor carried by a request or configured for a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Basic {
        username: String,
        #[serde(default)]
        password: String,
    },
    Bearer {
        token: String,
    },
    ApiKey {
        key: String,
        value: String,
        #[serde(default)]
        location: ApiKeyLocation,
    },
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Config),
}

impl AuthConfig {
    pub fn substituted(&self, variables: &HashMap<String, String>) -> AuthConfig {
        let sub = |value: &str| interpolate(value, variables);
        match self {
            AuthConfig::Basic { username, password } => AuthConfig::Basic {
                username: sub(username),
                password: sub(password),
            },
            AuthConfig::Bearer { token } => AuthConfig::Bearer { token: sub(token) },
            AuthConfig::ApiKey {
                key,
                value,
                location,
            } => AuthConfig::ApiKey {
                key: sub(key),
                value: sub(value),
                location: *location,
            },
            AuthConfig::OAuth2(config) => AuthConfig::OAuth2(config.substituted(variables)),
        }
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn kind(&self) -> AuthKind;

    async fn apply_auth(
        &self,
        request: &mut OutboundRequest,
        cancel: &CancellationToken,
    ) -> CheckResult<()>;

    /// Renews credentials after `rejected` (the `Authorization` value the
    /// server refused) failed. `None` forces a renewal.
    async fn refresh_auth(&self, rejected: Option<&str>, cancel: &CancellationToken) -> CheckResult<()>;

    /// Whether a 401 is worth a refresh-and-resend.
    fn can_refresh(&self) -> bool {
        false
    }
}

pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn header_value(&self) -> String {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }
}

#[async_trait]
impl AuthProvider for BasicAuth {
    fn kind(&self) -> AuthKind {
        AuthKind::Basic
    }

    async fn apply_auth(&self, request: &mut OutboundRequest, _: &CancellationToken) -> CheckResult<()> {
        if self.username.trim().is_empty() {
            return Err(CheckError::Auth("Basic auth username cannot be empty".to_string()));
        }
        request.set_header("Authorization", self.header_value());
        Ok(())
    }

    async fn refresh_auth(&self, _: Option<&str>, _: &CancellationToken) -> CheckResult<()> {
        Ok(())
    }
}

pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for BearerAuth {
    fn kind(&self) -> AuthKind {
        AuthKind::Bearer
    }

    async fn apply_auth(&self, request: &mut OutboundRequest, _: &CancellationToken) -> CheckResult<()> {
        let token = self.token.trim();
        if token.is_empty() {
            return Err(CheckError::Auth("Bearer token cannot be empty".to_string()));
        }
        request.set_header("Authorization", format!("Bearer {token}"));
        Ok(())
    }

    async fn refresh_auth(&self, _: Option<&str>, _: &CancellationToken) -> CheckResult<()> {
        Ok(())
    }
}

pub struct ApiKeyAuth {
    key: String,
    value: String,
    location: ApiKeyLocation,
}

impl ApiKeyAuth {
    pub fn new(key: impl Into<String>, value: impl Into<String>, location: ApiKeyLocation) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            location,
        }
    }
}

#[async_trait]
impl AuthProvider for ApiKeyAuth {
    fn kind(&self) -> AuthKind {
        AuthKind::ApiKey
    }

    async fn apply_auth(&self, request: &mut OutboundRequest, _: &CancellationToken) -> CheckResult<()> {
        let key = self.key.trim();
        if key.is_empty() {
            return Err(CheckError::Auth("API key name cannot be empty".to_string()));
        }
        match self.location {
            ApiKeyLocation::Header => request.set_header(key, self.value.trim()),
            ApiKeyLocation::Query => {
                request
                    .url
                    .query_pairs_mut()
                    .append_pair(key, self.value.trim());
            }
        }
        Ok(())
    }

    async fn refresh_auth(&self, _: Option<&str>, _: &CancellationToken) -> CheckResult<()> {
        Ok(())
    }
}

/// Builds a provider for `config`. OAuth2 token requests go out through
/// `sender` without the retry layer.
pub fn provider_for(config: &AuthConfig, sender: Arc<dyn Sender>) -> Arc<dyn AuthProvider> {
    match config {
        AuthConfig::Basic { username, password } => Arc::new(BasicAuth::new(username, password)),
        AuthConfig::Bearer { token } => Arc::new(BearerAuth::new(token)),
        AuthConfig::ApiKey {
            key,
            value,
            location,
        } => Arc::new(ApiKeyAuth::new(key, value, *location)),
        AuthConfig::OAuth2(config) => Arc::new(OAuth2Provider::new(config.clone(), sender)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::method::HttpMethod;
    use crate::http::transport::fake::FakeSender;
    use reqwest::Url;

    fn outbound() -> OutboundRequest {
        OutboundRequest::new(HttpMethod::Get, Url::parse("http://localhost/items").unwrap())
    }

    #[tokio::test]
    async fn basic_sets_encoded_header() {
        let mut request = outbound();
        BasicAuth::new("user", "pass")
            .apply_auth(&mut request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(request.header("authorization"), Some("Basic dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn bearer_replaces_existing_authorization() {
        let mut request = outbound();
        request.set_header("Authorization", "stale");
        BearerAuth::new("abc")
            .apply_auth(&mut request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(request.header("Authorization"), Some("Bearer abc"));
        assert_eq!(request.headers.len(), 1);
    }

    #[tokio::test]
    async fn empty_bearer_token_is_rejected() {
        let mut request = outbound();
        let err = BearerAuth::new("  ")
            .apply_auth(&mut request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Auth(_)));
    }

    #[tokio::test]
    async fn api_key_in_query() {
        let mut request = outbound();
        ApiKeyAuth::new("api_key", "secret", ApiKeyLocation::Query)
            .apply_auth(&mut request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(request.url.as_str(), "http://localhost/items?api_key=secret");
    }

    #[test]
    fn config_substitutes_placeholders() {
        let mut vars = HashMap::new();
        vars.insert("token".to_string(), "t-1".to_string());
        let config = AuthConfig::Bearer {
            token: "{{token}}".into(),
        };
        assert_eq!(
            config.substituted(&vars),
            AuthConfig::Bearer {
                token: "t-1".into()
            }
        );
    }

    #[test]
    fn config_deserializes_tagged() {
        let config: AuthConfig =
            serde_json::from_str(r#"{"type":"basic","username":"u","password":"p"}"#).unwrap();
        assert_eq!(
            config,
            AuthConfig::Basic {
                username: "u".into(),
                password: "p".into()
            }
        );

        let provider = provider_for(&config, Arc::new(FakeSender::scripted([])));
        assert_eq!(provider.kind(), AuthKind::Basic);
        assert!(!provider.can_refresh());
    }
}
