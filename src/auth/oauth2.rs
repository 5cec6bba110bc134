use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{AuthKind, AuthProvider};
use crate::engine::cancel::ensure_active;
use crate::environment::interpolate;
use crate::error::{CheckError, CheckResult};
use crate::http::method::HttpMethod;
use crate::http::transport::{OutboundRequest, Sender};

/// Refresh this long before the token actually expires.
const REFRESH_MARGIN_SECS: i64 = 60;
const MAX_ERROR_BODY_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuth2GrantType {
    #[default]
    ClientCredentials,
    Password,
}

impl OAuth2GrantType {
    fn as_str(self) -> &'static str {
        match self {
            OAuth2GrantType::ClientCredentials => "client_credentials",
            OAuth2GrantType::Password => "password",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2Config {
    pub token_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub grant_type: OAuth2GrantType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Seed refresh token; takes precedence over `grant_type` on first fetch.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl OAuth2Config {
    pub fn substituted(&self, variables: &HashMap<String, String>) -> OAuth2Config {
        let sub = |value: &str| interpolate(value, variables);
        OAuth2Config {
            token_url: sub(&self.token_url),
            client_id: sub(&self.client_id),
            client_secret: sub(&self.client_secret),
            scope: self.scope.as_deref().map(sub),
            grant_type: self.grant_type,
            username: self.username.as_deref().map(sub),
            password: self.password.as_deref().map(sub),
            refresh_token: self.refresh_token.as_deref().map(sub),
        }
    }
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(_), Some(expires_at)) => {
                now + ChronoDuration::seconds(REFRESH_MARGIN_SECS) >= expires_at
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// OAuth2 client. The token lives behind an async mutex that is held for the
/// whole refresh, so concurrent callers wait for one in-flight fetch instead
/// of issuing their own.
pub struct OAuth2Provider {
    config: OAuth2Config,
    sender: Arc<dyn Sender>,
    state: Mutex<TokenState>,
}

impl OAuth2Provider {
    pub fn new(config: OAuth2Config, sender: Arc<dyn Sender>) -> Self {
        let state = TokenState {
            refresh_token: config.refresh_token.clone(),
            ..TokenState::default()
        };
        Self {
            config,
            sender,
            state: Mutex::new(state),
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.state.lock().await.access_token.clone()
    }

    fn form_body(&self, state: &TokenState) -> CheckResult<String> {
        let mut form = url::form_urlencoded::Serializer::new(String::new());

        if let Some(refresh_token) = state.refresh_token.as_deref() {
            form.append_pair("grant_type", "refresh_token");
            form.append_pair("refresh_token", refresh_token);
        } else {
            form.append_pair("grant_type", self.config.grant_type.as_str());
            if self.config.grant_type == OAuth2GrantType::Password {
                let username = self.config.username.as_deref().unwrap_or_default();
                if username.is_empty() {
                    return Err(CheckError::Auth(
                        "OAuth2 password grant requires a username".to_string(),
                    ));
                }
                form.append_pair("username", username);
                form.append_pair("password", self.config.password.as_deref().unwrap_or_default());
            }
        }

        form.append_pair("client_id", &self.config.client_id);
        if !self.config.client_secret.is_empty() {
            form.append_pair("client_secret", &self.config.client_secret);
        }
        if let Some(scope) = self.config.scope.as_deref().filter(|s| !s.is_empty()) {
            form.append_pair("scope", scope);
        }

        Ok(form.finish())
    }

    async fn fetch_token(&self, state: &mut TokenState, cancel: &CancellationToken) -> CheckResult<()> {
        ensure_active(cancel)?;

        let url = Url::parse(&self.config.token_url).map_err(|err| {
            CheckError::Auth(format!("Invalid OAuth2 token URL `{}`: {err}", self.config.token_url))
        })?;
        let mut request = OutboundRequest::new(HttpMethod::Post, url);
        request.set_header("Content-Type", "application/x-www-form-urlencoded");
        request.set_header("Accept", "application/json");
        request.body = Some(Bytes::from(self.form_body(state)?));

        debug!(token_url = %self.config.token_url, "requesting OAuth2 token");
        let response = self
            .sender
            .send(&request)
            .await
            .map_err(|failure| CheckError::Auth(format!("OAuth2 token request failed: {}", failure.message)))?;

        if response.status != 200 {
            let capped = &response.body[..response.body.len().min(MAX_ERROR_BODY_BYTES)];
            return Err(CheckError::Auth(format!(
                "OAuth2 token endpoint returned {}: {}",
                response.status,
                String::from_utf8_lossy(capped)
            )));
        }

        let token: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|err| CheckError::Auth(format!("Unparseable OAuth2 token response: {err}")))?;

        let expires_in = token.expires_in.as_ref().and_then(|value| match value {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse::<i64>().ok(),
            _ => None,
        });

        state.access_token = Some(token.access_token);
        state.expires_at = expires_in.map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        if token.refresh_token.is_some() {
            state.refresh_token = token.refresh_token;
        }

        info!(
            token_url = %self.config.token_url,
            expires_in = expires_in.unwrap_or_default(),
            "obtained OAuth2 token"
        );
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for OAuth2Provider {
    fn kind(&self) -> AuthKind {
        AuthKind::OAuth2
    }

    async fn apply_auth(&self, request: &mut OutboundRequest, cancel: &CancellationToken) -> CheckResult<()> {
        let mut state = self.state.lock().await;
        if state.needs_refresh(Utc::now()) {
            self.fetch_token(&mut state, cancel).await?;
        }

        let token = state
            .access_token
            .clone()
            .ok_or_else(|| CheckError::Auth("OAuth2 provider has no access token".to_string()))?;
        request.set_header("Authorization", format!("Bearer {token}"));
        Ok(())
    }

    async fn refresh_auth(&self, rejected: Option<&str>, cancel: &CancellationToken) -> CheckResult<()> {
        let mut state = self.state.lock().await;
        if let (Some(rejected), Some(current)) = (rejected, state.access_token.as_deref()) {
            if rejected != format!("Bearer {current}") {
                debug!(token_url = %self.config.token_url, "token already renewed by another caller");
                return Ok(());
            }
        }
        self.fetch_token(&mut state, cancel).await
    }

    fn can_refresh(&self) -> bool {
        true
    }
}
