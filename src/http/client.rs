use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::method::HttpMethod;
use super::request::Request;
use super::response::Response;
use super::session::SessionStore;
use super::transport::{OutboundRequest, RetryingTransport, TransportOutcome};
use crate::auth::{provider_for, AuthConfig, AuthProvider};
use crate::collections::RequestFile;
use crate::engine::cancel::ensure_active;
use crate::environment::{placeholders, VariableStore};
use crate::error::{CheckError, CheckResult};

/// Executes one request at a time: substitution, auth, cookies, retries,
/// timing. Shared by every worker of a run.
pub struct HttpExecutor {
    transport: RetryingTransport,
    sessions: Option<Arc<SessionStore>>,
    variables: VariableStore,
    auth: Option<Arc<dyn AuthProvider>>,
    /// Request-level OAuth2 providers, kept so their tokens survive between
    /// requests that share the same descriptor.
    oauth_providers: Mutex<HashMap<String, Arc<dyn AuthProvider>>>,
    cancel: CancellationToken,
}

impl HttpExecutor {
    pub fn new(transport: RetryingTransport, cancel: CancellationToken) -> Self {
        Self {
            transport,
            sessions: Some(Arc::new(SessionStore::new())),
            variables: VariableStore::new(),
            auth: None,
            oauth_providers: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// `None` disables cookie handling entirely.
    pub fn with_sessions(mut self, sessions: Option<Arc<SessionStore>>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_variables(mut self, variables: VariableStore) -> Self {
        self.variables = variables;
        self
    }

    /// Provider used for requests that carry no auth descriptor of their own.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn sessions(&self) -> Option<&Arc<SessionStore>> {
        self.sessions.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn resolve_provider(&self, auth: Option<&AuthConfig>) -> Option<Arc<dyn AuthProvider>> {
        let config = match auth {
            None => return self.auth.clone(),
            Some(config) => config,
        };
        let AuthConfig::OAuth2(oauth) = config else {
            return Some(provider_for(config, self.transport.sender()));
        };

        let key = format!("{}|{}", oauth.token_url, oauth.client_id);
        let mut providers = self.oauth_providers.lock();
        Some(
            providers
                .entry(key)
                .or_insert_with(|| provider_for(config, self.transport.sender()))
                .clone(),
        )
    }

    fn build_outbound(&self, request: &Request) -> CheckResult<OutboundRequest> {
        let method: HttpMethod = request.method.parse()?;
        let url = Url::parse(request.url.trim())
            .map_err(|err| CheckError::RequestConstruction(format!("Invalid URL `{}`: {err}", request.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CheckError::RequestConstruction(format!(
                "Unsupported URL scheme `{}`",
                url.scheme()
            )));
        }

        let mut outbound = OutboundRequest::new(method, url);
        for (name, value) in &request.headers {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            outbound.headers.push((name.to_string(), value.trim().to_string()));
        }
        validate_headers(&outbound)?;

        if let Some(body) = request.body.as_deref().filter(|body| !body.trim().is_empty()) {
            outbound.body = Some(Bytes::from(body.to_string()));
        }

        Ok(outbound)
    }

    fn attach_cookies(&self, outbound: &mut OutboundRequest) {
        let Some(sessions) = &self.sessions else {
            return;
        };
        let Some(jar_header) = sessions.cookie_header(&outbound.host()) else {
            return;
        };
        let combined = match outbound.header("Cookie") {
            Some(existing) if !existing.trim().is_empty() => format!("{existing}; {jar_header}"),
            _ => jar_header,
        };
        outbound.set_header("Cookie", combined);
    }

    async fn send_with_auth(
        &self,
        outbound: &OutboundRequest,
        provider: Option<&Arc<dyn AuthProvider>>,
    ) -> CheckResult<TransportOutcome> {
        let mut attempt_request = outbound.clone();
        if let Some(provider) = provider {
            provider.apply_auth(&mut attempt_request, &self.cancel).await?;
            validate_headers(&attempt_request)?;
        }

        let outcome = self.transport.send(&attempt_request, &self.cancel).await?;

        match provider {
            Some(provider) if outcome.response.status == 401 && provider.can_refresh() => {
                info!(kind = %provider.kind(), url = %outbound.url, "401 received, refreshing credentials");
                provider
                    .refresh_auth(attempt_request.header("Authorization"), &self.cancel)
                    .await?;

                let mut retry_request = outbound.clone();
                provider.apply_auth(&mut retry_request, &self.cancel).await?;
                validate_headers(&retry_request)?;
                let retried = self.transport.send(&retry_request, &self.cancel).await?;
                Ok(TransportOutcome {
                    attempts: outcome.attempts + retried.attempts,
                    response: retried.response,
                })
            }
            _ => Ok(outcome),
        }
    }

    /// Executes `request` with the run-scoped variables overlaid by
    /// `run_variables` (call-supplied values win).
    pub async fn execute(
        &self,
        request: &Request,
        run_variables: &HashMap<String, String>,
    ) -> CheckResult<Response> {
        ensure_active(&self.cancel)?;

        let mut variables = self.variables.snapshot();
        for (key, value) in run_variables {
            variables.insert(key.clone(), value.clone());
        }

        let resolved = request.substituted(&variables);
        let unresolved = placeholders(&resolved.url);
        if !unresolved.is_empty() {
            debug!(url = %resolved.url, ?unresolved, "URL still contains placeholders");
        }

        let mut outbound = self.build_outbound(&resolved)?;
        let provider = self.resolve_provider(resolved.auth.as_ref());
        self.attach_cookies(&mut outbound);
        let host = outbound.host();

        let started = Instant::now();
        let outcome = self.send_with_auth(&outbound, provider.as_ref()).await?;
        let duration = started.elapsed();

        let raw = outcome.response;
        if let Some(sessions) = &self.sessions {
            sessions.store_set_cookie_headers(
                &host,
                raw.headers
                    .iter()
                    .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
                    .map(|(_, value)| value.as_str()),
            );
        }

        let content_type = raw.header("content-type").unwrap_or_default().to_string();
        let content_length = raw.body.len() as u64;
        let correlation_id = Uuid::new_v4().to_string();

        debug!(
            method = %outbound.method,
            url = %outbound.url,
            status = raw.status,
            attempts = outcome.attempts,
            elapsed_ms = duration.as_millis() as u64,
            correlation_id = %correlation_id,
            "request executed"
        );

        Ok(Response {
            status: raw.status,
            status_text: raw.status_text,
            headers: raw.headers,
            body: raw.body,
            content_type,
            content_length,
            duration,
            timestamp: Utc::now(),
            request: Arc::new(resolved),
            correlation_id,
            attempts: outcome.attempts,
        })
    }

    /// Runs `requests` in order. A failing request is logged and skipped;
    /// cancellation still stops the batch.
    pub async fn execute_batch(
        &self,
        requests: &[Request],
        run_variables: &HashMap<String, String>,
    ) -> Vec<Response> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            match self.execute(request, run_variables).await {
                Ok(response) => responses.push(response),
                Err(CheckError::Cancelled) => {
                    warn!("batch cancelled after {} response(s)", responses.len());
                    break;
                }
                Err(err) => warn!(request = %request.display_name(), error = %err, "skipping failed request"),
            }
        }
        responses
    }

    pub async fn execute_file(
        &self,
        file: &RequestFile,
        run_variables: &HashMap<String, String>,
    ) -> Vec<Response> {
        debug!(file = %file.path, requests = file.requests.len(), "executing request file");
        self.execute_batch(&file.requests, run_variables).await
    }
}

/// Rejects headers the transport could not encode, before anything is sent.
fn validate_headers(outbound: &OutboundRequest) -> CheckResult<()> {
    for (name, value) in &outbound.headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(CheckError::RequestConstruction(format!("Invalid header name `{name}`")));
        }
        if HeaderValue::from_str(value).is_err() {
            return Err(CheckError::RequestConstruction(format!("Invalid header value for `{name}`")));
        }
    }
    Ok(())
}
