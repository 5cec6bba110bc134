//! Per-host cookie jar shared by every worker of a run. In-memory only.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            expires: None,
            secure: false,
            http_only: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Parse one `Set-Cookie` header value. Returns `None` when there is no
    /// `name=value` pair.
    pub fn parse(header: &str, now: DateTime<Utc>) -> Option<Cookie> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));
        let mut max_age_seen = false;

        for attribute in parts {
            let attribute = attribute.trim();
            let (key, val) = match attribute.split_once('=') {
                Some((key, val)) => (key.trim(), val.trim()),
                None => (attribute, ""),
            };

            match key.to_ascii_lowercase().as_str() {
                "path" if !val.is_empty() => cookie.path = Some(val.to_string()),
                "domain" if !val.is_empty() => {
                    cookie.domain = Some(val.trim_start_matches('.').to_ascii_lowercase())
                }
                "max-age" => {
                    if let Ok(seconds) = val.parse::<i64>() {
                        max_age_seen = true;
                        cookie.expires = Some(now + ChronoDuration::seconds(seconds));
                    }
                }
                "expires" if !max_age_seen => {
                    if let Ok(expires) = DateTime::parse_from_rfc2822(val) {
                        cookie.expires = Some(expires.with_timezone(&Utc));
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }

        Some(cookie)
    }
}

#[derive(Debug, Default)]
pub struct SessionStore {
    jars: Mutex<HashMap<String, Vec<Cookie>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a cookie of the same name for `host` or appends it. An
    /// already-expired cookie removes the stored one instead.
    pub fn set_cookie(&self, host: &str, cookie: Cookie) {
        let host = host.to_ascii_lowercase();
        let mut jars = self.jars.lock();
        let jar = jars.entry(host.clone()).or_default();

        let existing = jar.iter().position(|c| c.name == cookie.name);
        if cookie.is_expired(Utc::now()) {
            if let Some(idx) = existing {
                jar.remove(idx);
            }
        } else if let Some(idx) = existing {
            jar[idx] = cookie;
        } else {
            jar.push(cookie);
        }

        if jar.is_empty() {
            jars.remove(&host);
        }
    }

    /// Live cookies for `host`. The returned vector is a copy.
    pub fn get_cookies(&self, host: &str) -> Vec<Cookie> {
        let now = Utc::now();
        self.jars
            .lock()
            .get(&host.to_ascii_lowercase())
            .map(|jar| jar.iter().filter(|c| !c.is_expired(now)).cloned().collect())
            .unwrap_or_default()
    }

    /// `Cookie` request header value for `host`, if it has any cookies.
    pub fn cookie_header(&self, host: &str) -> Option<String> {
        let cookies = self.get_cookies(host);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Parses and stores every `Set-Cookie` value received from `host`.
    pub fn store_set_cookie_headers<'a>(&self, host: &str, values: impl IntoIterator<Item = &'a str>) {
        let now = Utc::now();
        for value in values {
            if let Some(cookie) = Cookie::parse(value, now) {
                self.set_cookie(host, cookie);
            }
        }
    }

    pub fn clear(&self, host: &str) {
        self.jars.lock().remove(&host.to_ascii_lowercase());
    }

    pub fn clear_all(&self) {
        self.jars.lock().clear();
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.jars.lock().keys().cloned().collect();
        hosts.sort();
        hosts
    }
}
