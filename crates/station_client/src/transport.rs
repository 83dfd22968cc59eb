//! Wire-level request/response primitives and the HTTP transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::config::ApiConfig;
use common::{Error, Result};
use reqwest::Method;
use std::time::Duration;
use tracing::debug;

pub const AUTHORIZATION: &str = "authorization";
pub const RETRY_AFTER: &str = "retry-after";

/// An outbound call as seen by interceptors. Paths are relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        let mut req = Self::new(Method::POST, path);
        req.body = Some(body);
        req
    }

    pub fn with_query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    /// Header lookup; names compare case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace any existing value for `name`.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push((name.to_ascii_lowercase(), value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn set_bearer(&mut self, token: &str) {
        self.set_header(AUTHORIZATION, format!("Bearer {token}"));
    }

    /// The bearer token this request carries, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.header(AUTHORIZATION)
            .and_then(|v| v.strip_prefix("Bearer "))
    }

    /// Whether the call changes server state (drives read vs write pacing).
    pub fn is_write(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Wait requested by the server, as delta-seconds or an HTTP date.
    ///
    /// A date in the past yields zero.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        let raw = self.header(RETRY_AFTER)?.trim();
        if let Ok(secs) = raw.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
        Some((at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Classify a non-success response, keeping the server's pacing hint.
    pub fn error(&self) -> Error {
        match Error::from_status(self.status, &self.text()) {
            Error::RateLimited { message, .. } => Error::RateLimited {
                retry_after_ms: self
                    .retry_after(Utc::now())
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                message,
            },
            other => other,
        }
    }
}

/// Sends one request. Any HTTP status is `Ok`; `Err` means no response arrived.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

/// [`Transport`] over a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: url::Url,
}

impl ReqwestTransport {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = url::Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid api.base_url '{}': {e}", config.base_url)))?;

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<url::Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::BadRequest(format!("invalid request path '{path}': {e}")))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = self.url(&request.path)?;
        let mut req = self.client.request(request.method.clone(), url);
        if !request.query.is_empty() {
            req = req.query(&request.query);
        }
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(ref body) = request.body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(network_error)?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = resp.bytes().await.map_err(network_error)?.to_vec();

        debug!("{} {} -> {} ({} bytes)", request.method, request.path, status, body.len());
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

fn network_error(e: reqwest::Error) -> Error {
    Error::Network {
        timeout: e.is_timeout(),
        message: e.to_string(),
    }
}
