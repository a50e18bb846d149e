//! HTTP transport shared by every vendor client.
//!
//! [`Transport`] wraps `reqwest::Client` for one vendor endpoint. It issues a
//! single request per [`Transport::send`] and returns the parsed JSON body, or
//! a classified [`Error`]. Retries and circuit breaking live one layer up in
//! [`crate::resilience`].
//!
//! ## Authentication
//!
//! - HTTP Basic (Redfish, Warewulf)
//! - Bearer API key (TrueNAS)
//! - Arbitrary header (pfSense `X-API-Key`, Proxmox `PVEAPIToken`)
//! - JWT obtained from a vendor login endpoint, cached, refreshed once on 401
//!
//! ## Error handling
//!
//! 401/403 become [`Error::Authentication`]. Other non-2xx responses become
//! [`Error::VendorApi`] with the message pulled from the vendor's error body.
//! A 2xx response carrying `text/html` is an unauthenticated redirect to a web
//! login page and is treated as an authentication failure, not as data.

use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};

use crate::error::{Error, Result};
use crate::redact;

/// Longest raw body excerpt kept in a vendor error message.
const MAX_ERROR_BODY: usize = 512;

/// URL scheme of a vendor endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    #[default]
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(Error::validation(format!(
                "protocol must be 'http' or 'https', got '{other}'"
            ))),
        }
    }
}

/// Where a vendor API lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub ssl_verify: bool,
}

impl Endpoint {
    /// `{protocol}://{host}:{port}`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

/// Login exchange for vendors that issue a JWT.
#[derive(Clone)]
pub struct JwtLogin {
    /// Path of the login endpoint, e.g. `/api/v2/auth/jwt`.
    pub login_path: String,
    pub username: String,
    pub password: String,
    /// JSON pointer to the token inside the login response, e.g. `/data/token`.
    pub token_pointer: String,
}

/// How requests authenticate against the vendor.
#[derive(Clone)]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer(String),
    Header { name: String, value: String },
    Jwt(JwtLogin),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Basic { username, .. } => write!(f, "Basic({username}, [REDACTED])"),
            Auth::Bearer(_) => f.write_str("Bearer([REDACTED])"),
            Auth::Header { name, .. } => write!(f, "Header({name}: [REDACTED])"),
            Auth::Jwt(login) => write!(f, "Jwt({} via {})", login.username, login.login_path),
        }
    }
}

/// Connection limits and timeouts.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub timeout: Duration,
    /// Upper bound on concurrent in-flight requests through one transport.
    pub max_in_flight: usize,
    /// Idle connections kept per host.
    pub max_idle_per_host: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            max_in_flight: 100,
            max_idle_per_host: 30,
        }
    }
}

/// One outbound request: verb, path, optional extra path segments (encoded),
/// query pairs and JSON body.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    segments: Vec<String>,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            segments: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Append one path segment. Reserved characters (including `/`) are
    /// percent-encoded, so identifiers like `tank/media` stay one segment.
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// `true` when sending this request twice has the same effect as once.
    pub fn is_idempotent(&self) -> bool {
        self.method.is_idempotent()
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// HTTP client for a single vendor endpoint.
pub struct Transport {
    http: reqwest::Client,
    base: Url,
    base_url: String,
    auth: Auth,
    jwt: RwLock<Option<String>>,
    in_flight: Semaphore,
}

impl Transport {
    /// Build a transport. Fails with [`Error::Configuration`] when the endpoint
    /// is unusable; no network I/O happens here.
    pub fn new(endpoint: &Endpoint, auth: Auth, options: &TransportOptions) -> Result<Self> {
        if endpoint.host.trim().is_empty() {
            return Err(Error::configuration("vendor host is empty"));
        }
        let base_url = endpoint.base_url();
        let base = Url::parse(&base_url)
            .map_err(|e| Error::configuration(format!("invalid vendor URL {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::configuration(format!(
                "vendor URL {base_url} cannot carry a path"
            )));
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("infra-mcp/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(options.connect_timeout)
            .timeout(options.timeout)
            .pool_max_idle_per_host(options.max_idle_per_host)
            .danger_accept_invalid_certs(!endpoint.ssl_verify)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base,
            base_url,
            auth,
            jwt: RwLock::new(None),
            in_flight: Semaphore::new(options.max_in_flight.max(1)),
        })
    }

    /// The vendor's base URL, without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue one request and return the parsed JSON body.
    ///
    /// For JWT auth a 401 drops the cached token and the request is replayed
    /// once with a fresh login.
    pub async fn send(&self, request: &Request) -> Result<Value> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| Error::internal("transport is shut down"))?;

        let resp = self.dispatch(request).await?;
        if resp.status() == StatusCode::UNAUTHORIZED && matches!(self.auth, Auth::Jwt(_)) {
            tracing::debug!(url = %self.base_url, "JWT rejected, logging in again");
            *self.jwt.write().await = None;
            let retried = self.dispatch(request).await?;
            return handle_response(retried).await;
        }
        handle_response(resp).await
    }

    fn url_for(&self, path: &str, segments: &[String], query: &[(String, String)]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|()| Error::configuration("vendor URL cannot carry a path"))?;
            parts.pop_if_empty();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                parts.push(part);
            }
            for segment in segments {
                parts.push(segment);
            }
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn dispatch(&self, request: &Request) -> Result<reqwest::Response> {
        let url = self.url_for(&request.path, &request.segments, &request.query)?;
        tracing::trace!(method = %request.method, %url, "vendor request");
        let mut builder = self.http.request(request.method.clone(), url);
        builder = self.authorize(builder).await?;
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }

    async fn authorize(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        Ok(match &self.auth {
            Auth::None => builder,
            Auth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::Header { name, value } => {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| Error::configuration(format!("invalid auth header name: {e}")))?;
                let mut value = HeaderValue::from_str(value)
                    .map_err(|e| Error::configuration(format!("invalid auth header value: {e}")))?;
                value.set_sensitive(true);
                builder.header(name, value)
            }
            Auth::Jwt(login) => builder.bearer_auth(self.jwt_token(login).await?),
        })
    }

    async fn jwt_token(&self, login: &JwtLogin) -> Result<String> {
        if let Some(token) = self.jwt.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut slot = self.jwt.write().await;
        // Another task may have logged in while we waited for the write lock
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }

        let url = self.url_for(&login.login_path, &[], &[])?;
        let resp = self
            .http
            .post(url)
            .json(&json!({ "username": login.username, "password": login.password }))
            .send()
            .await?;
        let body = handle_response(resp).await?;
        let token = body
            .pointer(&login.token_pointer)
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::authentication("login response did not contain a token"))?
            .to_string();

        tracing::debug!(url = %self.base_url, "obtained JWT");
        *slot = Some(token.clone());
        Ok(token)
    }
}

/// Parse a vendor response: JSON body on success, classified error otherwise.
async fn handle_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let is_html = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html"));
    let body = resp.text().await?;

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::Authentication(format!(
            "HTTP {}: {}",
            status.as_u16(),
            error_message(&body)
        )));
    }
    if !status.is_success() {
        return Err(Error::VendorApi {
            status: status.as_u16(),
            message: error_message(&body),
        });
    }
    if is_html {
        return Err(Error::authentication(
            "vendor returned an HTML page instead of JSON (likely a login redirect)",
        ));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| Error::VendorApi {
        status: status.as_u16(),
        message: format!("invalid JSON in response: {e}"),
    })
}

/// Pull a human-readable message out of a vendor error body.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        // Redfish nests it under error.message
        if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
            return message.to_string();
        }
        for key in ["message", "error", "detail", "errors"] {
            match value.get(key) {
                Some(Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(Value::Null) | None => {}
                Some(other) => return redact::summarize(&other.to_string(), MAX_ERROR_BODY),
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        redact::summarize(trimmed, MAX_ERROR_BODY)
    }
}
