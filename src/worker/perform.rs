//! The HTTP seam: one request, one exchange, one response.
//!
//! The pipeline never talks to the network directly; it hands an
//! [`ApiRequest`] to a [`Perform`] implementation and gets back status,
//! headers and body. A reqwest-backed implementation is provided.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;

use crate::routes::RouteInfo;

const AUDIT_REASON_HEADER: &str = "x-audit-log-reason";

/// Errors a performer may surface; wrapped into the crate error with
/// method, path and retry count by the pipeline.
pub type PerformError = Box<dyn std::error::Error + Send + Sync>;

/// One logical API call as the pipeline sees it.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Concrete path relative to the API base, e.g. `/channels/123/messages`.
    pub path: String,
    /// The rate limit identity derived from the path.
    pub info: RouteInfo,
    /// JSON body, if any.
    pub body: Option<serde_json::Value>,
    /// Value for the audit log reason header, if any.
    pub reason: Option<String>,
    /// Whether to attach the bearer credential.
    pub auth: bool,
    /// Transport/5xx retries consumed so far.
    pub retries: u32,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let info = RouteInfo::parse(&method, &path);
        Self {
            method,
            path,
            info,
            body: None,
            reason: None,
            auth: true,
            retries: 0,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.auth = false;
        self
    }
}

/// Raw result of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A parsed response body, decided by content type.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Json(serde_json::Value),
    Binary(Bytes),
    Empty,
}

impl HttpResponse {
    /// Whether the status is a 2xx or 3xx.
    pub fn is_ok(&self) -> bool {
        (200..400).contains(&self.status)
    }

    /// Parse the body as JSON or raw bytes depending on content type.
    pub fn parse(&self) -> Result<ApiResponse, serde_json::Error> {
        if self.body.is_empty() {
            return Ok(ApiResponse::Empty);
        }
        let json = self
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);
        if json {
            Ok(ApiResponse::Json(serde_json::from_slice(&self.body)?))
        } else {
            Ok(ApiResponse::Binary(self.body.clone()))
        }
    }
}

/// Performs one HTTP exchange for the pipeline.
#[async_trait]
pub trait Perform: Send + Sync {
    async fn perform(&self, request: &ApiRequest) -> Result<HttpResponse, PerformError>;
}

/// reqwest-backed performer attaching base URL, credential and user agent.
pub struct ReqwestPerformer {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    user_agent: String,
}

impl ReqwestPerformer {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token,
            user_agent: format!("ratebridge/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl Perform for ReqwestPerformer {
    async fn perform(&self, request: &ApiRequest) -> Result<HttpResponse, PerformError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .header(USER_AGENT, &self.user_agent);

        if request.auth {
            if let Some(token) = &self.token {
                builder = builder.header(AUTHORIZATION, token);
            }
        }
        if let Some(reason) = &request.reason {
            builder = builder.header(AUDIT_REASON_HEADER, reason);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
