//! The HTTP client every API call goes through.
//!
//! Outgoing requests get a bearer token and a tenant header when they can be
//! resolved. Failed responses are classified: 401 tears the session down
//! once per burst, other failures raise a notice. The error always reaches
//! the caller as well.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::config::Config;
use crate::session::SessionContext;

/// Which rows of the incoming-stage table an instance implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reactions {
    /// 401 teardown plus notices for every other classified failure.
    Full,
    /// 401 teardown only. Used by the binary (image) client.
    AuthOnly,
}

/// Per-request switches for the two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    pub attach_auth: bool,
    pub react: bool,
}

impl RequestPolicy {
    pub const STANDARD: Self = Self {
        attach_auth: true,
        react: true,
    };

    /// Credential exchange: no stored token sent, and a 401 means bad
    /// credentials rather than an expired session.
    pub const ANONYMOUS: Self = Self {
        attach_auth: false,
        react: false,
    };

    /// Authenticated, but failures are only returned (best-effort calls).
    pub const QUIET: Self = Self {
        attach_auth: true,
        react: false,
    };
}

/// `{success, message?, data}` wrapper the API puts around payloads.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn into_data(self) -> Result<T, ApiError> {
        if !self.success {
            return Err(ApiError::Rejected(
                self.message
                    .unwrap_or_else(|| "The request was not accepted".to_string()),
            ));
        }
        self.data
            .ok_or_else(|| ApiError::InvalidResponse("Response is missing data".to_string()))
    }
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpPipeline {
    client: Client,
    base_url: String,
    ctx: Arc<SessionContext>,
    reactions: Reactions,
}

impl HttpPipeline {
    pub fn new(config: &Config, ctx: Arc<SessionContext>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(ApiError::Network)?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            ctx,
            reactions: Reactions::Full,
        })
    }

    /// Parallel instance for image payloads, sharing the connection pool and
    /// session state but reacting to 401 only.
    pub fn binary(&self) -> Self {
        Self {
            reactions: Reactions::AuthOnly,
            ..self.clone()
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn reactions(&self) -> Reactions {
        self.reactions
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Start a request against the API. Send it with `send`.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    pub async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        self.send_with(request, RequestPolicy::STANDARD).await
    }

    pub async fn send_with(
        &self,
        request: RequestBuilder,
        policy: RequestPolicy,
    ) -> Result<Response, ApiError> {
        let mut request = request.build().map_err(ApiError::from_transport)?;
        if policy.attach_auth {
            self.attach_headers(request.headers_mut());
        }
        let method = request.method().clone();
        let url = request.url().clone();

        let error = match self.client.execute(request).await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                debug!(%method, %url, %status, "Request failed");
                ApiError::from_status(status, &body)
            }
            Err(e) => {
                debug!(%method, %url, error = %e, "Request did not complete");
                ApiError::from_transport(e)
            }
        };

        if policy.react {
            self.react(&error);
        }
        Err(error)
    }

    // ===== Outgoing stage =====

    fn attach_headers(&self, headers: &mut HeaderMap) {
        if !headers.contains_key(AUTHORIZATION) {
            if let Some(value) = self.ctx.auth_header_value() {
                match HeaderValue::from_str(&value) {
                    Ok(mut value) => {
                        value.set_sensitive(true);
                        headers.insert(AUTHORIZATION, value);
                    }
                    Err(e) => warn!(error = %e, "Stored token is not a valid header value"),
                }
            }
        }

        if let Some(affiliation) = self.ctx.affiliation() {
            let (name, value) = affiliation.tenant_header();
            let name = HeaderName::from_static(name);
            if !headers.contains_key(&name) {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(name, value);
                }
            }
        }
    }

    // ===== Incoming stage =====

    fn react(&self, error: &ApiError) {
        if error.is_unauthorized() {
            self.ctx.handle_unauthorized();
            return;
        }
        if self.reactions == Reactions::Full {
            if let Some(notice) = error.notice() {
                self.ctx.notify(notice);
            }
        }
    }

    // ===== JSON helpers =====

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        policy: RequestPolicy,
    ) -> Result<T, ApiError> {
        let response = self.send_with(request, policy).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(self.request(Method::GET, path), RequestPolicy::STANDARD)
            .await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(self.request(Method::POST, path).json(body), RequestPolicy::STANDARD)
            .await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(self.request(Method::PUT, path).json(body), RequestPolicy::STANDARD)
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(self.request(Method::DELETE, path)).await?;
        Ok(())
    }

    /// Send a request and unwrap the API envelope.
    pub async fn call<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        policy: RequestPolicy,
    ) -> Result<T, ApiError> {
        let envelope: Envelope<T> = self.send_json(request, policy).await?;
        envelope.into_data()
    }

    // ===== Binary helpers =====

    pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        let response = self.send(self.request(Method::GET, path)).await?;
        let bytes = response.bytes().await.map_err(ApiError::from_transport)?;
        Ok(bytes.to_vec())
    }

    pub async fn put_bytes(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<Response, ApiError> {
        let request = self
            .request(Method::PUT, path)
            .header(CONTENT_TYPE, content_type)
            .body(bytes);
        self.send(request).await
    }
}
