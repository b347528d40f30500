//! Typed endpoints of the remote auth API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::pipeline::{HttpPipeline, RequestPolicy};
use super::ApiError;
use crate::models::{deserialize_expiry, Credential, UserPayload, UserProfile};

pub const LOGIN_PATH: &str = "/auth/login";
pub const WHO_AM_I_PATH: &str = "/auth/me";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInData {
    user: UserPayload,
    token: String,
    #[serde(deserialize_with = "deserialize_expiry")]
    token_expiry: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WhoAmIData {
    user: UserPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenewalData {
    token: String,
    #[serde(deserialize_with = "deserialize_expiry")]
    token_expiry: DateTime<Utc>,
}

/// Result of a successful credential exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct SignInOutcome {
    pub credential: Credential,
    pub profile: UserProfile,
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_in(&self, identifier: &str, secret: &str) -> Result<SignInOutcome, ApiError>;

    async fn who_am_i(&self) -> Result<UserProfile, ApiError>;

    async fn sign_out(&self) -> Result<(), ApiError>;
}

/// The single renewal HTTP call, behind a seam so the scheduler can be
/// driven by fakes.
#[async_trait]
pub trait TokenRenewer: Send + Sync {
    async fn renew(&self) -> Result<Credential, ApiError>;
}

pub struct AuthApi {
    pipeline: Arc<HttpPipeline>,
}

impl AuthApi {
    pub fn new(pipeline: Arc<HttpPipeline>) -> Self {
        Self { pipeline }
    }

    fn profile_from(payload: UserPayload) -> Result<UserProfile, ApiError> {
        UserProfile::try_from(payload).map_err(ApiError::InvalidResponse)
    }
}

#[async_trait]
impl AuthBackend for AuthApi {
    async fn sign_in(&self, identifier: &str, secret: &str) -> Result<SignInOutcome, ApiError> {
        let request = self
            .pipeline
            .request(Method::POST, LOGIN_PATH)
            .json(&LoginRequest {
                email: identifier,
                password: secret,
            });
        let data: SignInData = self.pipeline.call(request, RequestPolicy::ANONYMOUS).await?;

        Ok(SignInOutcome {
            credential: Credential::new(data.token, data.token_expiry),
            profile: Self::profile_from(data.user)?,
        })
    }

    async fn who_am_i(&self) -> Result<UserProfile, ApiError> {
        let request = self.pipeline.request(Method::GET, WHO_AM_I_PATH);
        let data: WhoAmIData = self.pipeline.call(request, RequestPolicy::STANDARD).await?;
        Self::profile_from(data.user)
    }

    async fn sign_out(&self) -> Result<(), ApiError> {
        let request = self.pipeline.request(Method::POST, LOGOUT_PATH);
        self.pipeline.send_with(request, RequestPolicy::QUIET).await?;
        debug!("Remote session closed");
        Ok(())
    }
}

#[async_trait]
impl TokenRenewer for AuthApi {
    async fn renew(&self) -> Result<Credential, ApiError> {
        let request = self.pipeline.request(Method::POST, REFRESH_PATH);
        let data: RenewalData = self.pipeline.call(request, RequestPolicy::STANDARD).await?;
        Ok(Credential::new(data.token, data.token_expiry))
    }
}
