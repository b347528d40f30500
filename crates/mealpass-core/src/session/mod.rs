//! Session state and lifecycle.
//!
//! - `SessionContext`: state shared by the pipeline, scheduler and controller
//! - `SessionController`: cold start, sign-in and sign-out
//! - `SessionStack`: everything wired together from a `Config`

pub mod context;
pub mod controller;

use std::sync::Arc;

use anyhow::{Context, Result};

pub use context::{InvalidationReason, SessionContext, SessionEvent, SessionHook};
pub use controller::{SessionController, SignInError};

use crate::api::{AuthApi, HttpPipeline};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::crypto::BlobCodec;
use crate::renewal::RenewalScheduler;
use crate::store;
use crate::vault::CredentialVault;

/// The assembled session layer. `pipeline` serves JSON calls for the rest of
/// the app and `images` is its binary sibling.
pub struct SessionStack {
    pub controller: Arc<SessionController>,
    pub pipeline: Arc<HttpPipeline>,
    pub images: Arc<HttpPipeline>,
}

impl SessionStack {
    /// Build the stack with the storage backend and secret from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = store::open(config.storage, config.storage_dir()?)
            .context("Failed to open credential storage")?;
        let cipher = config.cipher().context("Failed to derive storage key")?;
        let vault = CredentialVault::new(store, BlobCodec::new(Arc::new(cipher)));
        Self::assemble(config, vault, Arc::new(SystemClock))
    }

    /// Build the stack around an existing vault and clock.
    pub fn assemble(config: &Config, vault: CredentialVault, clock: Arc<dyn Clock>) -> Result<Self> {
        let ctx = SessionContext::new(vault, config.teardown_cooldown());
        let pipeline = Arc::new(
            HttpPipeline::new(config, ctx.clone()).context("Failed to build HTTP client")?,
        );
        let images = Arc::new(pipeline.binary());

        let api = Arc::new(AuthApi::new(pipeline.clone()));
        let scheduler = RenewalScheduler::new(
            ctx.clone(),
            api.clone(),
            clock.clone(),
            config.renewal_policy(),
        );
        let controller = SessionController::new(ctx, api, scheduler, clock);

        Ok(Self {
            controller,
            pipeline,
            images,
        })
    }
}
