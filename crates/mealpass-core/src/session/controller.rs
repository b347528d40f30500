//! Session lifecycle as the rest of the app sees it: cold start, sign-in,
//! sign-out and the events that drive navigation.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::context::{InvalidationReason, SessionContext, SessionEvent};
use crate::api::{ApiError, AuthBackend};
use crate::clock::Clock;
use crate::models::UserProfile;
use crate::notice::Notice;
use crate::renewal::{RenewalPhase, RenewalScheduler};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SignInError {
    /// Message from the server, suitable for display.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Api(ApiError),

    #[error("Failed to store session: {0}")]
    Storage(#[from] StoreError),
}

impl From<ApiError> for SignInError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Rejected(message) => SignInError::Rejected(message),
            ApiError::Validation { message, .. } => SignInError::Rejected(message),
            ApiError::Unauthorized => SignInError::Rejected("Invalid email or password".to_string()),
            other => SignInError::Api(other),
        }
    }
}

pub struct SessionController {
    ctx: Arc<SessionContext>,
    backend: Arc<dyn AuthBackend>,
    scheduler: Arc<RenewalScheduler>,
    clock: Arc<dyn Clock>,
}

impl SessionController {
    /// Build the controller and hook it to the pipeline's 401 path so a
    /// rejected session also stops the renewal timer.
    pub fn new(
        ctx: Arc<SessionContext>,
        backend: Arc<dyn AuthBackend>,
        scheduler: Arc<RenewalScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let weak_scheduler = Arc::downgrade(&scheduler);
        ctx.set_session_invalid_hook(Arc::new(move || {
            if let Some(scheduler) = weak_scheduler.upgrade() {
                scheduler.stop();
            }
        }));

        Arc::new(Self {
            ctx,
            backend,
            scheduler,
            clock,
        })
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    // ===== State =====

    /// True only when both the token and the profile are present.
    pub fn is_authenticated(&self) -> bool {
        self.ctx.vault().load_session().is_some()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.ctx.vault().load_session().map(|(_, profile)| profile)
    }

    pub fn current_token(&self) -> Option<String> {
        self.ctx.vault().get_token().map(|credential| credential.token)
    }

    pub fn renewal_phase(&self) -> RenewalPhase {
        self.scheduler.phase()
    }

    /// Renew now, e.g. when the app returns to the foreground. Returns false
    /// when signed out or when a renewal is already running.
    pub fn force_renewal(&self) -> bool {
        self.scheduler.force_renewal()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.ctx.notices()
    }

    // ===== Lifecycle =====

    /// Cold start. Restores a stored session if the server still accepts it.
    /// Returns whether the app starts signed in.
    pub async fn bootstrap(&self) -> bool {
        let vault = self.ctx.vault();
        let migrated = vault.migrate_plaintext();
        if migrated > 0 {
            info!(migrated, "Sealed legacy session entries");
        }

        let Some((credential, cached)) = vault.load_session() else {
            if vault.get_token().is_some() || vault.get_profile().is_some() {
                warn!("Discarding incomplete stored session");
                self.end_session();
            }
            debug!("No stored session");
            return false;
        };

        if credential.is_expired_at(self.clock.now()) {
            info!(expired_at = %credential.expires_at, "Stored session has expired");
            self.end_session();
            self.ctx
                .emit(SessionEvent::Invalidated(InvalidationReason::Expired));
            return false;
        }

        self.ctx.set_default_auth(Some(credential.bearer()));
        self.ctx.set_affiliation(cached.affiliation);
        let profile = match self.backend.who_am_i().await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(error = %e, "Stored session failed re-validation, signing out");
                self.end_session();
                // A 401 already went through the pipeline's teardown
                if !e.is_unauthorized() {
                    self.ctx.emit(SessionEvent::Invalidated(
                        InvalidationReason::RevalidationFailed,
                    ));
                }
                return false;
            }
        };

        // The session may have been ended while re-validation was in flight
        if vault.get_token().as_ref() != Some(&credential) {
            debug!("Session changed during re-validation, not restoring");
            return false;
        }

        if profile != cached {
            self.persist_profile(&profile);
        }
        self.start_renewal(credential.expires_at);
        info!(user_id = profile.id, "Session restored");
        self.ctx.emit(SessionEvent::Restored(profile));
        true
    }

    pub async fn sign_in(&self, identifier: &str, secret: &str) -> Result<UserProfile, SignInError> {
        let outcome = self.backend.sign_in(identifier, secret).await?;

        self.scheduler.stop();
        self.ctx
            .vault()
            .store_session(&outcome.credential, &outcome.profile)?;
        self.ctx.set_default_auth(Some(outcome.credential.bearer()));
        self.ctx.set_affiliation(outcome.profile.affiliation);
        self.start_renewal(outcome.credential.expires_at);

        info!(user_id = outcome.profile.id, "Signed in");
        self.ctx.emit(SessionEvent::SignedIn(outcome.profile.clone()));
        Ok(outcome.profile)
    }

    /// Fetch the profile from the server and persist it if it changed.
    pub async fn refresh_profile(&self) -> Result<UserProfile, ApiError> {
        let profile = self.backend.who_am_i().await?;
        let cached = self.ctx.vault().load_session().map(|(_, cached)| cached);
        if let Some(cached) = cached {
            if cached != profile {
                self.persist_profile(&profile);
            }
        }
        Ok(profile)
    }

    /// Sign out. Never fails; storage errors are logged.
    pub async fn sign_out(&self) {
        if let Err(e) = self.try_sign_out().await {
            error!(error = %e, "Failed to clear stored session during sign-out");
        }
    }

    /// Sign out, reporting a failure to clear local storage. The remote call
    /// is best-effort and local teardown always runs. Safe to repeat.
    pub async fn try_sign_out(&self) -> Result<(), StoreError> {
        let had_session = self.ctx.vault().get_token().is_some() || self.ctx.default_auth().is_some();
        if had_session {
            if let Err(e) = self.backend.sign_out().await {
                debug!(error = %e, "Remote sign-out failed, continuing locally");
            }
        }

        self.scheduler.stop();
        let cleared = self.ctx.teardown();
        if had_session {
            info!("Signed out");
            self.ctx.emit(SessionEvent::SignedOut);
        }
        cleared
    }

    fn end_session(&self) {
        self.scheduler.stop();
        if let Err(e) = self.ctx.teardown() {
            warn!(error = %e, "Failed to clear stored session");
        }
    }

    fn persist_profile(&self, profile: &UserProfile) {
        match self.ctx.vault().store_profile(profile) {
            Ok(()) => {
                self.ctx.set_affiliation(profile.affiliation);
                debug!(user_id = profile.id, "Cached profile updated");
                self.ctx.emit(SessionEvent::ProfileUpdated(profile.clone()));
            }
            Err(e) => warn!(error = %e, "Failed to persist refreshed profile"),
        }
    }

    fn start_renewal(&self, expires_at: chrono::DateTime<chrono::Utc>) {
        let ctx = Arc::downgrade(&self.ctx);
        self.scheduler.start(
            expires_at,
            Arc::new(move || {
                if let Some(ctx) = ctx.upgrade() {
                    ctx.notify(Notice::SessionExpired);
                    ctx.emit(SessionEvent::Invalidated(InvalidationReason::RenewalFailed));
                }
            }),
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
