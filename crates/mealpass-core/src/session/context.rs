//! Shared session state handed to the pipeline, the scheduler and the
//! controller. One instance per signed-in app process; tests build their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::{Affiliation, UserProfile};
use crate::notice::Notice;
use crate::store::StoreError;
use crate::vault::CredentialVault;

/// Buffered events per subscriber before the slowest one starts lagging
const CHANNEL_CAPACITY: usize = 32;

pub type SessionHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The server answered 401.
    Unauthorized,
    /// A proactive renewal failed.
    RenewalFailed,
    /// The cold-start "who am I" check failed.
    RevalidationFailed,
    /// The stored credential had already expired.
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignedIn(UserProfile),
    Restored(UserProfile),
    ProfileUpdated(UserProfile),
    Renewed { expires_at: DateTime<Utc> },
    Invalidated(InvalidationReason),
    SignedOut,
}

pub struct SessionContext {
    vault: CredentialVault,
    default_auth: RwLock<Option<String>>,
    tenant: RwLock<Option<Affiliation>>,
    events: broadcast::Sender<SessionEvent>,
    notices: broadcast::Sender<Notice>,
    teardown_guard: AtomicBool,
    teardown_cooldown: Duration,
    invalid_hook: Mutex<Option<SessionHook>>,
}

impl SessionContext {
    pub fn new(vault: CredentialVault, teardown_cooldown: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (notices, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            vault,
            default_auth: RwLock::new(None),
            tenant: RwLock::new(None),
            events,
            notices,
            teardown_guard: AtomicBool::new(false),
            teardown_cooldown,
            invalid_hook: Mutex::new(None),
        })
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        debug!(?event, "Session event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn notify(&self, notice: Notice) {
        debug!(%notice, "Notice");
        let _ = self.notices.send(notice);
    }

    // ===== Default auth header =====

    pub fn set_default_auth(&self, value: Option<String>) {
        *self
            .default_auth
            .write()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn default_auth(&self) -> Option<String> {
        self.default_auth
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tenant the pipeline stamps on outgoing requests. Kept in memory so
    /// requests never read the vault for it.
    pub fn set_affiliation(&self, affiliation: Option<Affiliation>) {
        *self.tenant.write().unwrap_or_else(PoisonError::into_inner) = affiliation;
    }

    pub fn affiliation(&self) -> Option<Affiliation> {
        *self.tenant.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Authorization value for an outgoing request: the default header when
    /// set, otherwise the stored credential.
    pub fn auth_header_value(&self) -> Option<String> {
        self.default_auth()
            .or_else(|| self.vault.get_token().map(|credential| credential.bearer()))
    }

    // ===== Teardown =====

    /// Strip the default headers and clear the vault. Safe to repeat.
    pub fn teardown(&self) -> Result<(), StoreError> {
        self.set_default_auth(None);
        self.set_affiliation(None);
        self.vault.clear()
    }

    pub fn set_session_invalid_hook(&self, hook: SessionHook) {
        *self
            .invalid_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn is_tearing_down(&self) -> bool {
        self.teardown_guard.load(Ordering::Acquire)
    }

    /// React to a 401. The first call in a burst tears the session down and
    /// notifies; calls while the guard is held do nothing. The guard is
    /// released after the cooldown. Returns whether this call tore down.
    pub fn handle_unauthorized(self: &Arc<Self>) -> bool {
        if self
            .teardown_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Teardown already in progress, ignoring 401");
            return false;
        }

        warn!("Session rejected by server, tearing down");
        if let Err(e) = self.teardown() {
            warn!(error = %e, "Failed to clear vault during teardown");
        }
        self.notify(Notice::SessionExpired);
        self.emit(SessionEvent::Invalidated(InvalidationReason::Unauthorized));

        let hook = self
            .invalid_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook();
        }

        let ctx = Arc::downgrade(self);
        let cooldown = self.teardown_cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            if let Some(ctx) = ctx.upgrade() {
                ctx.teardown_guard.store(false, Ordering::Release);
                debug!("Teardown guard released");
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BlobCodec, ChaChaCipher};
    use crate::models::Credential;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn context(cooldown: Duration) -> Arc<SessionContext> {
        let codec = BlobCodec::new(Arc::new(ChaChaCipher::from_key([3; 32])));
        let vault = CredentialVault::new(Arc::new(MemoryStore::new()), codec);
        SessionContext::new(vault, cooldown)
    }

    #[test]
    fn test_auth_header_prefers_default() {
        let ctx = context(Duration::from_secs(1));
        assert_eq!(ctx.auth_header_value(), None);

        let expiry = Utc::now() + chrono::Duration::hours(1);
        ctx.vault().store_token(&Credential::new("stored", expiry)).unwrap();
        assert_eq!(ctx.auth_header_value().as_deref(), Some("Bearer stored"));

        ctx.set_default_auth(Some("Bearer default".to_string()));
        assert_eq!(ctx.auth_header_value().as_deref(), Some("Bearer default"));

        ctx.teardown().unwrap();
        assert_eq!(ctx.auth_header_value(), None);
    }

    #[test]
    fn test_teardown_forgets_tenant() {
        let ctx = context(Duration::from_secs(1));
        let tenant = Affiliation::Establishment { establishment_id: 7 };
        ctx.set_affiliation(Some(tenant));
        assert_eq!(ctx.affiliation(), Some(tenant));

        ctx.teardown().unwrap();
        assert_eq!(ctx.affiliation(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_guard_and_cooldown() {
        let ctx = context(Duration::from_secs(2));
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let counter = hook_calls.clone();
        ctx.set_session_invalid_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let mut events = ctx.subscribe();

        assert!(ctx.handle_unauthorized());
        assert!(!ctx.handle_unauthorized());
        assert!(ctx.is_tearing_down());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Invalidated(InvalidationReason::Unauthorized)
        );
        assert!(events.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!ctx.is_tearing_down());
        assert!(ctx.handle_unauthorized());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }
}
