//! Background token renewal.
//!
//! The scheduler keeps the session alive by renewing the token shortly
//! before it expires. Timers are capped at `check_interval` so no single
//! sleep has to land accurately far in the future; once the remaining time
//! is inside `lead_time`, one renewal call is made.
//!
//! ```text
//! Idle --start--> Armed --timer--> Checking --(outside lead window)--> Armed
//!                                     |
//!                                     +--(inside lead window)--> Renewing
//! Renewing --ok--> Armed (new expiry, never sooner than check_interval
//!                          if it is already inside the lead window)
//! Renewing --err or already expired--> teardown, callback, Idle
//! ```
//!
//! Every `start`/`stop` bumps a generation counter. Timer firings and
//! renewal completions carry the generation they were issued under and
//! are ignored once it is stale, so a late response after `stop()` cannot
//! re-arm the timer or rewrite the vault.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, TokenRenewer};
use crate::clock::Clock;
use crate::models::Credential;
use crate::session::{SessionContext, SessionEvent};
use crate::store::StoreError;

pub type ExpiryCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    /// Renew once the token has less than this left.
    pub lead_time: Duration,
    /// Longest single timer.
    pub check_interval: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            lead_time: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPhase {
    Idle,
    Armed,
    Checking,
    Renewing,
}

#[derive(Error, Debug)]
pub enum RenewalError {
    #[error("Token renewal request failed: {0}")]
    Api(#[from] ApiError),

    #[error("Failed to store renewed token: {0}")]
    Storage(#[from] StoreError),

    #[error("Renewed token expired at {0}")]
    AlreadyExpired(DateTime<Utc>),
}

struct RenewalState {
    phase: RenewalPhase,
    expires_at: Option<DateTime<Utc>>,
    timer: Option<JoinHandle<()>>,
    in_flight: bool,
    on_expired: Option<ExpiryCallback>,
    generation: u64,
}

pub struct RenewalScheduler {
    ctx: Arc<SessionContext>,
    renewer: Arc<dyn TokenRenewer>,
    clock: Arc<dyn Clock>,
    policy: RenewalPolicy,
    state: Mutex<RenewalState>,
}

impl RenewalScheduler {
    pub fn new(
        ctx: Arc<SessionContext>,
        renewer: Arc<dyn TokenRenewer>,
        clock: Arc<dyn Clock>,
        policy: RenewalPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            renewer,
            clock,
            policy,
            state: Mutex::new(RenewalState {
                phase: RenewalPhase::Idle,
                expires_at: None,
                timer: None,
                in_flight: false,
                on_expired: None,
                generation: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RenewalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> RenewalPhase {
        self.lock().phase
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock().expires_at
    }

    pub fn is_renewing(&self) -> bool {
        self.lock().in_flight
    }

    /// Begin keeping a session with the given expiry alive. Replaces any
    /// session the scheduler was tracking.
    pub fn start(self: &Arc<Self>, expires_at: DateTime<Utc>, on_expired: ExpiryCallback) {
        let mut state = self.lock();
        Self::cancel_timer(&mut state);
        state.generation += 1;
        state.in_flight = false;
        state.on_expired = Some(on_expired);
        state.expires_at = Some(expires_at);
        info!(%expires_at, "Renewal scheduler started");
        self.arm(&mut state, true);
    }

    /// Cancel the timer and forget the session. A renewal already in flight
    /// is left to finish, but its result is discarded.
    pub fn stop(&self) {
        let mut state = self.lock();
        Self::cancel_timer(&mut state);
        state.generation += 1;
        state.in_flight = false;
        state.on_expired = None;
        state.expires_at = None;
        if state.phase != RenewalPhase::Idle {
            debug!("Renewal scheduler stopped");
        }
        state.phase = RenewalPhase::Idle;
    }

    /// Renew now instead of waiting for the lead window. Returns false when
    /// idle or when a renewal is already in flight.
    pub fn force_renewal(self: &Arc<Self>) -> bool {
        let mut state = self.lock();
        if state.phase == RenewalPhase::Idle || state.in_flight {
            debug!(phase = ?state.phase, "Forced renewal dropped");
            return false;
        }
        Self::cancel_timer(&mut state);
        self.begin_renewal(&mut state);
        true
    }

    fn cancel_timer(state: &mut RenewalState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Arm the next timer. With `renew_if_due` unset, an expiry already
    /// inside the lead window waits one full `check_interval` instead of
    /// renewing right away, so a short-lived token renews at most once per
    /// interval.
    fn arm(self: &Arc<Self>, state: &mut RenewalState, renew_if_due: bool) {
        let Some(expires_at) = state.expires_at else {
            state.phase = RenewalPhase::Idle;
            return;
        };

        let lead = chrono::Duration::from_std(self.policy.lead_time).unwrap_or(chrono::Duration::zero());
        let until_window = expires_at - lead - self.clock.now();
        let delay = if until_window > chrono::Duration::zero() {
            until_window
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.policy.check_interval)
        } else if renew_if_due {
            self.begin_renewal(state);
            return;
        } else {
            warn!(
                lead_secs = self.policy.lead_time.as_secs(),
                %expires_at,
                "Renewed token is already inside the lead window"
            );
            self.policy.check_interval
        };
        let generation = state.generation;
        let scheduler = Arc::downgrade(self);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.on_timer(generation);
            }
        }));
        state.phase = RenewalPhase::Armed;
        debug!(delay_secs = delay.as_secs(), "Renewal timer armed");
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation || state.phase != RenewalPhase::Armed {
            return;
        }
        // This is the timer task itself; nothing to abort
        state.timer = None;
        state.phase = RenewalPhase::Checking;
        self.arm(&mut state, true);
    }

    fn begin_renewal(self: &Arc<Self>, state: &mut RenewalState) {
        if state.in_flight {
            debug!("Renewal already in flight");
            return;
        }
        state.in_flight = true;
        state.phase = RenewalPhase::Renewing;
        let generation = state.generation;
        info!("Renewing session token");

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let result = scheduler.renewer.renew().await;
            scheduler.finish_renewal(generation, result);
        });
    }

    fn finish_renewal(self: &Arc<Self>, generation: u64, result: Result<Credential, ApiError>) {
        let callback = {
            let mut state = self.lock();
            if state.generation != generation {
                info!("Discarding renewal result for a session that was stopped");
                return;
            }
            state.in_flight = false;

            let now = self.clock.now();
            let outcome = result.map_err(RenewalError::from).and_then(|credential| {
                if credential.is_expired_at(now) {
                    return Err(RenewalError::AlreadyExpired(credential.expires_at));
                }
                self.ctx.vault().store_token(&credential)?;
                Ok(credential)
            });

            match outcome {
                Ok(credential) => {
                    info!(expires_at = %credential.expires_at, "Session token renewed");
                    self.ctx.set_default_auth(Some(credential.bearer()));
                    state.expires_at = Some(credential.expires_at);
                    self.ctx.emit(SessionEvent::Renewed {
                        expires_at: credential.expires_at,
                    });
                    self.arm(&mut state, false);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Token renewal failed, ending session");
                    Self::cancel_timer(&mut state);
                    state.generation += 1;
                    state.expires_at = None;
                    state.phase = RenewalPhase::Idle;
                    if let Err(e) = self.ctx.teardown() {
                        warn!(error = %e, "Failed to clear vault after renewal failure");
                    }
                    state.on_expired.take()
                }
            }
        };

        if let Some(callback) = callback {
            callback();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
