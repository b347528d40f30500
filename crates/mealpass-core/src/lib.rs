//! mealpass core: the session and credential layer of the meal-ticket client.
//!
//! The session token and the signed-in operator's profile are sealed and
//! persisted by the [`vault`]. Every API call goes through the
//! [`api::HttpPipeline`], which attaches credentials and tears the session
//! down on a 401. The [`renewal`] scheduler renews the token before it
//! expires. The [`session::SessionController`] exposes the lifecycle to the
//! app and broadcasts [`session::SessionEvent`]s and user-facing
//! [`notice::Notice`]s.
//!
//! Most callers start from [`session::SessionStack::from_config`].

pub mod api;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod models;
pub mod notice;
pub mod renewal;
pub mod session;
pub mod store;
pub mod vault;

pub use api::{ApiError, HttpPipeline};
pub use config::Config;
pub use models::{Affiliation, Credential, UserProfile};
pub use notice::Notice;
pub use renewal::{RenewalPhase, RenewalPolicy, RenewalScheduler};
pub use session::{
    InvalidationReason, SessionController, SessionEvent, SessionStack, SignInError,
};
pub use store::{SecureStore, StorageBackend, StoreError};
pub use vault::CredentialVault;
