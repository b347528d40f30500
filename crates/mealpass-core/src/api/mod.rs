//! REST API access for the mealpass backend.
//!
//! `HttpPipeline` is the only HTTP client in the crate. `AuthApi` puts the
//! sign-in, "who am I", renewal and sign-out endpoints on top of it.

pub mod auth;
pub mod error;
pub mod pipeline;

pub use auth::{AuthApi, AuthBackend, SignInOutcome, TokenRenewer};
pub use error::ApiError;
pub use pipeline::{Envelope, HttpPipeline, Reactions, RequestPolicy};
