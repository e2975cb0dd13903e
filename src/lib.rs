//! Ephemeral identity broker
//!
//! Creates short-lived cloud service accounts on behalf of one trusted
//! caller, keeps them alive while the caller renews them, mints scoped access
//! tokens for them, and reclaims the ones nobody renewed.
//!
//! # Components
//!
//! - **Caller Authenticator** ([`auth`]): OIDC ID token verification plus a
//!   single authorized claim value
//! - **Identity Lifecycle Manager** ([`identity::LifecycleManager`]): create,
//!   renew, delete, reclaim
//! - **Access Token Broker** ([`identity::TokenBroker`])
//! - **Adapters**: [`identity::LivenessStore`] (Firestore or in-memory) and
//!   [`identity::IdentityProvider`] (IAM or in-memory)
//! - **HTTP gateway** ([`server`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gcp;
pub mod identity;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` wins over `level` when set.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
