//! Managed identities: ephemeral service accounts and their liveness.
//!
//! An identity is born with [`LifecycleManager::create`], kept alive with
//! [`LifecycleManager::renew`] and destroyed by an explicit
//! [`LifecycleManager::delete`] or by a reclamation sweep
//! ([`LifecycleManager::reclaim_expired`]) once its last renewal is older
//! than the configured TTL.
//!
//! ```text
//! nonexistent ──create──▶ active ──renew──▶ active
//!      ▲                    │
//!      └──delete / reclaim──┘
//! ```
//!
//! Two adapters hold all state:
//!
//! - [`LivenessStore`]: one record per handle with its `renewed_at`.
//! - [`IdentityProvider`]: the platform principal itself, plus token minting.
//!
//! Expiry is never stored; it is computed at sweep time from `renewed_at`.

pub mod broker;
pub mod manager;
pub mod provider;
pub mod store;

use std::{fmt, sync::Arc, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::{BackendKind, Config};
use crate::gcp::GoogleClient;
use crate::{Error, Result};

pub use broker::TokenBroker;
pub use manager::{LifecycleManager, ReclaimTally};
pub use provider::{IamProvider, IdentityProvider, InMemoryProvider};
pub use store::{FirestoreStore, InMemoryLivenessStore, LivenessStore};

/// Scopes every brokered access token is limited to.
pub const TOKEN_SCOPES: [&str; 3] = ["profile", "email", "openid"];

/// Prefix of every generated account id.
const PRINCIPAL_PREFIX: &str = "user-";

/// The platform caps account ids at 30 characters; `user-` + 23 = 28.
const PRINCIPAL_RANDOM_LEN: usize = 23;

/// Longest handle accepted as input (RFC 5321 path limit).
const MAX_HANDLE_LEN: usize = 254;

static HANDLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"^[A-Za-z0-9._+-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$",
    )
    .unwrap()
});

static PROJECT_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-z][a-z0-9-]{4,28}[a-z0-9]$").unwrap()
});

/// Returns `true` if `project_id` is a well-formed cloud project id.
#[must_use]
pub fn is_valid_project_id(project_id: &str) -> bool {
    PROJECT_ID_RE.is_match(project_id)
}

/// Generated account id of a managed principal (e.g. `user-1b4e28ba-2fa1-11d2-883f`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Generate a fresh id from a random v4 UUID.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().to_string();
        Self(format!("{PRINCIPAL_PREFIX}{}", &uuid[..PRINCIPAL_RANDOM_LEN]))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Externally visible, email-shaped name of a managed identity.
///
/// Also the liveness-store key and the platform resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Derive the handle of `principal` in `project_id`.
    #[must_use]
    pub fn for_principal(principal: &PrincipalId, project_id: &str) -> Self {
        Self(format!(
            "{principal}@{project_id}.iam.gserviceaccount.com"
        ))
    }

    /// Validate caller-supplied input as an email-shaped handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `value` is not a syntactically valid address.
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() > MAX_HANDLE_LEN || !HANDLE_RE.is_match(value) {
            return Err(Error::Validation(format!(
                "\"email\" must be a valid email: {value:?}"
            )));
        }
        Ok(Self(value.to_string()))
    }

    /// The handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tracked identity as seen by the liveness store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedIdentity {
    /// Handle (store key)
    pub handle: Handle,
    /// Last liveness signal
    pub renewed_at: DateTime<Utc>,
}

/// Result of deleting a principal at the provider. Both variants are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The principal existed and was removed
    Deleted,
    /// The principal was already gone
    AlreadyAbsent,
}

/// Short-lived bearer token minted for a managed identity. Never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    /// Opaque bearer token
    pub access_token: String,
    /// Expiry reported by the platform
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<DateTime<Utc>>,
}

/// The two adapters every lifecycle operation runs against.
#[derive(Clone)]
pub struct Backends {
    /// Liveness records
    pub store: Arc<dyn LivenessStore>,
    /// Platform principals and token minting
    pub provider: Arc<dyn IdentityProvider>,
}

impl Backends {
    /// Construct the adapters selected by `config.backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the Google HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.backend {
            BackendKind::Memory => Ok(Self {
                store: Arc::new(InMemoryLivenessStore::new()),
                provider: Arc::new(InMemoryProvider::new(&config.google.project_id)),
            }),
            BackendKind::Google => {
                let client = Arc::new(GoogleClient::from_config(&config.google)?);
                Ok(Self {
                    store: Arc::new(FirestoreStore::new(Arc::clone(&client), &config.google)),
                    provider: Arc::new(IamProvider::new(client, &config.google)),
                })
            }
        }
    }
}
