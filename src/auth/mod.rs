//! Caller authentication for gated operations.
//!
//! Every gated request carries `Authorization: Bearer <id-token>`. The token
//! is verified by an [`IdTokenVerifier`] (signature, issuer, audience, expiry)
//! and then one configured claim must equal the single authorized value.
//!
//! Authorization is caller-wide: an authorized caller may act on any managed
//! identity. Authentication has no side effects.

pub mod oidc;

use std::sync::Arc;

use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::{Error, Result};

pub use oidc::{OidcError, OidcVerifier};

/// Claims of a verified ID token.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    /// `sub` claim
    pub subject: String,
    /// Every claim of the token, including `sub`
    pub claims: Map<String, Value>,
}

impl VerifiedClaims {
    /// String value of `name`, if present and a string.
    #[must_use]
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

/// Verifies a raw ID token.
#[async_trait::async_trait]
pub trait IdTokenVerifier: Send + Sync + 'static {
    /// Verify `token` and return its claims.
    async fn verify(&self, token: &str) -> std::result::Result<VerifiedClaims, OidcError>;
}

/// The caller that passed the gate.
#[derive(Debug, Clone)]
pub struct VerifiedCaller {
    /// `sub` of the caller's token
    pub subject: String,
    /// Value of the authorized claim (e.g. the caller's email)
    pub principal: String,
}

/// Gate in front of every operation except `status`.
pub struct CallerAuthenticator {
    verifier: Arc<dyn IdTokenVerifier>,
    claim: String,
    authorized_value: String,
}

impl CallerAuthenticator {
    /// Create an authenticator that admits only tokens whose `claim` equals
    /// `authorized_value`.
    #[must_use]
    pub fn new(
        verifier: Arc<dyn IdTokenVerifier>,
        claim: impl Into<String>,
        authorized_value: impl Into<String>,
    ) -> Self {
        Self {
            verifier,
            claim: claim.into(),
            authorized_value: authorized_value.into(),
        }
    }

    /// Create from config with an [`OidcVerifier`].
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            Arc::new(OidcVerifier::new(config)),
            config.claim.clone(),
            config.resolve_authorized_value(),
        )
    }

    /// Authenticate and authorize the raw `Authorization` header value.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthenticated`] if the header is missing, not a bearer
    ///   credential, or the token fails verification.
    /// - [`Error::Forbidden`] if the token is valid but its claim does not match.
    pub async fn authorize(&self, authorization: Option<&str>) -> Result<VerifiedCaller> {
        let token = authorization
            .and_then(extract_bearer)
            .ok_or_else(|| Error::Unauthenticated("Missing bearer token".to_string()))?;

        let claims = self.verifier.verify(token).await.map_err(|e| {
            warn!(error = %e, "Rejected caller token");
            Error::Unauthenticated("Invalid or expired token".to_string())
        })?;

        let Some(value) = claims.claim_str(&self.claim) else {
            warn!(subject = %claims.subject, claim = %self.claim, "Caller token lacks the authorized claim");
            return Err(Error::Forbidden);
        };

        if !bool::from(value.as_bytes().ct_eq(self.authorized_value.as_bytes())) {
            warn!(subject = %claims.subject, claim = %self.claim, value = %value, "Caller is not authorized");
            return Err(Error::Forbidden);
        }

        let principal = value.to_string();
        debug!(subject = %claims.subject, "Caller authorized");
        Ok(VerifiedCaller {
            subject: claims.subject,
            principal,
        })
    }
}

/// `Bearer <token>` → `<token>`; scheme is case-insensitive, token must be non-empty.
fn extract_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
