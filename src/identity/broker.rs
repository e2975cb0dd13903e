//! Access token broker.
//!
//! Mints short-lived tokens for managed identities, limited to
//! [`TOKEN_SCOPES`]. There is no liveness-store lookup: whether a
//! handle may receive a token is decided by the platform alone, so a
//! store/provider divergence surfaces here as [`Error::Provider`](crate::Error::Provider).

use std::sync::Arc;

use tracing::debug;

use super::{AccessGrant, Handle, IdentityProvider, TOKEN_SCOPES};
use crate::Result;

/// Mints access tokens through the identity provider.
pub struct TokenBroker {
    provider: Arc<dyn IdentityProvider>,
}

impl TokenBroker {
    /// Create a broker over `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    /// Mint a token for `handle`. The token is returned, never stored.
    ///
    /// # Errors
    ///
    /// [`Error::Provider`](crate::Error::Provider) if the platform denies or fails the request.
    pub async fn issue(&self, handle: &Handle) -> Result<AccessGrant> {
        let grant = self.provider.mint_token(handle, &TOKEN_SCOPES).await?;
        debug!(handle = %handle, expire_time = ?grant.expire_time, "Issued access token");
        Ok(grant)
    }
}
