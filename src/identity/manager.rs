//! Identity lifecycle manager: create, renew, delete, reclaim.
//!
//! The manager is stateless: it holds the two adapters and the project id,
//! and every operation runs against external state only. Multiple instances
//! may run side by side.
//!
//! # Ordering
//!
//! - **create** writes the liveness record *before* creating the principal.
//!   If the platform call fails, the record is left behind and ages into the
//!   next reclamation sweep. A principal never exists without a record.
//! - **delete** removes the principal *before* the record, so a retry after a
//!   partial failure converges.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{DeleteOutcome, Handle, IdentityProvider, LivenessStore, PrincipalId};
use crate::{Error, Result};

/// Outcome counts of a reclamation sweep.
///
/// Serializes like a count-by over outcomes: zero counts are omitted, so an
/// empty sweep is `{}`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReclaimTally {
    /// Identities fully deleted
    #[serde(skip_serializing_if = "is_zero")]
    pub succeeded: usize,
    /// Identities whose deletion failed (left for the next sweep)
    #[serde(skip_serializing_if = "is_zero")]
    pub failed: usize,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl ReclaimTally {
    /// Total identities the sweep attempted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Owns the state transitions of every managed identity.
pub struct LifecycleManager {
    store: Arc<dyn LivenessStore>,
    provider: Arc<dyn IdentityProvider>,
    project_id: String,
}

impl LifecycleManager {
    /// Create a manager over the given adapters.
    #[must_use]
    pub fn new(
        store: Arc<dyn LivenessStore>,
        provider: Arc<dyn IdentityProvider>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            project_id: project_id.into(),
        }
    }

    /// Create a new identity and return its handle.
    ///
    /// # Errors
    ///
    /// - [`Error::Store`] if the liveness record cannot be written (no principal is created).
    /// - [`Error::Provider`] if the platform rejects creation; the record stays
    ///   and is reclaimed once it expires.
    pub async fn create(&self) -> Result<Handle> {
        let principal = PrincipalId::generate();
        let handle = Handle::for_principal(&principal, &self.project_id);

        self.store.create(&handle, Utc::now()).await?;

        if let Err(e) = self.provider.create_principal(&principal).await {
            warn!(handle = %handle, error = %e, "Principal creation failed; liveness record left for reclamation");
            return Err(e);
        }

        info!(handle = %handle, principal_id = %principal, "Created identity");
        Ok(handle)
    }

    /// Extend the liveness window of a tracked identity.
    ///
    /// Returns the timestamp now stored as `renewed_at`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `handle` is not tracked; no record is created.
    pub async fn renew(&self, handle: &Handle) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        self.store.update(handle, now).await?;
        debug!(handle = %handle, renewed_at = %now, "Renewed identity");
        Ok(now)
    }

    /// Delete an identity: principal first, then its liveness record.
    ///
    /// A principal that is already gone counts as deleted.
    ///
    /// # Errors
    ///
    /// - [`Error::Provider`] if the platform fails for a reason other than
    ///   absence; the record is left untouched.
    /// - [`Error::Store`] if the record cannot be removed after the principal was.
    pub async fn delete(&self, handle: &Handle) -> Result<()> {
        match self.provider.delete_principal(handle).await? {
            DeleteOutcome::Deleted => {}
            DeleteOutcome::AlreadyAbsent => {
                debug!(handle = %handle, "Principal already absent, removing record");
            }
        }

        self.store.delete(handle).await?;
        info!(handle = %handle, "Deleted identity");
        Ok(())
    }

    /// Delete every identity whose last renewal is older than `ttl`.
    ///
    /// Deletes run concurrently; one failure neither aborts nor affects the
    /// others. Failed identities keep their records and are retried by the
    /// next sweep.
    ///
    /// # Errors
    ///
    /// Only if the expired set cannot be queried (or `ttl` is out of range);
    /// per-identity failures are counted, not returned.
    pub async fn reclaim_expired(&self, ttl: Duration) -> Result<ReclaimTally> {
        let ttl = TimeDelta::from_std(ttl)
            .map_err(|e| Error::Internal(format!("reclamation TTL out of range: {e}")))?;
        let cutoff = Utc::now() - ttl;
        let expired = self.store.query_older_than(cutoff).await?;

        let outcomes = join_all(expired.iter().map(|handle| async move {
            let result = self.delete(handle).await;
            if let Err(ref e) = result {
                warn!(handle = %handle, error = %e, "Failed to reclaim identity");
            }
            result.is_ok()
        }))
        .await;

        let tally = outcomes.into_iter().fold(ReclaimTally::default(), |mut t, ok| {
            if ok {
                t.succeeded += 1;
            } else {
                t.failed += 1;
            }
            t
        });

        if tally.total() > 0 {
            info!(
                succeeded = tally.succeeded,
                failed = tally.failed,
                cutoff = %cutoff,
                "Reclamation sweep finished"
            );
        } else {
            debug!(cutoff = %cutoff, "Reclamation sweep found nothing to reclaim");
        }
        Ok(tally)
    }
}
