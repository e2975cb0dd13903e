//! Lifecycle properties against the in-memory adapters
//!
//! Covers:
//! - create/delete round trip and idempotent delete
//! - renew on unknown identities and renewal monotonicity
//! - reclamation threshold and partial-failure isolation (platform and store)
//! - token issuance without a liveness record

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use pretty_assertions::assert_eq;
use tokio_test::assert_ok;

use idbroker::Error;
use idbroker::identity::{
    Handle, IdentityProvider, InMemoryLivenessStore, InMemoryProvider, LifecycleManager,
    LivenessStore, PrincipalId, ReclaimTally, TokenBroker,
};

const PROJECT: &str = "test-users-1";
const TTL: Duration = Duration::from_secs(60 * 60);

struct Harness {
    store: Arc<InMemoryLivenessStore>,
    provider: Arc<InMemoryProvider>,
    manager: LifecycleManager,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryLivenessStore::new());
    let provider = Arc::new(InMemoryProvider::new(PROJECT));
    let manager = LifecycleManager::new(
        Arc::clone(&store) as Arc<dyn LivenessStore>,
        Arc::clone(&provider) as Arc<dyn IdentityProvider>,
        PROJECT,
    );
    Harness {
        store,
        provider,
        manager,
    }
}

/// Seed an identity whose last renewal was `age` ago.
async fn seed(h: &Harness, age: TimeDelta) -> Handle {
    let id = PrincipalId::generate();
    let handle = Handle::for_principal(&id, PROJECT);
    h.store.create(&handle, Utc::now() - age).await.unwrap();
    h.provider.create_principal(&id).await.unwrap();
    handle
}

#[tokio::test]
async fn create_then_delete_round_trip() {
    // GIVEN: a freshly created identity
    let h = harness();
    let handle = h.manager.create().await.unwrap();
    assert!(h.store.get(&handle).is_some());
    assert!(h.provider.contains(&handle));

    // WHEN: it is deleted
    assert_ok!(h.manager.delete(&handle).await);

    // THEN: neither the record nor the principal exists
    assert!(h.store.get(&handle).is_none());
    assert!(!h.provider.contains(&handle));
}

#[tokio::test]
async fn delete_with_absent_principal_removes_residual_record() {
    // GIVEN: a record whose principal vanished at the platform
    let h = harness();
    let handle = h.manager.create().await.unwrap();
    h.provider.forget(&handle);

    // WHEN: deleted
    assert_ok!(h.manager.delete(&handle).await);

    // THEN: success, and the residual record is gone
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn delete_twice_succeeds() {
    let h = harness();
    let handle = h.manager.create().await.unwrap();

    assert_ok!(h.manager.delete(&handle).await);
    assert_ok!(h.manager.delete(&handle).await);
}

#[tokio::test]
async fn renew_requires_existing_record() {
    // GIVEN: one handle never created and one already deleted
    let h = harness();
    let never = Handle::parse("user-never@test-users-1.iam.gserviceaccount.com").unwrap();
    let deleted = h.manager.create().await.unwrap();
    h.manager.delete(&deleted).await.unwrap();

    // WHEN/THEN: both renewals fail with NotFound and create nothing
    for handle in [&never, &deleted] {
        let result = h.manager.renew(handle).await;
        assert!(matches!(result, Err(Error::NotFound(_))), "renewed {handle}");
    }
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn stored_timestamp_is_from_last_renewal() {
    // GIVEN: an identity renewed several times
    let h = harness();
    let handle = h.manager.create().await.unwrap();

    let mut last = None;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        last = Some(h.manager.renew(&handle).await.unwrap());
    }

    // THEN: the record holds the last call's timestamp
    let record = h.store.get(&handle).unwrap();
    assert_eq!(Some(record.renewed_at), last);
}

#[tokio::test]
async fn reclamation_deletes_only_expired_identities() {
    // GIVEN: one identity idle for 2h and one renewed 10 minutes ago
    let h = harness();
    let stale = seed(&h, TimeDelta::hours(2)).await;
    let fresh = seed(&h, TimeDelta::minutes(10)).await;

    // WHEN: a sweep runs with a one-hour TTL
    let tally = h.manager.reclaim_expired(TTL).await.unwrap();

    // THEN: only the stale identity is gone
    assert_eq!(tally, ReclaimTally { succeeded: 1, failed: 0 });
    assert!(!h.provider.contains(&stale));
    assert!(h.store.get(&stale).is_none());
    assert!(h.provider.contains(&fresh));
    assert!(h.store.get(&fresh).is_some());
}

#[tokio::test]
async fn one_failed_reclamation_does_not_block_others() {
    // GIVEN: two expired identities, one of which the platform refuses to delete
    let h = harness();
    let doomed = seed(&h, TimeDelta::hours(3)).await;
    let stuck = seed(&h, TimeDelta::hours(3)).await;
    h.provider.fail_for(&stuck, "permission denied");

    // WHEN: a sweep runs
    let tally = h.manager.reclaim_expired(TTL).await.unwrap();

    // THEN: one success, one failure; the failed one is kept for the next sweep
    assert_eq!(tally, ReclaimTally { succeeded: 1, failed: 1 });
    assert!(!h.provider.contains(&doomed));
    assert!(h.store.get(&doomed).is_none());
    assert!(h.provider.contains(&stuck));
    assert!(h.store.get(&stuck).is_some());
    assert_eq!(
        serde_json::to_value(tally).unwrap(),
        serde_json::json!({"succeeded": 1, "failed": 1})
    );
}

#[tokio::test]
async fn store_failure_during_reclamation_is_counted() {
    // GIVEN: two expired identities, one whose record cannot be removed
    let h = harness();
    let clean = seed(&h, TimeDelta::hours(3)).await;
    let stuck = seed(&h, TimeDelta::hours(3)).await;
    h.store.fail_deletes_for(&stuck, "backend unavailable");

    // WHEN: a sweep runs
    let tally = h.manager.reclaim_expired(TTL).await.unwrap();

    // THEN: the store failure is a failed deletion, not an aborted sweep
    assert_eq!(tally, ReclaimTally { succeeded: 1, failed: 1 });
    assert!(h.store.get(&clean).is_none());

    // AND: the principal is gone but the record stays for the next sweep
    assert!(!h.provider.contains(&stuck));
    assert!(h.store.get(&stuck).is_some());
    assert_eq!(
        h.store.query_older_than(Utc::now()).await.unwrap(),
        vec![stuck]
    );
}

#[tokio::test]
async fn token_issuance_ignores_liveness_store() {
    // GIVEN: a principal with no liveness record
    let h = harness();
    let id = PrincipalId::generate();
    h.provider.create_principal(&id).await.unwrap();
    let untracked = Handle::for_principal(&id, PROJECT);
    let broker = TokenBroker::new(Arc::clone(&h.provider) as Arc<dyn IdentityProvider>);

    // WHEN/THEN: the platform allows it, so a token is issued
    assert_ok!(broker.issue(&untracked).await);

    // AND: a handle the platform rejects surfaces the provider error
    let rejected = Handle::parse("user-gone@test-users-1.iam.gserviceaccount.com").unwrap();
    assert!(matches!(
        broker.issue(&rejected).await,
        Err(Error::Provider(_))
    ));
    assert!(h.store.is_empty());
}
