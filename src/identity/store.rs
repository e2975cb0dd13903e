//! Liveness store: one record per managed identity holding `renewed_at`.
//!
//! The [`LivenessStore`] trait abstracts over storage backends:
//!
//! - [`FirestoreStore`]: one document per handle in a Firestore collection,
//!   field `renewedAt`, talked to over the Firestore REST API.
//! - [`InMemoryLivenessStore`]: a `DashMap`, for development and tests.
//!
//! Single-document atomicity of the backend is all the lifecycle relies on:
//! `create` fails if the key exists, `update` fails if it does not.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Handle, ManagedIdentity};
use crate::config::GoogleConfig;
use crate::gcp::{ApiFailure, GoogleClient, describe_failure};
use crate::{Error, Result};

/// Trait abstracting the liveness record backend.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// request handlers and the reclamation sweep.
#[async_trait::async_trait]
pub trait LivenessStore: Send + Sync + 'static {
    /// Insert a new record. Fails if a record for `handle` already exists.
    async fn create(&self, handle: &Handle, renewed_at: DateTime<Utc>) -> Result<()>;

    /// Overwrite `renewed_at` of an existing record.
    ///
    /// Returns [`Error::NotFound`] if no record exists; never creates one.
    async fn update(&self, handle: &Handle, renewed_at: DateTime<Utc>) -> Result<()>;

    /// Remove a record. Removing an absent record succeeds.
    async fn delete(&self, handle: &Handle) -> Result<()>;

    /// Handles of all records with `renewed_at` strictly before `cutoff`.
    async fn query_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Handle>>;
}

/// In-memory liveness store backed by a `DashMap`.
pub struct InMemoryLivenessStore {
    records: DashMap<Handle, DateTime<Utc>>,
    /// Handles whose `delete` fails, with the reason
    failing_deletes: DashMap<Handle, String>,
}

impl InMemoryLivenessStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            failing_deletes: DashMap::new(),
        }
    }

    /// Make every `delete` of `handle` fail with `reason`.
    pub fn fail_deletes_for(&self, handle: &Handle, reason: &str) {
        self.failing_deletes.insert(handle.clone(), reason.to_string());
    }

    /// Look up a single record.
    #[must_use]
    pub fn get(&self, handle: &Handle) -> Option<ManagedIdentity> {
        self.records.get(handle).map(|r| ManagedIdentity {
            handle: handle.clone(),
            renewed_at: *r.value(),
        })
    }

    /// Number of tracked identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no identity is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryLivenessStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LivenessStore for InMemoryLivenessStore {
    async fn create(&self, handle: &Handle, renewed_at: DateTime<Utc>) -> Result<()> {
        match self.records.entry(handle.clone()) {
            Entry::Occupied(_) => Err(Error::Store(format!("record already exists: {handle}"))),
            Entry::Vacant(slot) => {
                slot.insert(renewed_at);
                Ok(())
            }
        }
    }

    async fn update(&self, handle: &Handle, renewed_at: DateTime<Utc>) -> Result<()> {
        let Some(mut record) = self.records.get_mut(handle) else {
            return Err(Error::NotFound(format!("no liveness record for {handle}")));
        };
        *record = renewed_at;
        Ok(())
    }

    async fn delete(&self, handle: &Handle) -> Result<()> {
        if let Some(reason) = self.failing_deletes.get(handle) {
            return Err(Error::Store(reason.clone()));
        }
        self.records.remove(handle);
        Ok(())
    }

    async fn query_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Handle>> {
        let mut expired: Vec<Handle> = self
            .records
            .iter()
            .filter(|e| *e.value() < cutoff)
            .map(|e| e.key().clone())
            .collect();
        expired.sort();
        Ok(expired)
    }
}

/// Name of the liveness field in each document.
const RENEWED_AT_FIELD: &str = "renewedAt";

/// Firestore-backed liveness store (REST API v1).
///
/// Document id = handle; a single `renewedAt` timestamp field.
pub struct FirestoreStore {
    client: Arc<GoogleClient>,
    /// `{endpoint}/projects/{project}/databases/{database}/documents`
    documents_url: String,
    collection: String,
}

#[derive(Debug, Deserialize)]
struct Document {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    #[serde(default)]
    document: Option<Document>,
}

impl FirestoreStore {
    /// Create a store for the configured project, database and collection.
    #[must_use]
    pub fn new(client: Arc<GoogleClient>, config: &GoogleConfig) -> Self {
        Self {
            client,
            documents_url: format!(
                "{}/projects/{}/databases/{}/documents",
                config.firestore_endpoint.trim_end_matches('/'),
                config.project_id,
                config.firestore_database
            ),
            collection: config.firestore_collection.clone(),
        }
    }

    fn document_url(&self, handle: &Handle) -> String {
        format!("{}/{}/{}", self.documents_url, self.collection, handle)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| Error::Store(format!("request failed: {e}")))
    }
}

/// Document body carrying a single `renewedAt` timestamp.
fn liveness_fields(renewed_at: DateTime<Utc>) -> Value {
    json!({
        "fields": {
            RENEWED_AT_FIELD: {
                "timestampValue": renewed_at.to_rfc3339_opts(SecondsFormat::Micros, true)
            }
        }
    })
}

/// `structuredQuery` selecting document names with `renewedAt < cutoff`.
fn older_than_query(collection: &str, cutoff: DateTime<Utc>) -> Value {
    json!({
        "structuredQuery": {
            "from": [{"collectionId": collection}],
            "select": {"fields": [{"fieldPath": "__name__"}]},
            "where": {
                "fieldFilter": {
                    "field": {"fieldPath": RENEWED_AT_FIELD},
                    "op": "LESS_THAN",
                    "value": {"timestampValue": cutoff.to_rfc3339_opts(SecondsFormat::Micros, true)}
                }
            }
        }
    })
}

/// Document id = last segment of the full resource name.
fn document_id(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

#[async_trait::async_trait]
impl LivenessStore for FirestoreStore {
    async fn create(&self, handle: &Handle, renewed_at: DateTime<Utc>) -> Result<()> {
        let url = format!("{}/{}", self.documents_url, self.collection);
        let request = self
            .client
            .request(Method::POST, &url)
            .await?
            .query(&[("documentId", handle.as_str())])
            .json(&liveness_fields(renewed_at));
        let response = self.send(request).await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(Error::Store(format!("record already exists: {handle}"))),
            _ => Err(Error::Store(describe_failure(response).await)),
        }
    }

    async fn update(&self, handle: &Handle, renewed_at: DateTime<Utc>) -> Result<()> {
        let request = self
            .client
            .request(Method::PATCH, &self.document_url(handle))
            .await?
            .query(&[
                ("updateMask.fieldPaths", RENEWED_AT_FIELD),
                ("currentDocument.exists", "true"),
            ])
            .json(&liveness_fields(renewed_at));
        let response = self.send(request).await?;
        if response.status().is_success() {
            return Ok(());
        }

        let failure = ApiFailure::read(response).await;
        match (failure.http_status, failure.code.as_str()) {
            // Missing document fails the `exists` precondition
            (StatusCode::NOT_FOUND, _) | (StatusCode::BAD_REQUEST, "FAILED_PRECONDITION") => {
                debug!(handle = %handle, detail = %failure, "Renew precondition failed");
                Err(Error::NotFound(format!("no liveness record for {handle}")))
            }
            _ => Err(Error::Store(failure.to_string())),
        }
    }

    async fn delete(&self, handle: &Handle) -> Result<()> {
        let request = self
            .client
            .request(Method::DELETE, &self.document_url(handle))
            .await?;
        let response = self.send(request).await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Error::Store(describe_failure(response).await)),
        }
    }

    async fn query_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Handle>> {
        let url = format!("{}:runQuery", self.documents_url);
        let request = self
            .client
            .request(Method::POST, &url)
            .await?
            .json(&older_than_query(&self.collection, cutoff));
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(Error::Store(describe_failure(response).await));
        }

        let items: Vec<RunQueryItem> = response
            .json()
            .await
            .map_err(|e| Error::Store(format!("malformed query response: {e}")))?;
        Ok(handles_from_query(items))
    }
}

fn handles_from_query(items: Vec<RunQueryItem>) -> Vec<Handle> {
    items
        .into_iter()
        .filter_map(|item| item.document)
        .filter_map(|doc| match Handle::parse(document_id(&doc.name)) {
            Ok(handle) => Some(handle),
            Err(_) => {
                warn!(document = %doc.name, "Skipping liveness document with non-handle id");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn handle(local: &str) -> Handle {
        Handle::parse(&format!("{local}@test-users-1.iam.gserviceaccount.com")).unwrap()
    }

    #[tokio::test]
    async fn create_then_get() {
        // GIVEN: an empty store
        let store = InMemoryLivenessStore::new();
        let h = handle("user-a");
        let now = Utc::now();

        // WHEN: a record is created
        store.create(&h, now).await.unwrap();

        // THEN: it can be read back
        let record = store.get(&h).unwrap();
        assert_eq!(record.renewed_at, now);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_existing_key() {
        // GIVEN: a store holding a record
        let store = InMemoryLivenessStore::new();
        let h = handle("user-a");
        let first = Utc::now() - TimeDelta::hours(1);
        store.create(&h, first).await.unwrap();

        // WHEN: the same key is created again
        let result = store.create(&h, Utc::now()).await;

        // THEN: error, and the original timestamp is kept
        assert!(matches!(result, Err(Error::Store(_))));
        assert_eq!(store.get(&h).unwrap().renewed_at, first);
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        // GIVEN: an empty store
        let store = InMemoryLivenessStore::new();

        // WHEN: an unknown key is updated
        let result = store.update(&handle("user-ghost"), Utc::now()).await;

        // THEN: NotFound and nothing is created
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryLivenessStore::new();
        let h = handle("user-a");
        store.create(&h, Utc::now()).await.unwrap();

        store.delete(&h).await.unwrap();
        store.delete(&h).await.unwrap();

        assert!(store.get(&h).is_none());
    }

    #[tokio::test]
    async fn injected_delete_failure_keeps_record() {
        // GIVEN: a record whose deletes fail
        let store = InMemoryLivenessStore::new();
        let h = handle("user-a");
        store.create(&h, Utc::now()).await.unwrap();
        store.fail_deletes_for(&h, "backend unavailable");

        // WHEN: deleted
        let result = store.delete(&h).await;

        // THEN: store error, and the record is still there
        assert!(matches!(result, Err(Error::Store(ref m)) if m == "backend unavailable"));
        assert!(store.get(&h).is_some());
    }

    #[tokio::test]
    async fn query_older_than_is_strict() {
        // GIVEN: records at, before and after the cutoff
        let store = InMemoryLivenessStore::new();
        let cutoff = Utc::now() - TimeDelta::hours(1);
        store.create(&handle("user-old"), cutoff - TimeDelta::seconds(1)).await.unwrap();
        store.create(&handle("user-edge"), cutoff).await.unwrap();
        store.create(&handle("user-new"), cutoff + TimeDelta::minutes(50)).await.unwrap();

        // WHEN: querying
        let expired = store.query_older_than(cutoff).await.unwrap();

        // THEN: only the record strictly older than the cutoff
        assert_eq!(expired, vec![handle("user-old")]);
    }

    #[test]
    fn liveness_fields_use_timestamp_value() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let body = liveness_fields(at);
        assert_eq!(
            body["fields"]["renewedAt"]["timestampValue"],
            "2024-05-01T12:00:00.000000Z"
        );
    }

    #[test]
    fn older_than_query_filters_on_renewed_at() {
        let cutoff = Utc::now();
        let query = older_than_query("users", cutoff);
        let filter = &query["structuredQuery"]["where"]["fieldFilter"];
        assert_eq!(query["structuredQuery"]["from"][0]["collectionId"], "users");
        assert_eq!(filter["field"]["fieldPath"], "renewedAt");
        assert_eq!(filter["op"], "LESS_THAN");
    }

    #[test]
    fn handles_from_query_skips_read_time_only_rows() {
        // GIVEN: a runQuery response with one match and a trailing readTime row
        let raw = r#"[
            {"document": {"name": "projects/p/databases/(default)/documents/users/user-a@test-users-1.iam.gserviceaccount.com",
                          "fields": {}}, "readTime": "2024-05-01T12:00:00Z"},
            {"readTime": "2024-05-01T12:00:00Z"}
        ]"#;
        let items: Vec<RunQueryItem> = serde_json::from_str(raw).unwrap();

        // WHEN: handles are extracted
        let handles = handles_from_query(items);

        // THEN: only the document row produces a handle
        assert_eq!(handles, vec![handle("user-a")]);
    }

    #[test]
    fn handles_from_query_skips_foreign_documents() {
        let raw = r#"[{"document": {"name": "projects/p/databases/(default)/documents/users/not-an-email"}}]"#;
        let items: Vec<RunQueryItem> = serde_json::from_str(raw).unwrap();
        assert!(handles_from_query(items).is_empty());
    }

    #[test]
    fn document_url_layout() {
        let config = GoogleConfig {
            project_id: "test-users-1".to_string(),
            access_token: Some("ya29.test".to_string()),
            ..GoogleConfig::default()
        };
        let client = Arc::new(GoogleClient::from_config(&config).unwrap());
        let store = FirestoreStore::new(client, &config);

        assert_eq!(
            store.document_url(&handle("user-a")),
            "https://firestore.googleapis.com/v1/projects/test-users-1/databases/(default)/documents/users/user-a@test-users-1.iam.gserviceaccount.com"
        );
    }

    /// Firestore stand-in answering every request with `status` and `body`.
    async fn firestore_answering(status: StatusCode, body: &'static str) -> FirestoreStore {
        let app = axum::Router::new().fallback(move || async move { (status, body) });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = GoogleConfig {
            project_id: "test-users-1".to_string(),
            access_token: Some("ya29.test".to_string()),
            firestore_endpoint: format!("http://{addr}"),
            ..GoogleConfig::default()
        };
        let client = Arc::new(GoogleClient::from_config(&config).unwrap());
        FirestoreStore::new(client, &config)
    }

    #[tokio::test]
    async fn firestore_update_of_missing_document_is_not_found() {
        // GIVEN: Firestore rejecting the `exists` precondition, both ways it reports it
        for (status, body) in [
            (
                StatusCode::NOT_FOUND,
                r#"{"error":{"code":404,"message":"No document to update","status":"NOT_FOUND"}}"#,
            ),
            (
                StatusCode::BAD_REQUEST,
                r#"{"error":{"code":400,"message":"no document","status":"FAILED_PRECONDITION"}}"#,
            ),
        ] {
            let store = firestore_answering(status, body).await;

            // WHEN: a renewal is written
            let result = store.update(&handle("user-ghost"), Utc::now()).await;

            // THEN: NotFound
            assert!(matches!(result, Err(Error::NotFound(_))), "{status}: {result:?}");
        }
    }

    #[tokio::test]
    async fn firestore_update_rejected_request_is_store_error() {
        // GIVEN: Firestore rejecting the request itself
        let store = firestore_answering(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"code":400,"message":"Invalid field path","status":"INVALID_ARGUMENT"}}"#,
        )
        .await;

        // WHEN: a renewal is written
        let result = store.update(&handle("user-a"), Utc::now()).await;

        // THEN: a store failure naming the cause, not a missing record
        assert!(
            matches!(result, Err(Error::Store(ref m)) if m.contains("INVALID_ARGUMENT")),
            "{result:?}"
        );
    }
}
