//! Identity provider: the platform that owns principals and mints tokens.
//!
//! [`IamProvider`] talks to the IAM and IAM Credentials REST APIs;
//! [`InMemoryProvider`] keeps principals in a map and can be told to fail
//! for chosen handles.
//!
//! Deleting an absent principal is not an error: it surfaces as
//! [`DeleteOutcome::AlreadyAbsent`] so callers never inspect error types to
//! recognise benign absence.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{AccessGrant, DeleteOutcome, Handle, PrincipalId};
use crate::config::GoogleConfig;
use crate::gcp::{GoogleClient, describe_failure};
use crate::{Error, Result};

/// Trait abstracting the identity platform.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Create the principal with account id `principal`.
    async fn create_principal(&self, principal: &PrincipalId) -> Result<()>;

    /// Delete the principal named by `handle`.
    ///
    /// Absence is reported as [`DeleteOutcome::AlreadyAbsent`], not as an error.
    async fn delete_principal(&self, handle: &Handle) -> Result<DeleteOutcome>;

    /// Mint a short-lived access token for `handle` limited to `scopes`.
    async fn mint_token(&self, handle: &Handle, scopes: &[&str]) -> Result<AccessGrant>;
}

/// IAM-backed provider.
pub struct IamProvider {
    client: Arc<GoogleClient>,
    iam_endpoint: String,
    credentials_endpoint: String,
    project_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    #[serde(default)]
    expire_time: Option<DateTime<Utc>>,
}

impl IamProvider {
    /// Create a provider for the configured project.
    #[must_use]
    pub fn new(client: Arc<GoogleClient>, config: &GoogleConfig) -> Self {
        Self {
            client,
            iam_endpoint: config.iam_endpoint.trim_end_matches('/').to_string(),
            credentials_endpoint: config.credentials_endpoint.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
        }
    }

    fn service_accounts_url(&self) -> String {
        format!("{}/projects/{}/serviceAccounts", self.iam_endpoint, self.project_id)
    }

    fn service_account_url(&self, handle: &Handle) -> String {
        format!("{}/{handle}", self.service_accounts_url())
    }

    fn generate_token_url(&self, handle: &Handle) -> String {
        format!(
            "{}/projects/-/serviceAccounts/{handle}:generateAccessToken",
            self.credentials_endpoint
        )
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    request
        .send()
        .await
        .map_err(|e| Error::Provider(format!("request failed: {e}")))
}

#[async_trait::async_trait]
impl IdentityProvider for IamProvider {
    async fn create_principal(&self, principal: &PrincipalId) -> Result<()> {
        let request = self
            .client
            .request(Method::POST, &self.service_accounts_url())
            .await?
            .json(&json!({ "accountId": principal.as_str() }));
        let response = send(request).await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Provider(describe_failure(response).await))
        }
    }

    async fn delete_principal(&self, handle: &Handle) -> Result<DeleteOutcome> {
        let request = self
            .client
            .request(Method::DELETE, &self.service_account_url(handle))
            .await?;
        let response = send(request).await?;

        match response.status() {
            s if s.is_success() => Ok(DeleteOutcome::Deleted),
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::AlreadyAbsent),
            _ => Err(Error::Provider(describe_failure(response).await)),
        }
    }

    async fn mint_token(&self, handle: &Handle, scopes: &[&str]) -> Result<AccessGrant> {
        let request = self
            .client
            .request(Method::POST, &self.generate_token_url(handle))
            .await?
            .json(&json!({ "scope": scopes }));
        let response = send(request).await?;
        if !response.status().is_success() {
            return Err(Error::Provider(describe_failure(response).await));
        }

        let minted: GenerateAccessTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("malformed token response: {e}")))?;
        Ok(AccessGrant {
            access_token: minted.access_token,
            expire_time: minted.expire_time,
        })
    }
}

/// In-memory provider.
///
/// Principals live in a `DashMap` keyed by handle. Failures can be injected
/// per handle ([`fail_for`](Self::fail_for)) or for every create
/// ([`fail_creates`](Self::fail_creates)).
pub struct InMemoryProvider {
    project_id: String,
    principals: DashMap<Handle, PrincipalId>,
    failing: DashMap<Handle, String>,
    fail_creates: AtomicBool,
}

impl InMemoryProvider {
    /// Create an empty provider whose handles live in `project_id`.
    #[must_use]
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            principals: DashMap::new(),
            failing: DashMap::new(),
            fail_creates: AtomicBool::new(false),
        }
    }

    /// Returns `true` if a principal exists for `handle`.
    #[must_use]
    pub fn contains(&self, handle: &Handle) -> bool {
        self.principals.contains_key(handle)
    }

    /// Number of existing principals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.principals.len()
    }

    /// Returns `true` if no principal exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }

    /// Remove a principal behind the broker's back.
    pub fn forget(&self, handle: &Handle) {
        self.principals.remove(handle);
    }

    /// Make every delete and mint for `handle` fail with `reason`.
    pub fn fail_for(&self, handle: &Handle, reason: &str) {
        self.failing.insert(handle.clone(), reason.to_string());
    }

    /// Make every subsequent create fail (or succeed again).
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    fn injected_failure(&self, handle: &Handle) -> Result<()> {
        match self.failing.get(handle) {
            Some(reason) => Err(Error::Provider(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl IdentityProvider for InMemoryProvider {
    async fn create_principal(&self, principal: &PrincipalId) -> Result<()> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::Provider("principal creation failed".to_string()));
        }
        let handle = Handle::for_principal(principal, &self.project_id);
        if self.principals.contains_key(&handle) {
            return Err(Error::Provider(format!("principal already exists: {handle}")));
        }
        self.principals.insert(handle, principal.clone());
        Ok(())
    }

    async fn delete_principal(&self, handle: &Handle) -> Result<DeleteOutcome> {
        self.injected_failure(handle)?;
        if self.principals.remove(handle).is_some() {
            Ok(DeleteOutcome::Deleted)
        } else {
            debug!(handle = %handle, "Principal already absent");
            Ok(DeleteOutcome::AlreadyAbsent)
        }
    }

    async fn mint_token(&self, handle: &Handle, _scopes: &[&str]) -> Result<AccessGrant> {
        self.injected_failure(handle)?;
        if !self.principals.contains_key(handle) {
            return Err(Error::Provider(format!("principal not found: {handle}")));
        }
        Ok(AccessGrant {
            access_token: format!("memory.{}", uuid::Uuid::new_v4().simple()),
            expire_time: Some(Utc::now() + TimeDelta::hours(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TOKEN_SCOPES;

    const PROJECT: &str = "test-users-1";

    #[tokio::test]
    async fn create_then_delete() {
        // GIVEN: a principal created in the provider
        let provider = InMemoryProvider::new(PROJECT);
        let id = PrincipalId::generate();
        let handle = Handle::for_principal(&id, PROJECT);
        provider.create_principal(&id).await.unwrap();
        assert!(provider.contains(&handle));

        // WHEN: deleted twice
        let first = provider.delete_principal(&handle).await.unwrap();
        let second = provider.delete_principal(&handle).await.unwrap();

        // THEN: first removes it, second reports absence without error
        assert_eq!(first, DeleteOutcome::Deleted);
        assert_eq!(second, DeleteOutcome::AlreadyAbsent);
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn injected_failure_blocks_delete() {
        let provider = InMemoryProvider::new(PROJECT);
        let id = PrincipalId::generate();
        let handle = Handle::for_principal(&id, PROJECT);
        provider.create_principal(&id).await.unwrap();
        provider.fail_for(&handle, "backend unavailable");

        let result = provider.delete_principal(&handle).await;

        assert!(matches!(result, Err(Error::Provider(ref m)) if m == "backend unavailable"));
        assert!(provider.contains(&handle));
    }

    #[tokio::test]
    async fn create_failure_can_be_injected() {
        let provider = InMemoryProvider::new(PROJECT);
        provider.fail_creates(true);

        let result = provider.create_principal(&PrincipalId::generate()).await;

        assert!(matches!(result, Err(Error::Provider(_))));
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn mint_requires_existing_principal() {
        // GIVEN: an empty provider
        let provider = InMemoryProvider::new(PROJECT);
        let handle = Handle::for_principal(&PrincipalId::generate(), PROJECT);

        // WHEN: minting for an unknown handle
        let result = provider.mint_token(&handle, &TOKEN_SCOPES).await;

        // THEN: provider error
        assert!(matches!(result, Err(Error::Provider(_))));
    }

    #[tokio::test]
    async fn mint_returns_expiring_grant() {
        let provider = InMemoryProvider::new(PROJECT);
        let id = PrincipalId::generate();
        provider.create_principal(&id).await.unwrap();

        let grant = provider
            .mint_token(&Handle::for_principal(&id, PROJECT), &TOKEN_SCOPES)
            .await
            .unwrap();

        assert!(grant.access_token.starts_with("memory."));
        assert!(grant.expire_time.unwrap() > Utc::now());
    }

    #[test]
    fn iam_urls() {
        let config = GoogleConfig {
            project_id: PROJECT.to_string(),
            access_token: Some("ya29.test".to_string()),
            ..GoogleConfig::default()
        };
        let client = Arc::new(GoogleClient::from_config(&config).unwrap());
        let provider = IamProvider::new(client, &config);
        let handle = Handle::parse("user-a@test-users-1.iam.gserviceaccount.com").unwrap();

        assert_eq!(
            provider.service_accounts_url(),
            "https://iam.googleapis.com/v1/projects/test-users-1/serviceAccounts"
        );
        assert_eq!(
            provider.service_account_url(&handle),
            "https://iam.googleapis.com/v1/projects/test-users-1/serviceAccounts/user-a@test-users-1.iam.gserviceaccount.com"
        );
        assert_eq!(
            provider.generate_token_url(&handle),
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/user-a@test-users-1.iam.gserviceaccount.com:generateAccessToken"
        );
    }

    #[test]
    fn token_response_parses_expire_time() {
        let raw = r#"{"accessToken": "ya29.abc", "expireTime": "2024-05-01T13:00:00Z"}"#;
        let parsed: GenerateAccessTokenResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.access_token, "ya29.abc");
        assert_eq!(parsed.expire_time.unwrap().timestamp(), 1_714_568_400);
    }
}
