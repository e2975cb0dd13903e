//! Google API access shared by the IAM and Firestore adapters.
//!
//! Every call carries an OAuth access token for the broker's own service
//! identity. The token comes from one of two places:
//!
//! - a static token from configuration (`google.access_token`, supports
//!   `env:VAR`), useful outside Google Cloud;
//! - the compute metadata server, cached until shortly before expiry.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::GoogleConfig;
use crate::{Error, Result};

/// Refresh metadata tokens this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Where the broker's own access token comes from.
pub enum AccessTokenSource {
    /// Fixed token supplied by configuration
    Static(String),
    /// Compute metadata server (default service account)
    Metadata(MetadataTokenSource),
}

impl AccessTokenSource {
    /// Current bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata server cannot be reached or answers
    /// with something other than a token.
    pub async fn token(&self, http: &reqwest::Client) -> Result<String> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::Metadata(source) => source.token(http).await,
        }
    }
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Access tokens from `{metadata}/instance/service-accounts/default/token`.
pub struct MetadataTokenSource {
    endpoint: String,
    cached: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl MetadataTokenSource {
    /// Create a source against the given metadata base URL.
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            cached: Mutex::new(None),
        }
    }

    async fn token(&self, http: &reqwest::Client) -> Result<String> {
        let fresh = self
            .cached
            .lock()
            .as_ref()
            .filter(|c| Instant::now() < c.refresh_at)
            .map(|c| c.token.clone());
        if let Some(token) = fresh {
            return Ok(token);
        }

        debug!("Fetching access token from metadata server");
        let url = format!("{}/instance/service-accounts/default/token", self.endpoint);
        let response = http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "metadata server returned {}",
                response.status()
            )));
        }
        let fetched: MetadataToken = response.json().await?;

        let lifetime = Duration::from_secs(fetched.expires_in).saturating_sub(EXPIRY_MARGIN);
        *self.cached.lock() = Some(CachedToken {
            token: fetched.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(fetched.access_token)
    }
}

/// Authenticated HTTP client for Google REST APIs.
pub struct GoogleClient {
    http: reqwest::Client,
    tokens: AccessTokenSource,
}

impl GoogleClient {
    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &GoogleConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let tokens = match config.resolve_access_token() {
            Some(token) => AccessTokenSource::Static(token),
            None => AccessTokenSource::Metadata(MetadataTokenSource::new(&config.metadata_endpoint)),
        };
        Ok(Self { http, tokens })
    }

    /// Start a request with the broker's bearer token attached.
    ///
    /// # Errors
    ///
    /// Returns an error if no access token can be obtained.
    pub async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.tokens.token(&self.http).await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// A failed Google API response.
#[derive(Debug, Clone)]
pub struct ApiFailure {
    /// HTTP status of the response
    pub http_status: StatusCode,
    /// Canonical error code (e.g. `FAILED_PRECONDITION`), empty if the body had none
    pub code: String,
    message: String,
}

impl ApiFailure {
    /// Consume a failed response and parse its Google error body.
    pub async fn read(response: Response) -> Self {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Self::from_body(status, &text)
    }

    fn from_body(http_status: StatusCode, body: &str) -> Self {
        let (code, message) = serde_json::from_str::<ApiErrorBody>(body)
            .map(|parsed| (parsed.error.status, parsed.error.message))
            .unwrap_or_default();
        Self {
            http_status,
            code,
            message,
        }
    }
}

impl fmt::Display for ApiFailure {
    /// `<http status>: <STATUS> <message>`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code.is_empty(), self.message.is_empty()) {
            (false, _) => write!(f, "{}: {} {}", self.http_status, self.code, self.message),
            (true, false) => write!(f, "{}: {}", self.http_status, self.message),
            (true, true) => write!(f, "{}", self.http_status),
        }
    }
}

/// Describe a failed Google API response (`<http status>: <STATUS> <message>`).
pub async fn describe_failure(response: Response) -> String {
    ApiFailure::read(response).await.to_string()
}
