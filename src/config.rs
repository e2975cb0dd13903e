//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Caller authentication
    pub auth: AuthConfig,
    /// Google Cloud project and API endpoints
    pub google: GoogleConfig,
    /// Which adapters back the identity provider and liveness store
    pub backend: BackendKind,
    /// Liveness and reclamation settings
    pub lifecycle: LifecycleConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_body_size: 64 * 1024,
        }
    }
}

/// Caller authentication: the single trusted issuer, audience and caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Trusted OIDC issuer (`iss` claim must match exactly)
    pub issuer: String,
    /// JWKS location; derived from the issuer when unset
    pub jwks_uri: Option<String>,
    /// Expected `aud` claim
    pub audience: String,
    /// Claim compared against `authorized_value`
    pub claim: String,
    /// The only claim value allowed to call gated operations
    /// Supports: literal value or `env:VAR_NAME`
    pub authorized_value: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: GOOGLE_ISSUER.to_string(),
            jwks_uri: None,
            audience: String::new(),
            claim: "email".to_string(),
            authorized_value: String::new(),
        }
    }
}

/// Issuer of Google-signed ID tokens.
pub const GOOGLE_ISSUER: &str = "https://accounts.google.com";

/// Google publishes its signing keys outside the issuer's well-known path.
const GOOGLE_JWKS_URI: &str = "https://www.googleapis.com/oauth2/v3/certs";

impl AuthConfig {
    /// Resolve the authorized claim value (expand `env:` references)
    #[must_use]
    pub fn resolve_authorized_value(&self) -> String {
        resolve_env_ref(&self.authorized_value)
    }

    /// JWKS URI to fetch signing keys from
    #[must_use]
    pub fn resolved_jwks_uri(&self) -> String {
        if let Some(uri) = &self.jwks_uri {
            return uri.clone();
        }
        if self.issuer.trim_end_matches('/') == GOOGLE_ISSUER {
            return GOOGLE_JWKS_URI.to_string();
        }
        format!("{}/.well-known/jwks.json", self.issuer.trim_end_matches('/'))
    }
}

/// Google Cloud project and REST endpoints used by the adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    /// Project that owns the managed service accounts and the Firestore database
    pub project_id: String,
    /// Static OAuth access token for the Google APIs
    /// Supports: literal value or `env:VAR_NAME`. When unset, the metadata server is used.
    pub access_token: Option<String>,
    /// IAM API base URL
    pub iam_endpoint: String,
    /// IAM Credentials API base URL
    pub credentials_endpoint: String,
    /// Firestore API base URL
    pub firestore_endpoint: String,
    /// Firestore database id
    pub firestore_database: String,
    /// Collection holding one liveness document per identity
    pub firestore_collection: String,
    /// Compute metadata server base URL
    pub metadata_endpoint: String,
    /// Per-request timeout for Google API calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            access_token: None,
            iam_endpoint: "https://iam.googleapis.com/v1".to_string(),
            credentials_endpoint: "https://iamcredentials.googleapis.com/v1".to_string(),
            firestore_endpoint: "https://firestore.googleapis.com/v1".to_string(),
            firestore_database: "(default)".to_string(),
            firestore_collection: "users".to_string(),
            metadata_endpoint: "http://metadata.google.internal/computeMetadata/v1".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

impl GoogleConfig {
    /// Resolve the static access token (expand `env:` references)
    #[must_use]
    pub fn resolve_access_token(&self) -> Option<String> {
        self.access_token
            .as_deref()
            .map(resolve_env_ref)
            .filter(|t| !t.is_empty())
    }
}

/// Adapter selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// IAM + IAM Credentials + Firestore
    #[default]
    Google,
    /// Process-local maps, for development
    Memory,
}

/// Liveness and reclamation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Inactivity after which an identity is reclaimed
    #[serde(with = "humantime_serde")]
    pub reclaim_after: Duration,
    /// Run a reclamation sweep in-process at this interval
    #[serde(with = "humantime_serde::option")]
    pub reclaim_interval: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reclaim_after: Duration::from_secs(60 * 60),
            reclaim_interval: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (IDBROKER_ prefix)
        figment = figment.merge(Env::prefixed("IDBROKER_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Check the settings the service cannot run without
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let issuer = url::Url::parse(&self.auth.issuer)
            .map_err(|e| Error::Config(format!("auth.issuer is not a URL: {e}")))?;
        if issuer.scheme() != "https" {
            return Err(Error::Config(format!(
                "auth.issuer must be https, got {}",
                issuer.scheme()
            )));
        }
        if self.auth.audience.trim().is_empty() {
            return Err(Error::Config("auth.audience is required".to_string()));
        }
        if self.auth.claim.trim().is_empty() {
            return Err(Error::Config("auth.claim must not be empty".to_string()));
        }
        let authorized_value = self.auth.resolve_authorized_value();
        if authorized_value.trim().is_empty() {
            return Err(Error::Config("auth.authorized_value is required".to_string()));
        }
        if let Some(var) = authorized_value.strip_prefix("env:") {
            return Err(Error::Config(format!(
                "auth.authorized_value references unset environment variable {var}"
            )));
        }
        if let Some(var) = self
            .google
            .resolve_access_token()
            .as_deref()
            .and_then(|t| t.strip_prefix("env:"))
        {
            return Err(Error::Config(format!(
                "google.access_token references unset environment variable {var}"
            )));
        }
        if !crate::identity::is_valid_project_id(&self.google.project_id) {
            return Err(Error::Config(format!(
                "google.project_id is not a valid project id: {:?}",
                self.google.project_id
            )));
        }
        if self.lifecycle.reclaim_after.is_zero() {
            return Err(Error::Config(
                "lifecycle.reclaim_after must be greater than zero".to_string(),
            ));
        }
        if self.lifecycle.reclaim_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::Config(
                "lifecycle.reclaim_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        // Pattern: ${VAR} or ${VAR:-default}
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        for value in [
            &mut self.auth.issuer,
            &mut self.auth.audience,
            &mut self.auth.authorized_value,
            &mut self.google.project_id,
        ] {
            *value = Self::expand_string(&re, value);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// `env:VAR` → value of `VAR` (or the literal when unset); anything else verbatim.
fn resolve_env_ref(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "1h", "100ms" or a bare number of seconds
    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 60 * 60))
        } else {
            // Assume seconds
            s.parse::<u64>().map(Duration::from_secs)
        }
    }

    /// Same format for `Option<Duration>`; `null` means unset
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional Duration
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration string
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
