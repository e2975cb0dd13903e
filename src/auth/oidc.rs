//! OIDC ID token verification - JWT signature validation and JWKS caching.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Read the unverified `iss` claim and reject anything but the trusted issuer
//!    before any key fetch happens.
//! 3. Fetch the issuer's JWKS (cached for 1 hour; refreshed once on unknown `kid`).
//! 4. Verify the signature and `exp`/`nbf`/`iss`.
//! 5. Check `aud` against the configured audience (string or array form).
//! 6. Return [`VerifiedClaims`] with every claim of the token.
//!
//! Clock leeway of 60 seconds tolerates minor skew between the issuer and
//! this host. Only RSA and EC signatures are accepted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    errors::ErrorKind,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{IdTokenVerifier, VerifiedClaims};
use crate::config::{AuthConfig, GOOGLE_ISSUER};

/// Error variants for OIDC verification failures.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// JWT decode / signature / standard claim verification failed.
    #[error("JWT verification failed: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),

    /// The token was issued by someone other than the trusted issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Configured issuer.
        expected: String,
        /// Issuer found in the token.
        actual: String,
    },

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the issuer's JWKS.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The JWT is signed with an algorithm we do not accept.
    #[error("Unsupported JWT algorithm: {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    /// Network or HTTP error while fetching JWKS.
    #[error("JWKS fetch error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl OidcError {
    fn invalid_token() -> Self {
        Self::JwtError(jsonwebtoken::errors::Error::from(ErrorKind::InvalidToken))
    }
}

/// Claims read before the signature is checked; only used to pick the issuer.
#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    #[serde(default)]
    iss: String,
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// JWKS cache: one entry per JWKS URI.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    /// How long to cache a fetched JWKS (default 1 hour).
    ttl: Duration,
}

impl JwksCache {
    /// Create with default 1-hour TTL.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
            http: reqwest::Client::builder()
                .https_only(true)
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            ttl: Duration::from_secs(3600),
        }
    }

    /// Return the cached JWKS for `jwks_uri`, fetching it if stale.
    ///
    /// If `force_refresh` is `true`, the cache is bypassed regardless of TTL.
    pub async fn get_or_fetch(&self, jwks_uri: &str, force_refresh: bool) -> Result<JwkSet, OidcError> {
        if !force_refresh {
            if let Some(cached) = self.inner.get(jwks_uri) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!("Fetching JWKS from {jwks_uri}");
        let jwks: JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.inner.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
                ttl: self.ttl,
            },
        );

        Ok(jwks)
    }
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new()
    }
}

/// OIDC ID token verifier for a single trusted issuer and audience.
pub struct OidcVerifier {
    issuer: String,
    audience: String,
    jwks_uri: String,
    jwks_cache: Arc<JwksCache>,
}

impl OidcVerifier {
    /// Create from the authentication configuration.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            jwks_uri: config.resolved_jwks_uri(),
            jwks_cache: Arc::new(JwksCache::new()),
        }
    }

    /// Verify an OIDC ID token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError`] if the token is malformed, expired, from another
    /// issuer, for another audience, or signed with an unknown key.
    pub async fn verify_token(&self, token: &str) -> Result<VerifiedClaims, OidcError> {
        let header = jsonwebtoken::decode_header(token)?;

        let unverified = extract_unverified_claims(token)?;
        if !issuer_matches(&unverified.iss, &self.issuer) {
            return Err(OidcError::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: unverified.iss,
            });
        }

        let validation = build_validation(&header, &unverified.iss)?;
        let kid = header.kid.clone().ok_or(OidcError::MissingKeyId)?;
        let decoding_key = self.find_decoding_key(&kid).await?;

        // Verify signature + exp/nbf/iss claims
        let token_data: TokenData<Map<String, Value>> =
            jsonwebtoken::decode(token, &decoding_key, &validation)?;
        let claims = token_data.claims;

        // Manual audience check (string or array form)
        check_audience(claims.get("aud").unwrap_or(&Value::Null), &self.audience)?;

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(VerifiedClaims { subject, claims })
    }

    /// Find a decoding key by `kid`, refreshing the JWKS cache if not found.
    async fn find_decoding_key(&self, kid: &str) -> Result<DecodingKey, OidcError> {
        let jwks = self.jwks_cache.get_or_fetch(&self.jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        // Unknown kid: refresh once and retry
        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks_cache.get_or_fetch(&self.jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| OidcError::UnknownKeyId(kid.to_string()))
    }
}

#[async_trait::async_trait]
impl IdTokenVerifier for OidcVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedClaims, OidcError> {
        self.verify_token(token).await
    }
}

/// Exact match up to a trailing slash. Google also issues tokens with the
/// scheme-less `accounts.google.com`, accepted only when Google is the issuer.
fn issuer_matches(actual: &str, expected: &str) -> bool {
    let actual = actual.trim_end_matches('/');
    let expected = expected.trim_end_matches('/');
    if actual.is_empty() {
        return false;
    }
    actual == expected
        || (expected == GOOGLE_ISSUER && Some(actual) == GOOGLE_ISSUER.strip_prefix("https://"))
}

/// Extract claims from a JWT without signature verification.
fn extract_unverified_claims(token: &str) -> Result<UnverifiedClaims, OidcError> {
    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() < 3 {
        return Err(OidcError::invalid_token());
    }

    let payload = base64::Engine::decode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        parts[1],
    )
    .map_err(|_| OidcError::invalid_token())?;

    serde_json::from_slice::<UnverifiedClaims>(&payload).map_err(|_| OidcError::invalid_token())
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        let jwk_kid = jwk.common.key_id.as_deref().unwrap_or("");
        if jwk_kid != kid {
            continue;
        }

        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Build a [`Validation`] pinned to the header's (asymmetric) algorithm.
///
/// `iss` is validated against the issuer string as it appears in the token,
/// which [`issuer_matches`] has already compared with the configured one.
fn build_validation(header: &Header, issuer: &str) -> Result<Validation, OidcError> {
    let alg = match header.alg {
        alg @ (Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::ES256
        | Algorithm::ES384) => alg,
        other => return Err(OidcError::UnsupportedAlgorithm(other)),
    };

    let mut v = Validation::new(alg);
    v.leeway = 60;
    v.validate_nbf = true;
    v.set_issuer(&[issuer]);
    // Audience is checked manually to support both string and array forms
    v.validate_aud = false;
    Ok(v)
}

/// Validate that the token's `aud` claim contains the expected audience.
fn check_audience(aud_claim: &Value, expected: &str) -> Result<(), OidcError> {
    let matches = match aud_claim {
        Value::String(s) => s == expected,
        Value::Array(arr) => arr.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(OidcError::JwtError(jsonwebtoken::errors::Error::from(
            ErrorKind::InvalidAudience,
        )))
    }
}
