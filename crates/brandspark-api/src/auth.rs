//! Bearer-token verification against a published JSON Web Key Set, and the
//! [`CurrentUser`] extractor built on it.

use std::time::{Duration, Instant};

use axum::{
  extract::FromRequestParts,
  http::{header, request::Parts},
};
use brandspark_core::{engine::AnalysisEngine, gateway::Gateway};
use jsonwebtoken::{
  Algorithm, DecodingKey, Validation,
  errors::ErrorKind,
  jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm},
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

#[derive(Debug, Error)]
pub enum AuthError {
  /// The verifier itself is misconfigured. Not the caller's fault.
  #[error("verifier misconfigured: {0}")]
  Configuration(String),

  #[error("credential has expired")]
  Expired,

  #[error("invalid signature: {0}")]
  InvalidSignature(String),

  #[error("malformed credential: {0}")]
  Malformed(String),

  /// Audience, issuer or another registered claim failed validation.
  #[error("unverifiable claims: {0}")]
  UnverifiableClaims(String),

  #[error("credential has no subject")]
  MissingSubject,

  #[error("key set unavailable: {0}")]
  KeySetUnavailable(String),
}

impl AuthError {
  /// `true` when the caller should be told 401 rather than 500.
  pub fn is_credential_problem(&self) -> bool {
    !matches!(self, Self::Configuration(_) | Self::KeySetUnavailable(_))
  }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
  fn from(e: jsonwebtoken::errors::Error) -> Self {
    match e.kind() {
      ErrorKind::ExpiredSignature => Self::Expired,
      ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
        Self::InvalidSignature(e.to_string())
      }
      ErrorKind::InvalidAudience
      | ErrorKind::InvalidIssuer
      | ErrorKind::ImmatureSignature
      | ErrorKind::MissingRequiredClaim(_) => Self::UnverifiableClaims(e.to_string()),
      ErrorKind::InvalidEcdsaKey
      | ErrorKind::InvalidRsaKey(_)
      | ErrorKind::InvalidKeyFormat => Self::Configuration(e.to_string()),
      _ => Self::Malformed(e.to_string()),
    }
  }
}

#[derive(Debug, Deserialize)]
struct Claims {
  sub: Option<String>,
}

// ─── Key set ─────────────────────────────────────────────────────────────────

/// Shortest gap between two refreshes forced by an unknown key id.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

struct CachedKeys {
  keys:       JwkSet,
  fetched_at: Instant,
}

enum KeySource {
  Remote { url: String, ttl: Duration, min_refresh: Duration },
  Static,
}

/// Verifies bearer tokens and yields the subject's user id.
pub struct JwksVerifier {
  source:   KeySource,
  audience: String,
  issuer:   String,
  client:   reqwest::Client,
  cache:    RwLock<Option<CachedKeys>>,
}

impl JwksVerifier {
  /// A verifier that fetches keys from `jwks_url` and caches them for `ttl`.
  pub fn remote(
    jwks_url: impl Into<String>,
    audience: impl Into<String>,
    issuer: impl Into<String>,
    ttl: Duration,
  ) -> Result<Self, AuthError> {
    let url = jwks_url.into();
    if url.trim().is_empty() {
      return Err(AuthError::Configuration("key-set endpoint is not set".into()));
    }
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| AuthError::Configuration(e.to_string()))?;
    Ok(Self {
      source: KeySource::Remote { url, ttl, min_refresh: DEFAULT_MIN_REFRESH_INTERVAL },
      audience: audience.into(),
      issuer: issuer.into(),
      client,
      cache: RwLock::new(None),
    })
  }

  /// Change how soon an unknown key id may trigger another fetch. Has no
  /// effect on a static key set.
  pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
    if let KeySource::Remote { min_refresh, .. } = &mut self.source {
      *min_refresh = interval;
    }
    self
  }

  /// A verifier with a fixed key set that is never refreshed.
  pub fn with_static_keys(
    keys: JwkSet,
    audience: impl Into<String>,
    issuer: impl Into<String>,
  ) -> Self {
    Self {
      source:   KeySource::Static,
      audience: audience.into(),
      issuer:   issuer.into(),
      client:   reqwest::Client::new(),
      cache:    RwLock::new(Some(CachedKeys { keys, fetched_at: Instant::now() })),
    }
  }

  /// Verify `token` and return the user id in its `sub` claim.
  pub async fn verify(&self, token: &str) -> Result<Uuid, AuthError> {
    let header = jsonwebtoken::decode_header(token)
      .map_err(|e| AuthError::Malformed(e.to_string()))?;
    let kid = header
      .kid
      .ok_or_else(|| AuthError::Malformed("token header has no key id".into()))?;

    let jwk = self.key(&kid).await?;
    let algorithm = algorithm_for(&jwk, header.alg)?;
    let key = DecodingKey::from_jwk(&jwk)?;

    let mut validation = Validation::new(algorithm);
    validation.set_audience(&[&self.audience]);
    validation.set_issuer(&[&self.issuer]);
    validation.set_required_spec_claims(&["exp", "aud", "iss"]);

    let data = jsonwebtoken::decode::<Claims>(token, &key, &validation)?;
    let sub = data
      .claims
      .sub
      .filter(|s| !s.trim().is_empty())
      .ok_or(AuthError::MissingSubject)?;
    Uuid::parse_str(&sub).map_err(|_| AuthError::Malformed("subject is not a UUID".into()))
  }

  /// Find `kid`, fetching the key set when the cache is stale or lacks it.
  /// A fresh cache that lacks `kid` is refetched at most once per
  /// `min_refresh`.
  async fn key(&self, kid: &str) -> Result<Jwk, AuthError> {
    let (url, ttl, min_refresh) = match &self.source {
      KeySource::Remote { url, ttl, min_refresh } => (url, *ttl, *min_refresh),
      KeySource::Static => {
        return self
          .cache
          .read()
          .await
          .as_ref()
          .and_then(|c| c.keys.find(kid).cloned())
          .ok_or_else(|| unknown_kid(kid));
      }
    };

    {
      let cache = self.cache.read().await;
      if let Some(c) = cache.as_ref().filter(|c| c.fetched_at.elapsed() < ttl) {
        if let Some(jwk) = c.keys.find(kid) {
          return Ok(jwk.clone());
        }
        if c.fetched_at.elapsed() < min_refresh {
          tracing::debug!(kid, "unknown key id; key set refreshed too recently");
          return Err(unknown_kid(kid));
        }
      }
    }

    let keys = self.fetch(url).await?;
    let jwk = keys.find(kid).cloned();
    *self.cache.write().await = Some(CachedKeys { keys, fetched_at: Instant::now() });
    jwk.ok_or_else(|| unknown_kid(kid))
  }

  async fn fetch(&self, url: &str) -> Result<JwkSet, AuthError> {
    let keys: JwkSet = self
      .client
      .get(url)
      .send()
      .await
      .and_then(reqwest::Response::error_for_status)
      .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?
      .json()
      .await
      .map_err(|e| AuthError::KeySetUnavailable(e.to_string()))?;
    tracing::debug!(keys = keys.keys.len(), "fetched signing key set");
    Ok(keys)
  }
}

fn unknown_kid(kid: &str) -> AuthError {
  AuthError::InvalidSignature(format!("no signing key with id {kid:?}"))
}

/// The key's own `alg` if declared, else the header's algorithm as long as
/// it belongs to the key's family.
fn algorithm_for(jwk: &Jwk, header_alg: Algorithm) -> Result<Algorithm, AuthError> {
  if let Some(declared) = jwk.common.key_algorithm.as_ref() {
    return signing_algorithm(declared).ok_or_else(|| {
      AuthError::Configuration(format!("key algorithm {declared:?} cannot verify signatures"))
    });
  }

  use Algorithm::*;
  let allowed: &[Algorithm] = match &jwk.algorithm {
    AlgorithmParameters::RSA(_) => &[RS256, RS384, RS512, PS256, PS384, PS512],
    AlgorithmParameters::EllipticCurve(_) => &[ES256, ES384],
    AlgorithmParameters::OctetKey(_) => &[HS256, HS384, HS512],
    AlgorithmParameters::OctetKeyPair(_) => &[EdDSA],
    #[allow(unreachable_patterns)]
    _ => &[],
  };
  if allowed.contains(&header_alg) {
    Ok(header_alg)
  } else {
    Err(AuthError::InvalidSignature(format!(
      "algorithm {header_alg:?} does not match the signing key"
    )))
  }
}

fn signing_algorithm(alg: &KeyAlgorithm) -> Option<Algorithm> {
  Some(match alg {
    KeyAlgorithm::HS256 => Algorithm::HS256,
    KeyAlgorithm::HS384 => Algorithm::HS384,
    KeyAlgorithm::HS512 => Algorithm::HS512,
    KeyAlgorithm::ES256 => Algorithm::ES256,
    KeyAlgorithm::ES384 => Algorithm::ES384,
    KeyAlgorithm::RS256 => Algorithm::RS256,
    KeyAlgorithm::RS384 => Algorithm::RS384,
    KeyAlgorithm::RS512 => Algorithm::RS512,
    KeyAlgorithm::PS256 => Algorithm::PS256,
    KeyAlgorithm::PS384 => Algorithm::PS384,
    KeyAlgorithm::PS512 => Algorithm::PS512,
    KeyAlgorithm::EdDSA => Algorithm::EdDSA,
    _ => return None,
  })
}

// ─── Extractor ───────────────────────────────────────────────────────────────

/// The authenticated caller. Extracting it also makes sure the caller has a
/// profile row.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser {
  pub id: Uuid,
}

fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
  let value = parts
    .headers
    .get(header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .ok_or_else(|| AuthError::Malformed("missing bearer token".into()))?;

  let (scheme, token) = value
    .split_once(' ')
    .ok_or_else(|| AuthError::Malformed("missing bearer token".into()))?;
  if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
    return Err(AuthError::Malformed("missing bearer token".into()));
  }
  Ok(token.trim())
}

impl<S, E> FromRequestParts<AppState<S, E>> for CurrentUser
where
  S: Gateway + 'static,
  E: AnalysisEngine + 'static,
{
  type Rejection = ApiError;

  async fn from_request_parts(
    parts: &mut Parts,
    state: &AppState<S, E>,
  ) -> Result<Self, Self::Rejection> {
    let token = bearer_token(parts)?;
    let id = state.verifier.verify(token).await?;
    state.gateway.ensure_user_profile(id).await?;
    Ok(CurrentUser { id })
  }
}
