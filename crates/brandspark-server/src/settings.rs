//! Runtime settings: an optional TOML file overlaid by the process
//! environment.

use std::{path::Path, time::Duration};

use brandspark_engine::GeminiConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error(transparent)]
  Load(#[from] config::ConfigError),

  #[error("missing required setting(s): {}", .0.join(", "))]
  Missing(Vec<&'static str>),

  #[error("invalid setting `{key}`: {reason}")]
  Invalid { key: &'static str, reason: String },
}

/// Runtime server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  #[serde(default)]
  pub database_url:        String,
  #[serde(default)]
  pub jwks_url:            String,
  #[serde(default)]
  pub jwt_issuer:          String,
  #[serde(default)]
  pub google_api_key:      String,

  #[serde(default = "default_host")]
  pub host:                String,
  #[serde(default = "default_port")]
  pub port:                u16,
  #[serde(default = "default_audience")]
  pub jwt_audience:        String,
  #[serde(default = "default_pool_size")]
  pub database_pool_size:  usize,
  #[serde(default = "default_jwks_ttl")]
  pub jwks_cache_ttl_secs: u64,
  #[serde(default = "default_model")]
  pub gemini_model:        String,
  #[serde(default = "default_gemini_url")]
  pub gemini_base_url:     String,
  #[serde(default = "default_max_jobs")]
  pub max_concurrent_jobs: usize,
  #[serde(default)]
  pub job_timeout_secs:    Option<u64>,
  #[serde(default = "default_grace")]
  pub shutdown_grace_secs: u64,
  #[serde(default)]
  pub enable_simulation:   bool,
}

fn default_host() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 8080 }
fn default_audience() -> String { "authenticated".into() }
fn default_pool_size() -> usize { 4 }
fn default_jwks_ttl() -> u64 { 600 }
fn default_model() -> String { GeminiConfig::DEFAULT_MODEL.into() }
fn default_gemini_url() -> String { GeminiConfig::DEFAULT_BASE_URL.into() }
fn default_max_jobs() -> usize { 8 }
fn default_grace() -> u64 { 30 }

impl ServerConfig {
  /// Read `path` (if it exists) and the environment, then validate.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::default())
      .build()?;
    Self::from_settings(settings)
  }

  pub fn from_settings(settings: config::Config) -> Result<Self, ConfigError> {
    let cfg: Self = settings.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
  }

  fn validate(&self) -> Result<(), ConfigError> {
    let required = [
      ("database_url", &self.database_url),
      ("jwks_url", &self.jwks_url),
      ("jwt_issuer", &self.jwt_issuer),
      ("google_api_key", &self.google_api_key),
    ];
    let missing: Vec<&'static str> = required
      .iter()
      .filter(|(_, value)| value.trim().is_empty())
      .map(|(key, _)| *key)
      .collect();
    if !missing.is_empty() {
      return Err(ConfigError::Missing(missing));
    }

    if self.database_pool_size == 0 {
      return Err(ConfigError::Invalid {
        key:    "database_pool_size",
        reason: "must be at least 1".into(),
      });
    }
    if self.max_concurrent_jobs == 0 {
      return Err(ConfigError::Invalid {
        key:    "max_concurrent_jobs",
        reason: "must be at least 1".into(),
      });
    }
    if self.job_timeout_secs == Some(0) {
      return Err(ConfigError::Invalid {
        key:    "job_timeout_secs",
        reason: "must be positive when set".into(),
      });
    }
    Ok(())
  }

  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }

  pub fn jwks_cache_ttl(&self) -> Duration { Duration::from_secs(self.jwks_cache_ttl_secs) }

  pub fn job_timeout(&self) -> Option<Duration> { self.job_timeout_secs.map(Duration::from_secs) }

  pub fn shutdown_grace(&self) -> Duration { Duration::from_secs(self.shutdown_grace_secs) }
}
