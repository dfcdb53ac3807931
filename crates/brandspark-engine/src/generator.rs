//! Text generation backends.

use std::{future::Future, time::Duration};

use brandspark_core::engine::EngineError;
use reqwest::StatusCode;
use serde::Deserialize;

/// Something that turns an instruction plus input text into generated text.
pub trait TextGenerator: Send + Sync {
  fn generate<'a>(
    &'a self,
    instruction: &'a str,
    input: &'a str,
  ) -> impl Future<Output = Result<String, EngineError>> + Send + 'a;
}

// ─── Retry policy ─────────────────────────────────────────────────────────────

/// Exponential backoff for transient upstream failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Total attempts, including the first.
  pub attempts:      u32,
  pub initial_delay: Duration,
  pub exp_base:      f64,
  pub max_delay:     Duration,
  pub statuses:      Vec<u16>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts:      5,
      initial_delay: Duration::from_secs(1),
      exp_base:      7.0,
      max_delay:     Duration::from_secs(60),
      statuses:      vec![429, 500, 502, 503, 504],
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `retry` (0-based).
  pub fn delay(&self, retry: u32) -> Duration {
    let factor = self.exp_base.powi(retry.min(64) as i32);
    let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
    Duration::from_secs_f64(secs.max(0.0))
  }

  fn retries_status(&self, status: StatusCode) -> bool {
    self.statuses.contains(&status.as_u16())
  }
}

// ─── Gemini ───────────────────────────────────────────────────────────────────

/// Connection settings for the Gemini `generateContent` API.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
  pub api_key:  String,
  pub model:    String,
  pub base_url: String,
  pub retry:    RetryPolicy,
}

impl GeminiConfig {
  pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com";
  pub const DEFAULT_MODEL: &'static str = "gemini-2.5-flash";

  pub fn new(api_key: impl Into<String>) -> Self {
    Self {
      api_key:  api_key.into(),
      model:    Self::DEFAULT_MODEL.to_owned(),
      base_url: Self::DEFAULT_BASE_URL.to_owned(),
      retry:    RetryPolicy::default(),
    }
  }
}

/// [`TextGenerator`] backed by Google's Gemini REST API.
///
/// Cheap to clone; the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Clone)]
pub struct GeminiGenerator {
  client: reqwest::Client,
  config: GeminiConfig,
}

impl std::fmt::Debug for GeminiGenerator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("GeminiGenerator")
      .field("model", &self.config.model)
      .field("base_url", &self.config.base_url)
      .finish()
  }
}

#[derive(Deserialize)]
struct GenerateResponse {
  #[serde(default)]
  candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
  content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
  #[serde(default)]
  parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
  text: Option<String>,
}

impl GeminiGenerator {
  pub fn new(config: GeminiConfig) -> Result<Self, EngineError> {
    if config.api_key.trim().is_empty() {
      return Err(EngineError::Generation("Gemini API key is empty".into()));
    }
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(300))
      .build()
      .map_err(|e| EngineError::Generation(format!("failed to build HTTP client: {e}")))?;
    Ok(Self { client, config })
  }

  fn url(&self) -> String {
    format!(
      "{}/v1beta/models/{}:generateContent",
      self.config.base_url.trim_end_matches('/'),
      self.config.model,
    )
  }

  /// One request; `Ok(None)` means a retryable failure.
  async fn attempt(
    &self,
    body: &serde_json::Value,
  ) -> Result<Option<String>, EngineError> {
    let resp = match self
      .client
      .post(self.url())
      .header("x-goog-api-key", &self.config.api_key)
      .json(body)
      .send()
      .await
    {
      Ok(resp) => resp,
      Err(e) if e.is_timeout() || e.is_connect() => {
        tracing::warn!(error = %e, "Gemini request failed");
        return Ok(None);
      }
      Err(e) => return Err(EngineError::Generation(format!("Gemini request failed: {e}"))),
    };

    let status = resp.status();
    if self.config.retry.retries_status(status) {
      tracing::warn!(%status, "Gemini returned a retryable status");
      return Ok(None);
    }
    if !status.is_success() {
      let text = resp.text().await.unwrap_or_default();
      return Err(EngineError::Generation(format!("Gemini error {status}: {text}")));
    }

    let parsed: GenerateResponse = resp
      .json()
      .await
      .map_err(|e| EngineError::Generation(format!("Gemini response parse error: {e}")))?;

    let text = parsed
      .candidates
      .into_iter()
      .next()
      .and_then(|c| c.content)
      .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<String>())
      .unwrap_or_default();
    Ok(Some(text))
  }
}

impl TextGenerator for GeminiGenerator {
  async fn generate<'a>(
    &'a self,
    instruction: &'a str,
    input: &'a str,
  ) -> Result<String, EngineError> {
    let body = serde_json::json!({
      "systemInstruction": { "parts": [{ "text": instruction }] },
      "contents": [{ "role": "user", "parts": [{ "text": input }] }],
    });

    let attempts = self.config.retry.attempts.max(1);
    for attempt in 0..attempts {
      if attempt > 0 {
        tokio::time::sleep(self.config.retry.delay(attempt - 1)).await;
      }
      if let Some(text) = self.attempt(&body).await? {
        return Ok(text);
      }
    }

    Err(EngineError::Generation(format!(
      "Gemini still failing after {attempts} attempts"
    )))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
  use serde_json::{Value, json};
  use tokio::net::TcpListener;

  use super::*;

  /// Serve a fake `generateContent` that fails `failures` times first.
  async fn fake_gemini(failures: usize, status: StatusCode) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));

    async fn handler(
      State((calls, failures, status)): State<(Arc<AtomicUsize>, usize, StatusCode)>,
      Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      if n < failures {
        return (status, Json(json!({ "error": "busy" })));
      }
      let input = body["contents"][0]["parts"][0]["text"].as_str().unwrap_or_default();
      let reply = json!({
        "candidates": [{
          "content": { "parts": [{ "text": "echo: " }, { "text": input }] }
        }]
      });
      (StatusCode::OK, Json(reply))
    }

    let app = Router::new()
      .route("/v1beta/models/{model}", post(handler))
      .with_state((calls.clone(), failures, status));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{addr}"), calls)
  }

  fn config(base_url: String) -> GeminiConfig {
    GeminiConfig {
      base_url,
      retry: RetryPolicy {
        initial_delay: Duration::from_millis(1),
        ..RetryPolicy::default()
      },
      ..GeminiConfig::new("test-key")
    }
  }

  #[test]
  fn backoff_grows_and_is_capped() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay(0), Duration::from_secs(1));
    assert_eq!(policy.delay(1), Duration::from_secs(7));
    assert_eq!(policy.delay(2), Duration::from_secs(49));
    assert_eq!(policy.delay(3), Duration::from_secs(60));
  }

  #[test]
  fn empty_api_key_is_rejected() {
    assert!(GeminiGenerator::new(GeminiConfig::new("  ")).is_err());
  }

  #[tokio::test]
  async fn joins_all_text_parts() {
    let (url, calls) = fake_gemini(0, StatusCode::OK).await;
    let generator = GeminiGenerator::new(config(url)).unwrap();

    let text = generator.generate("be brief", "Acme").await.unwrap();
    assert_eq!(text, "echo: Acme");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn retries_transient_statuses() {
    let (url, calls) = fake_gemini(2, StatusCode::SERVICE_UNAVAILABLE).await;
    let generator = GeminiGenerator::new(config(url)).unwrap();

    let text = generator.generate("be brief", "Globex").await.unwrap();
    assert_eq!(text, "echo: Globex");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn does_not_retry_client_errors() {
    let (url, calls) = fake_gemini(1, StatusCode::BAD_REQUEST).await;
    let generator = GeminiGenerator::new(config(url)).unwrap();

    let err = generator.generate("be brief", "Acme").await.unwrap_err();
    assert!(matches!(err, EngineError::Generation(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
