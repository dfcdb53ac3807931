//! Router tests: the real axum stack over an in-memory store, the real
//! pipeline engine with a scripted generator, and statically keyed tokens.

use std::{sync::Arc, time::Duration};

use axum::{
  Router,
  body::Body,
  http::{HeaderMap, Method, Request, StatusCode, header},
};
use brandspark_core::{engine::EngineError, gateway::Gateway};
use brandspark_engine::{PipelineEngine, StageGraph, TextGenerator};
use brandspark_jobs::{JobOrchestrator, OrchestratorConfig};
use brandspark_store_sqlite::SqliteGateway;
use serde_json::{Value, json};
use tower::ServiceExt as _;
use uuid::Uuid;

use crate::{AppState, auth::tests::{static_verifier, token_for}, router};

/// Echoes each rendered instruction, or answers with nothing at all.
struct Scripted {
  blank: bool,
}

impl TextGenerator for Scripted {
  async fn generate<'a>(
    &'a self,
    instruction: &'a str,
    _input: &'a str,
  ) -> Result<String, EngineError> {
    if self.blank {
      Ok(String::new())
    } else {
      Ok(format!("[{instruction}]"))
    }
  }
}

struct Harness {
  app:     Router,
  gateway: Arc<SqliteGateway>,
}

async fn harness_with(blank: bool) -> Harness {
  let gateway = Arc::new(SqliteGateway::open_in_memory().await.unwrap());
  let engine = Arc::new(PipelineEngine::new(
    Scripted { blank },
    StageGraph::analysis().unwrap(),
  ));
  let jobs = JobOrchestrator::new(gateway.clone(), Some(engine), OrchestratorConfig::default());
  let state = AppState {
    gateway:  gateway.clone(),
    jobs,
    verifier: Arc::new(static_verifier()),
  };
  Harness { app: router(state), gateway }
}

async fn harness() -> Harness { harness_with(false).await }

impl Harness {
  async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let resp = self.app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
      Value::Null
    } else {
      serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
  }

  async fn get(&self, uri: &str, user: Uuid) -> (StatusCode, Value) {
    let req = Request::builder()
      .uri(uri)
      .header(header::AUTHORIZATION, format!("Bearer {}", token_for(user)))
      .body(Body::empty())
      .unwrap();
    let (status, _, body) = self.send(req).await;
    (status, body)
  }

  async fn post_raw(&self, uri: &str, user: Uuid, raw: String) -> (StatusCode, Value) {
    let req = Request::builder()
      .method(Method::POST)
      .uri(uri)
      .header(header::AUTHORIZATION, format!("Bearer {}", token_for(user)))
      .header(header::CONTENT_TYPE, "application/json")
      .body(Body::from(raw))
      .unwrap();
    let (status, _, body) = self.send(req).await;
    (status, body)
  }

  async fn create_job(&self, user: Uuid, prompt: &str, session_id: Uuid) -> (StatusCode, Value) {
    let body = json!({ "prompt": prompt, "session_id": session_id });
    self.post_raw("/api/v1/jobs", user, body.to_string()).await
  }

  /// Poll until the job leaves `pending`/`processing`.
  async fn wait_for_job(&self, job_id: &str, user: Uuid) -> Value {
    for _ in 0..200 {
      let (status, body) = self.get(&format!("/api/v1/jobs/{job_id}"), user).await;
      assert_eq!(status, StatusCode::OK);
      if body["status"] == "completed" || body["status"] == "failed" {
        return body;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never finished");
  }
}

// ─── Health & auth ───────────────────────────────────────────────────────────

#[tokio::test]
async fn health_follows_the_store() {
  let h = harness().await;
  let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
  let (status, _, body) = h.send(req).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body, json!({ "status": "ok" }));

  h.gateway.close().await;
  let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
  let (status, _, _) = h.send(req).await;
  assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn routes_require_a_bearer_token() {
  let h = harness().await;
  for auth in [None, Some("Basic dXNlcjpwYXNz"), Some("Bearer not.a.jwt")] {
    let mut req = Request::builder().uri("/api/v1/sessions");
    if let Some(auth) = auth {
      req = req.header(header::AUTHORIZATION, auth);
    }
    let (status, headers, body) = h.send(req.body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED, "{auth:?}");
    assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer");
    assert!(body["error"].is_string());
  }
}

// ─── Jobs ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn job_runs_to_completion_with_a_sectioned_report() {
  let h = harness().await;
  let (user, session) = (Uuid::new_v4(), Uuid::new_v4());

  let (status, body) = h.create_job(user, "Analyze Acme Corp vs Globex", session).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["status"], "pending");
  let job_id = body["job_id"].as_str().unwrap().to_owned();

  let done = h.wait_for_job(&job_id, user).await;
  assert_eq!(done["status"], "completed");
  let report = done["report"].as_str().unwrap();
  for heading in ["## Research Findings", "## SWOT Analysis", "## Recommendations"] {
    assert!(report.contains(heading), "missing {heading}");
  }

  let (status, messages) = h.get(&format!("/api/v1/sessions/{session}/messages"), user).await;
  assert_eq!(status, StatusCode::OK);
  let roles: Vec<&str> = messages
    .as_array()
    .unwrap()
    .iter()
    .map(|m| m["role"].as_str().unwrap())
    .collect();
  assert_eq!(roles, ["user", "agent"]);
  assert_eq!(messages[0]["content"], "Analyze Acme Corp vs Globex");
  assert_eq!(messages[1]["content"], report);

  let (_, sessions) = h.get("/api/v1/sessions", user).await;
  assert_eq!(sessions[0]["id"], session.to_string());
  assert_eq!(sessions[0]["title"], "Analyze Acme Corp vs Globex");
}

#[tokio::test]
async fn blank_engine_output_fails_the_job() {
  let h = harness_with(true).await;
  let (user, session) = (Uuid::new_v4(), Uuid::new_v4());

  let (_, body) = h.create_job(user, "Analyze Acme", session).await;
  let done = h.wait_for_job(body["job_id"].as_str().unwrap(), user).await;
  assert_eq!(done["status"], "failed");
  assert!(done["report"].is_null());

  let (_, messages) = h.get(&format!("/api/v1/sessions/{session}/messages"), user).await;
  assert_eq!(messages.as_array().unwrap().len(), 1);
  assert_eq!(messages[0]["role"], "user");
}

#[tokio::test]
async fn prompt_length_boundary() {
  let h = harness().await;
  let user = Uuid::new_v4();

  let (status, body) = h.create_job(user, "x", Uuid::new_v4()).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert!(body["error"].as_str().unwrap().contains("at least 2"));

  let (status, body) = h.create_job(user, "xy", Uuid::new_v4()).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn malformed_input_is_a_bad_request() {
  let h = harness().await;
  let user = Uuid::new_v4();

  let bad_session = json!({ "prompt": "Analyze Acme", "session_id": "S1" }).to_string();
  let (status, _) = h.post_raw("/api/v1/jobs", user, bad_session).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);

  let (status, _) = h.post_raw("/api/v1/jobs", user, "{not json".into()).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);

  let missing = json!({ "prompt": "Analyze Acme" }).to_string();
  let (status, _) = h.post_raw("/api/v1/jobs", user, missing).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);

  let (status, _) = h.get("/api/v1/jobs/not-a-uuid", user).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reusing_a_foreign_session_is_forbidden_and_changes_nothing() {
  let h = harness().await;
  let (alice, bob, session) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

  let (status, _) = h.create_job(alice, "Analyze Acme", session).await;
  assert_eq!(status, StatusCode::OK);

  let (status, body) = h.create_job(bob, "Analyze Globex instead", session).await;
  assert_eq!(status, StatusCode::FORBIDDEN);
  assert!(body["error"].is_string());

  let (_, bobs) = h.get("/api/v1/sessions", bob).await;
  assert_eq!(bobs, json!([]));
  let (_, alices) = h.get("/api/v1/sessions", alice).await;
  assert_eq!(alices[0]["title"], "Analyze Acme");
  assert_eq!(h.gateway.session_owner(session).await.unwrap(), Some(alice));
  assert!(
    h.gateway
      .list_messages(session)
      .await
      .unwrap()
      .iter()
      .all(|m| m.user_id == alice)
  );
}

#[tokio::test]
async fn other_users_jobs_are_not_found() {
  let h = harness().await;
  let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

  let (_, body) = h.create_job(alice, "Analyze Acme", Uuid::new_v4()).await;
  let job_id = body["job_id"].as_str().unwrap();

  let (status, body) = h.get(&format!("/api/v1/jobs/{job_id}"), bob).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert!(body.get("status").is_none());
  assert!(body.get("report").is_none());

  let (status, _) = h.get(&format!("/api/v1/jobs/{}", Uuid::new_v4()), alice).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn new_user_has_no_sessions() {
  let h = harness().await;
  let (status, body) = h.get("/api/v1/sessions", Uuid::new_v4()).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body, json!([]));
}

#[tokio::test]
async fn messages_require_session_ownership() {
  let h = harness().await;
  let (alice, bob, session) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
  h.create_job(alice, "Analyze Acme", session).await;

  let (status, _) = h.get(&format!("/api/v1/sessions/{session}/messages"), bob).await;
  assert_eq!(status, StatusCode::FORBIDDEN);

  let unknown = Uuid::new_v4();
  let (status, _) = h.get(&format!("/api/v1/sessions/{unknown}/messages"), alice).await;
  assert_eq!(status, StatusCode::FORBIDDEN);
}

// ─── Availability ────────────────────────────────────────────────────────────

#[tokio::test]
async fn closed_store_is_service_unavailable() {
  let h = harness().await;
  h.gateway.close().await;

  let (status, body) = h.create_job(Uuid::new_v4(), "Analyze Acme", Uuid::new_v4()).await;
  assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
  assert!(body["error"].is_string());

  let (status, _) = h.get("/api/v1/sessions", Uuid::new_v4()).await;
  assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
