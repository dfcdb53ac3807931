//! brandspark server binary.
//!
//! Reads `brandspark.toml` (or the path given with `--config`) and the
//! process environment, opens the SQLite store, fails any jobs a previous
//! run left unfinished, and serves the JSON API over HTTP until interrupted.

mod settings;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use brandspark_api::{AppState, JwksVerifier};
use brandspark_core::gateway::Gateway;
use brandspark_engine::{GeminiConfig, GeminiGenerator, PipelineEngine, RetryPolicy, StageGraph};
use brandspark_jobs::{JobOrchestrator, OrchestratorConfig};
use brandspark_store_sqlite::SqliteGateway;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use settings::ServerConfig;

#[derive(Parser)]
#[command(author, version, about = "brandspark analysis job server")]
struct Cli {
  /// Path to the TOML configuration file. Missing files are ignored.
  #[arg(short, long, default_value = "brandspark.toml")]
  config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let cfg = match ServerConfig::load(&cli.config) {
    Ok(cfg) => cfg,
    Err(e) => {
      tracing::error!(error = %e, "refusing to start");
      return Err(e).context("invalid configuration");
    }
  };

  // Store.
  let gateway = SqliteGateway::open(&cfg.database_url, cfg.database_pool_size)
    .await
    .with_context(|| format!("failed to open database {:?}", cfg.database_url))?;
  let gateway = Arc::new(gateway);

  let recovered = gateway
    .recover_interrupted_jobs()
    .await
    .context("failed to recover interrupted jobs")?;
  if !recovered.is_empty() {
    tracing::warn!(count = recovered.len(), "marked interrupted jobs as failed");
  }

  // Credentials.
  let verifier = JwksVerifier::remote(
    cfg.jwks_url.clone(),
    cfg.jwt_audience.clone(),
    cfg.jwt_issuer.clone(),
    cfg.jwks_cache_ttl(),
  )
  .context("failed to build credential verifier")?;

  // Engine.
  let generator = GeminiGenerator::new(GeminiConfig {
    api_key:  cfg.google_api_key.clone(),
    model:    cfg.gemini_model.clone(),
    base_url: cfg.gemini_base_url.clone(),
    retry:    RetryPolicy::default(),
  })
  .context("failed to build Gemini client")?;
  let graph = if cfg.enable_simulation {
    StageGraph::analysis_with_simulation()
  } else {
    StageGraph::analysis()
  }
  .context("invalid stage graph")?;
  let engine = Arc::new(PipelineEngine::new(generator, graph));

  let jobs = JobOrchestrator::new(
    gateway.clone(),
    Some(engine),
    OrchestratorConfig {
      max_concurrent_jobs: cfg.max_concurrent_jobs,
      job_timeout:         cfg.job_timeout(),
    },
  );

  let state = AppState {
    gateway:  gateway.clone(),
    jobs:     jobs.clone(),
    verifier: Arc::new(verifier),
  };
  let app = brandspark_api::router(state);

  let address = cfg.address();
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;
  tracing::info!(
    %address,
    model = %cfg.gemini_model,
    simulation = cfg.enable_simulation,
    "listening"
  );

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

  tracing::info!(in_flight = jobs.in_flight(), "shutting down");
  jobs.shutdown(cfg.shutdown_grace()).await;
  gateway.close().await;
  Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::warn!(error = %e, "failed to listen for Ctrl-C");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        tracing::warn!(error = %e, "failed to listen for SIGTERM");
        std::future::pending::<()>().await;
      }
    }
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    () = ctrl_c => {}
    () = terminate => {}
  }
  tracing::info!("shutdown signal received");
}
