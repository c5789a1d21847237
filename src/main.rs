//! Gestalt · Question Generation Backend
//!
//! - Axum HTTP API under /api/v1
//! - Question generation through an OpenAI-compatible API (optional)
//! - SQLite storage of modules, question folders and files; ZIP downloads
//! - Static SPA fallback (./static/index.html)
//!
//! Important env variables:
//!   PORT                   : u16 (default 8000)
//!   OPENAI_API_KEY         : enables generation if present
//!   OPENAI_BASE_URL        : default "https://api.openai.com/v1"
//!   OPENAI_FAST_MODEL      : default "gpt-4o-mini"
//!   OPENAI_STRONG_MODEL    : default "gpt-4o"
//!   OPENAI_VISION_MODEL    : default "gpt-4o-2024-08-06"
//!   OPENAI_EMBEDDING_MODEL : default "text-embedding-3-large"
//!   GESTALT_CONFIG_PATH    : path to TOML config (settings, prompts, tag rules)
//!   DATABASE_PATH          : overrides settings.database_path
//!   LOG_LEVEL              : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT             : "pretty" (default) or "json"

mod archive;
mod config;
mod domain;
mod error;
mod html;
mod images;
mod llm;
mod openai;
mod pipeline;
mod protocol;
mod quiz;
mod retrieval;
mod routes;
mod runner;
mod state;
mod store;
mod telemetry;
mod util;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

async fn shutdown_signal() {
  if tokio::signal::ctrl_c().await.is_ok() {
    info!(target: "gestalt_backend", "Shutdown signal received");
  }
}

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Shared state (database, example bank, optional OpenAI client, prompts).
  let state = Arc::new(AppState::new()?);

  // Example embeddings are computed in the background; search is lexical until then.
  state.spawn_example_indexing();

  let app = build_router(state.clone());

  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "gestalt_backend", %addr, llm = state.llm_enabled(), "HTTP server listening");
  axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
  Ok(())
}
