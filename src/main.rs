//! Writing Coach · tutoring session backend
//!
//! - Axum HTTP API for lessons, coaching turns, writing submissions and placement
//! - Optional OpenAI integration (via environment variables)
//!
//! Important env variables:
//!   PORT                 : u16 (default 3000)
//!   OPENAI_API_KEY       : enables the coach/grader model if present
//!   OPENAI_BASE_URL      : default "https://api.openai.com/v1"
//!   OPENAI_COACH_MODEL   : default "gpt-4o-mini"
//!   OPENAI_GRADER_MODEL  : default "gpt-4o"
//!   COACH_CONFIG_PATH    : path to TOML config (prompts, policy, lessons, rubrics)
//!   LOG_LEVEL            : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT           : "pretty" (default) or "json"

mod catalog;
mod config;
mod domain;
mod error;
mod generator;
mod logic;
mod markers;
mod prompt;
mod protocol;
mod routes;
mod scoring;
mod session;
mod state;
mod store;
mod telemetry;
mod util;
mod validate;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Shared state: catalog, session store, generator, telemetry sender.
  let state = Arc::new(AppState::new());

  let app = build_router(state.clone());

  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "writing_coach", %addr, "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  info!(target: "writing_coach", "Server stopped");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "writing_coach", error = %e, "Failed to listen for shutdown signal");
    std::future::pending::<()>().await;
  }
  info!(target: "writing_coach", "Shutdown signal received");
}
