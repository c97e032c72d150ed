//! Telemetry: tracing initialization and best-effort interaction events.
//!
//! Behavior:
//! - LOG_LEVEL controls the filter (e.g. "debug" or detailed directives like
//!   "info,coach=debug,writing_coach=debug,tower_http=info,axum=info").
//! - LOG_FORMAT selects "pretty" (default) or "json" structured logs.
//! - Interaction events go through a bounded channel to a background task that
//!   logs them under the `interaction` target. A full or closed channel drops
//!   the event; the learner's request never waits on telemetry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::domain::Phase;
use crate::generator::Generation;
use crate::session::Transition;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| {
        EnvFilter::new("info,coach=debug,writing_coach=debug,tower_http=info,axum=info")
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => {
            builder.json().init();
        }
        _ => {
            builder.init();
        }
    }
}

/// One model interaction. Carries no learner text.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEvent {
    pub kind: &'static str,
    pub session_id: Option<String>,
    pub phase: Option<Phase>,
    pub prompt_hash: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub transition: Option<(Phase, Phase)>,
    pub at: DateTime<Utc>,
}

impl InteractionEvent {
    pub fn new(kind: &'static str, prompt_hash: String, generation: &Generation) -> Self {
        Self {
            kind,
            session_id: None,
            phase: None,
            prompt_hash,
            model: generation.model.clone(),
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
            latency_ms: generation.latency_ms,
            transition: None,
            at: Utc::now(),
        }
    }

    pub fn for_session(mut self, session_id: &str, phase: Phase) -> Self {
        self.session_id = Some(session_id.to_string());
        self.phase = Some(phase);
        self
    }

    pub fn with_transition(mut self, transition: Option<Transition>) -> Self {
        self.transition = transition.map(|t| (t.from, t.to));
        self
    }
}

#[derive(Clone)]
pub struct Telemetry {
    tx: mpsc::Sender<InteractionEvent>,
}

impl Telemetry {
    /// Sender plus the receiving end, for callers that drain events themselves.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<InteractionEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Sender whose events are logged by a background task. Needs a tokio runtime.
    pub fn spawn(buffer: usize) -> Self {
        let (telemetry, rx) = Self::channel(buffer);
        tokio::spawn(drain(rx));
        telemetry
    }

    pub fn emit(&self, event: InteractionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "full",
                mpsc::error::TrySendError::Closed(_) => "closed",
            };
            warn!(target: "interaction", reason, "Telemetry channel unavailable; event dropped");
        }
    }
}

async fn drain(mut rx: mpsc::Receiver<InteractionEvent>) {
    while let Some(ev) = rx.recv().await {
        info!(
            target: "interaction",
            kind = ev.kind,
            session_id = ev.session_id.as_deref().unwrap_or("-"),
            phase = ev.phase.map(Phase::as_str).unwrap_or("-"),
            prompt_hash = %ev.prompt_hash,
            model = %ev.model,
            input_tokens = ev.input_tokens,
            output_tokens = ev.output_tokens,
            latency_ms = ev.latency_ms,
            transition = ?ev.transition,
            "Model interaction"
        );
    }
}
