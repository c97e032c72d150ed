//! Text-generator capability: `(system prompt, conversation) -> text`.
//!
//! `OpenAI` is a minimal chat.completions client. Calls are instrumented and
//! log model names, latencies and token counts (not contents).
//! `RetryingGenerator` bounds every attempt with a timeout and retries
//! transient failures with jittered exponential backoff.
//!
//! NOTE: We never log the API key and we keep payload previews short to avoid PII leaks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::domain::{Message, Role};

/// Which job the call serves; picks the model and sampling temperature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purpose {
  /// Conversational coaching turn (free text with markers).
  Coach,
  /// Rubric scoring or placement prompts (JSON expected).
  Grading,
}

/// One successful generation.
#[derive(Clone, Debug, PartialEq)]
pub struct Generation {
  pub text: String,
  pub model: String,
  pub input_tokens: u32,
  pub output_tokens: u32,
  pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeneratorError {
  #[error("generator timed out after {0:?}")]
  Timeout(Duration),
  #[error("transport error: {0}")]
  Transport(String),
  #[error("generator HTTP {status}: {message}")]
  Http { status: u16, message: String },
  #[error("generator returned an empty response")]
  EmptyResponse,
  #[error("generator refused: {0}")]
  Refused(String),
  #[error("generator unavailable: {0}")]
  Unavailable(String),
}

impl GeneratorError {
  pub fn is_retryable(&self) -> bool {
    match self {
      GeneratorError::Timeout(_) | GeneratorError::Transport(_) | GeneratorError::EmptyResponse => true,
      GeneratorError::Http { status, .. } => *status == 429 || *status >= 500,
      GeneratorError::Refused(_) | GeneratorError::Unavailable(_) => false,
    }
  }
}

#[async_trait]
pub trait Generator: Send + Sync {
  fn name(&self) -> &str;

  async fn generate(
    &self,
    purpose: Purpose,
    system_prompt: &str,
    context: &[Message],
  ) -> Result<Generation, GeneratorError>;
}

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub coach_model: String,
  pub grader_model: String,
  pub timeout: Duration,
}

impl OpenAI {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env(timeout: Duration) -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let coach_model =
      std::env::var("OPENAI_COACH_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let grader_model =
      std::env::var("OPENAI_GRADER_MODEL").unwrap_or_else(|_| "gpt-4o".into());

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .ok()?;

    Some(Self { client, api_key, base_url, coach_model, grader_model, timeout })
  }

  fn model_for(&self, purpose: Purpose) -> &str {
    match purpose {
      Purpose::Coach => &self.coach_model,
      Purpose::Grading => &self.grader_model,
    }
  }

  fn map_transport(&self, e: reqwest::Error) -> GeneratorError {
    if e.is_timeout() { GeneratorError::Timeout(self.timeout) } else { GeneratorError::Transport(e.to_string()) }
  }
}

#[async_trait]
impl Generator for OpenAI {
  fn name(&self) -> &str { "openai" }

  #[instrument(level = "info", skip(self, system_prompt, context), fields(?purpose, ctx_len = context.len()))]
  async fn generate(
    &self,
    purpose: Purpose,
    system_prompt: &str,
    context: &[Message],
  ) -> Result<Generation, GeneratorError> {
    let model = self.model_for(purpose).to_string();
    let url = format!("{}/chat/completions", self.base_url);

    let mut messages = Vec::with_capacity(context.len() + 1);
    messages.push(ChatMessageReq { role: "system".into(), content: system_prompt.into() });
    for m in context {
      let role = match m.role {
        Role::Coach => "assistant",
        Role::Student => "user",
      };
      messages.push(ChatMessageReq { role: role.into(), content: m.content.clone() });
    }

    // grading replies may be bare JSON arrays, so no json_object response format here
    let temperature = match purpose {
      Purpose::Coach => 0.7,
      Purpose::Grading => 0.2,
    };
    let req = ChatCompletionRequest { model: model.clone(), messages, temperature, max_tokens: None };

    let start = Instant::now();
    let res = self.client.post(&url)
      .header(USER_AGENT, "writing-coach/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req).send().await.map_err(|e| self.map_transport(e))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let message = extract_openai_error(&body).unwrap_or(body);
      error!(%model, status = status.as_u16(), "OpenAI call failed");
      return Err(GeneratorError::Http { status: status.as_u16(), message });
    }

    let body: ChatCompletionResponse = res.json().await.map_err(|e| self.map_transport(e))?;
    let latency_ms = start.elapsed().as_millis() as u64;

    let usage = body.usage.unwrap_or_default();
    info!(
      %model,
      latency_ms,
      prompt_tokens = ?usage.prompt_tokens,
      completion_tokens = ?usage.completion_tokens,
      "OpenAI usage"
    );

    let choice = body.choices.into_iter().next().ok_or(GeneratorError::EmptyResponse)?;
    if let Some(refusal) = choice.message.refusal.filter(|r| !r.trim().is_empty()) {
      return Err(GeneratorError::Refused(refusal));
    }
    if choice.finish_reason.as_deref() == Some("content_filter") {
      return Err(GeneratorError::Refused("content filter".into()));
    }
    let text = choice.message.content.unwrap_or_default().trim().to_string();
    if text.is_empty() {
      return Err(GeneratorError::EmptyResponse);
    }

    Ok(Generation {
      text,
      model,
      input_tokens: usage.prompt_tokens.unwrap_or(0),
      output_tokens: usage.completion_tokens.unwrap_or(0),
      latency_ms,
    })
  }
}

/// Retry and timeout policy around any generator.
#[derive(Clone, Debug)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub attempt_timeout: Duration,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 2,
      attempt_timeout: Duration::from_secs(30),
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(8),
    }
  }
}

pub struct RetryingGenerator {
  inner: Arc<dyn Generator>,
  config: RetryConfig,
}

impl RetryingGenerator {
  pub fn new(inner: Arc<dyn Generator>, config: RetryConfig) -> Self {
    Self { inner, config }
  }

  fn backoff(&self, attempt: u32) -> Duration {
    let exp = self.config.base_delay.saturating_mul(2u32.saturating_pow(attempt));
    let capped = exp.min(self.config.max_delay);
    // up to 25% jitter
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
    capped + Duration::from_millis(jitter_ms)
  }
}

#[async_trait]
impl Generator for RetryingGenerator {
  fn name(&self) -> &str { self.inner.name() }

  async fn generate(
    &self,
    purpose: Purpose,
    system_prompt: &str,
    context: &[Message],
  ) -> Result<Generation, GeneratorError> {
    let mut attempt = 0u32;
    loop {
      let call = self.inner.generate(purpose, system_prompt, context);
      let result = match tokio::time::timeout(self.config.attempt_timeout, call).await {
        Ok(r) => r,
        Err(_) => Err(GeneratorError::Timeout(self.config.attempt_timeout)),
      };

      match result {
        Ok(generation) => return Ok(generation),
        Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
          let delay = self.backoff(attempt);
          warn!(generator = self.inner.name(), attempt, ?delay, error = %e, "Retrying generator call");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice {
  message: ChatMessageResp,
  #[serde(default)] finish_reason: Option<String>,
}
#[derive(Deserialize)]
struct ChatMessageResp {
  content: Option<String>,
  #[serde(default)] refusal: Option<String>,
}
#[derive(Deserialize, Default)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}

/// Scripted generator for deterministic tests without API calls.
#[cfg(test)]
pub mod mock {
  use std::collections::VecDeque;
  use std::sync::Mutex;

  use super::*;

  pub enum MockReply {
    Text(String),
    Error(GeneratorError),
    /// Wait, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
  }

  impl MockReply {
    pub fn text(s: &str) -> Self { MockReply::Text(s.to_string()) }
  }

  /// Records every call and answers from a queue, in order.
  #[derive(Default)]
  pub struct MockGenerator {
    replies: Mutex<VecDeque<MockReply>>,
    pub calls: Mutex<Vec<(Purpose, String, usize)>>,
  }

  impl MockGenerator {
    pub fn new(replies: Vec<MockReply>) -> Self {
      Self { replies: Mutex::new(replies.into()), calls: Mutex::new(Vec::new()) }
    }

    pub fn call_count(&self) -> usize { self.calls.lock().map(|c| c.len()).unwrap_or(0) }

    pub fn system_prompts(&self) -> Vec<String> {
      self.calls.lock().map(|c| c.iter().map(|(_, s, _)| s.clone()).collect()).unwrap_or_default()
    }
  }

  #[async_trait]
  impl Generator for MockGenerator {
    fn name(&self) -> &str { "mock" }

    async fn generate(
      &self,
      purpose: Purpose,
      system_prompt: &str,
      context: &[Message],
    ) -> Result<Generation, GeneratorError> {
      self.calls.lock().unwrap().push((purpose, system_prompt.to_string(), context.len()));
      let mut next = self.replies.lock().unwrap().pop_front();
      loop {
        match next {
          Some(MockReply::Text(text)) => {
            return Ok(Generation {
              text,
              model: "mock-model".into(),
              input_tokens: 10,
              output_tokens: 20,
              latency_ms: 1,
            })
          }
          Some(MockReply::Error(e)) => return Err(e),
          Some(MockReply::Delay(d, inner)) => {
            tokio::time::sleep(d).await;
            next = Some(*inner);
          }
          None => return Err(GeneratorError::Unavailable("mock exhausted".into())),
        }
      }
    }
  }
}
