//! Service-level error and its HTTP mapping.
//!
//! Every failure a learner can hit is retryable or a plain "not found"; none
//! of them leave a session half-updated. Response bodies never include model
//! output or provider messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::generator::GeneratorError;
use crate::scoring::ScoringError;
use crate::session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum CoachError {
  #[error(transparent)]
  Generator(#[from] GeneratorError),
  #[error(transparent)]
  Scoring(#[from] ScoringError),
  #[error(transparent)]
  Session(#[from] SessionError),
  #[error("lesson {0} not found")]
  LessonNotFound(String),
  #[error("rubric {0} not found")]
  RubricNotFound(String),
  #[error("placement {0} not found")]
  PlacementNotFound(String),
  #[error("bad request: {0}")]
  BadRequest(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
  error: &'static str,
  message: String,
  retryable: bool,
}

impl CoachError {
  /// Whether the same request may succeed if simply sent again.
  pub fn is_retryable(&self) -> bool {
    match self {
      CoachError::Generator(e) => e.is_retryable() || matches!(e, GeneratorError::Refused(_)),
      CoachError::Scoring(_) => true,
      _ => false,
    }
  }

  pub fn status_code(&self) -> StatusCode {
    match self {
      CoachError::Generator(GeneratorError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
      CoachError::Generator(GeneratorError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
      CoachError::Generator(_) | CoachError::Scoring(_) => StatusCode::BAD_GATEWAY,
      CoachError::Session(SessionError::NotFound(_))
      | CoachError::LessonNotFound(_)
      | CoachError::RubricNotFound(_)
      | CoachError::PlacementNotFound(_) => StatusCode::NOT_FOUND,
      CoachError::Session(SessionError::InvalidTransition { .. }) => StatusCode::CONFLICT,
      CoachError::BadRequest(_) => StatusCode::BAD_REQUEST,
    }
  }

  fn code(&self) -> &'static str {
    match self {
      CoachError::Generator(_) => "coach_unavailable",
      CoachError::Scoring(_) => "scoring_failed",
      CoachError::Session(SessionError::NotFound(_)) => "session_not_found",
      CoachError::Session(SessionError::InvalidTransition { .. }) => "wrong_phase",
      CoachError::LessonNotFound(_) => "lesson_not_found",
      CoachError::RubricNotFound(_) => "rubric_not_found",
      CoachError::PlacementNotFound(_) => "placement_not_found",
      CoachError::BadRequest(_) => "bad_request",
    }
  }

  /// Text safe to show a child.
  fn learner_message(&self) -> String {
    match self {
      CoachError::Generator(_) | CoachError::Scoring(_) => {
        "Your coach needs a quick break. Your work is saved, so please try again in a moment.".into()
      }
      CoachError::Session(SessionError::InvalidTransition { .. }) => {
        "That step isn't open yet. Keep going with your coach first!".into()
      }
      other => other.to_string(),
    }
  }
}

impl IntoResponse for CoachError {
  fn into_response(self) -> Response {
    let status = self.status_code();
    if status.is_server_error() {
      warn!(target: "writing_coach", error = %self, %status, "Request failed");
    }
    let body = ErrorBody { error: self.code(), message: self.learner_message(), retryable: self.is_retryable() };
    (status, Json(body)).into_response()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::domain::Phase;

  #[test]
  fn status_codes() {
    assert_eq!(CoachError::from(GeneratorError::Unavailable("x".into())).status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(CoachError::from(GeneratorError::Timeout(Duration::from_secs(1))).status_code(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(CoachError::from(ScoringError::MissingCriterion("ideas".into())).status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(CoachError::from(SessionError::NotFound("s".into())).status_code(), StatusCode::NOT_FOUND);
    let wrong = SessionError::InvalidTransition { session_id: "s".into(), phase: Phase::Guided, action: "submit" };
    assert_eq!(CoachError::from(wrong).status_code(), StatusCode::CONFLICT);
    assert_eq!(CoachError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
  }

  #[test]
  fn retryability() {
    assert!(CoachError::from(ScoringError::PlacementPromptCount { expected: 3, got: 2 }).is_retryable());
    assert!(CoachError::from(GeneratorError::Http { status: 503, message: "busy".into() }).is_retryable());
    assert!(!CoachError::from(GeneratorError::Http { status: 401, message: "key".into() }).is_retryable());
    assert!(!CoachError::LessonNotFound("l".into()).is_retryable());
  }

  #[tokio::test]
  async fn body_hides_provider_details() {
    let err = CoachError::from(GeneratorError::Http { status: 500, message: "secret upstream trace".into() });
    let response = err.into_response();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let text = String::from_utf8_lossy(&bytes);
    assert!(!text.contains("secret"));
    assert!(text.contains("\"retryable\":true"));
  }
}
