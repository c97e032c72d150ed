//! Public protocol structs for the HTTP endpoints (serde ready, camelCase).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};

use crate::domain::{AnswerMeta, Lesson, Phase, ScoreResult, Tier};
use crate::scoring::{PlacementPrompt, TierAssignment};
use crate::session::{Session, Transition};
use crate::validate::{ValidationErrorKind, ValidationResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthOut {
    pub ok: bool,
    pub generator: bool,
}

#[derive(Debug, Serialize)]
pub struct LessonsOut {
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartLessonIn {
    pub child_id: String,
    #[serde(default)]
    pub tier: Option<Tier>,
}

/// Stored session plus the fields a client renders first.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOut {
    #[serde(flatten)]
    pub session: Session,
    pub last_coach_message: Option<String>,
}

impl From<Session> for SessionOut {
    fn from(session: Session) -> Self {
        let last_coach_message = session.last_coach_message().map(|m| m.content.clone());
        Self { session, last_coach_message }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartLessonOut {
    pub resumed: bool,
    pub session: SessionOut,
}

#[derive(Debug, Deserialize)]
pub struct MessageIn {
    pub text: String,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOut {
    pub from: Phase,
    pub to: Phase,
    pub forced: bool,
}

impl From<Transition> for TransitionOut {
    fn from(t: Transition) -> Self {
        Self { from: t.from, to: t.to, forced: t.forced }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOut {
    pub reply: String,
    pub phase: Phase,
    pub answer: Option<AnswerMeta>,
    pub transition: Option<TransitionOut>,
    pub session: SessionOut,
}

#[derive(Debug, Deserialize)]
pub struct SubmitIn {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOut {
    pub validation: ValidationOut,
    pub score: Option<ScoreResult>,
    pub phase: Phase,
    pub transition: Option<TransitionOut>,
    pub session: SessionOut,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateIn {
    pub text: String,
    #[serde(default)]
    pub rubric_id: Option<String>,
}

/// `{valid:true, wordCount}` or `{valid:false, error, message, wordCount, minWords}`.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOut {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ValidationErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub word_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_words: Option<usize>,
}

impl From<&ValidationResult> for ValidationOut {
    fn from(v: &ValidationResult) -> Self {
        match v {
            ValidationResult::Valid { word_count } => Self {
                valid: true,
                error: None,
                message: None,
                word_count: *word_count,
                min_words: None,
            },
            ValidationResult::Invalid { error, message, word_count, min_words } => Self {
                valid: false,
                error: Some(*error),
                message: Some(message.clone()),
                word_count: *word_count,
                min_words: Some(*min_words),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementStartIn {
    pub child_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementStartOut {
    pub placement_id: String,
    pub prompts: Vec<PlacementPrompt>,
}

#[derive(Debug, Deserialize)]
pub struct PlacementSubmitIn {
    pub responses: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignTierIn {
    pub tier: Tier,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierOut {
    #[serde(flatten)]
    pub assignment: TierAssignment,
    pub effective_tier: Option<Tier>,
}

impl From<TierAssignment> for TierOut {
    fn from(assignment: TierAssignment) -> Self {
        let effective_tier = assignment.effective_tier();
        Self { assignment, effective_tier }
    }
}
