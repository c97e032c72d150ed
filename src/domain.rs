//! Domain models: phases, phase state, conversation messages, lessons, rubrics,
//! and the interactive-answer metadata extracted from coach replies.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pedagogical stage of a lesson session. Ordering is the lesson order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
  Instruction,
  Guided,
  Assessment,
  Feedback,
}

impl Phase {
  /// The phase that directly follows this one, if any.
  pub fn next(self) -> Option<Phase> {
    match self {
      Phase::Instruction => Some(Phase::Guided),
      Phase::Guided => Some(Phase::Assessment),
      Phase::Assessment => Some(Phase::Feedback),
      Phase::Feedback => None,
    }
  }

  pub fn is_terminal(self) -> bool { self == Phase::Feedback }

  pub fn as_str(self) -> &'static str {
    match self {
      Phase::Instruction => "instruction",
      Phase::Guided => "guided",
      Phase::Assessment => "assessment",
      Phase::Feedback => "feedback",
    }
  }

  /// Lenient parse used for marker payloads ("guided", "Guided Practice", "phase 2"...).
  pub fn parse_loose(s: &str) -> Option<Phase> {
    let s = s.trim().to_ascii_lowercase();
    if s.starts_with("instruction") || s == "phase 1" || s == "1" {
      Some(Phase::Instruction)
    } else if s.starts_with("guided") || s.starts_with("practice") || s == "phase 2" || s == "2" {
      Some(Phase::Guided)
    } else if s.starts_with("assessment") || s.starts_with("writing") || s == "phase 3" || s == "3" {
      Some(Phase::Assessment)
    } else if s.starts_with("feedback") || s == "phase 4" || s == "4" {
      Some(Phase::Feedback)
    } else {
      None
    }
  }
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Difficulty/age band, 1 (youngest) to 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Tier(u8);

impl Tier {
  pub const MIN: u8 = 1;
  pub const MAX: u8 = 3;

  pub fn get(self) -> u8 { self.0 }
}

impl Default for Tier {
  fn default() -> Self { Tier(1) }
}

impl TryFrom<u8> for Tier {
  type Error = String;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    if (Self::MIN..=Self::MAX).contains(&value) {
      Ok(Tier(value))
    } else {
      Err(format!("tier must be between {} and {}, got {}", Self::MIN, Self::MAX, value))
    }
  }
}

impl From<Tier> for u8 {
  fn from(t: Tier) -> u8 { t.0 }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Mutable per-session record. Counters only move forward within a session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseState {
  pub instruction_completed: bool,
  pub comprehension_check_passed: bool,
  /// 1..=5 once the coach has reported a step; `None` before the first `[STEP]`.
  #[serde(default)] pub phase1_step: Option<u8>,
  #[serde(default)] pub instruction_turns: u32,
  pub guided_attempts: u32,
  pub hints_given: u32,
  pub guided_complete: bool,
  #[serde(default)] pub writing_started_at: Option<DateTime<Utc>>,
  pub revisions_used: u32,
  #[serde(default)] pub last_submitted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  Coach,
  Student,
}

/// One immutable entry of the conversation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
  pub id: String,
  pub role: Role,
  pub content: String,
  pub timestamp: DateTime<Utc>,
}

impl Message {
  pub fn new(role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
    Self { id: Uuid::new_v4().to_string(), role, content: content.into(), timestamp }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonType {
  Narrative,
  Persuasive,
  Expository,
  Descriptive,
}

impl LessonType {
  pub fn as_str(self) -> &'static str {
    match self {
      LessonType::Narrative => "narrative",
      LessonType::Persuasive => "persuasive",
      LessonType::Expository => "expository",
      LessonType::Descriptive => "descriptive",
    }
  }
}

/// Reference lesson data. Immutable once the catalog is loaded.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
  pub id: String,
  pub title: String,
  pub unit: String,
  #[serde(rename = "type")]
  pub lesson_type: LessonType,
  pub tier: Tier,
  #[serde(default)] pub learning_objectives: Vec<String>,
  #[serde(default)] pub rubric_id: Option<String>,
}

/// One weighted scoring criterion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Criterion {
  pub name: String,
  pub display_name: String,
  pub weight: f64,
  /// Level descriptors, lowest first. Scores range over `1..=levels.len()`.
  #[serde(default)] pub levels: Vec<String>,
  #[serde(default)] pub feedback_stems: Vec<String>,
}

impl Criterion {
  pub const MIN_LEVEL: f64 = 1.0;
  pub const DEFAULT_MAX_LEVEL: f64 = 4.0;

  pub fn max_level(&self) -> f64 {
    if self.levels.is_empty() { Self::DEFAULT_MAX_LEVEL } else { self.levels.len() as f64 }
  }
}

/// Weighted rubric. `word_range[0]` drives the minimum submission length.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rubric {
  pub id: String,
  pub description: String,
  pub word_range: [u32; 2],
  pub criteria: Vec<Criterion>,
}

impl Rubric {
  /// Highest overall score this rubric can produce.
  pub fn max_level(&self) -> f64 {
    self.criteria.iter().map(Criterion::max_level).fold(0.0, f64::max)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
  Choice,
  Multiselect,
  Poll,
  Order,
  Highlight,
}

impl AnswerType {
  pub fn parse(s: &str) -> Option<AnswerType> {
    match s.trim().to_ascii_lowercase().as_str() {
      "choice" => Some(AnswerType::Choice),
      "multiselect" => Some(AnswerType::Multiselect),
      "poll" => Some(AnswerType::Poll),
      "order" => Some(AnswerType::Order),
      "highlight" => Some(AnswerType::Highlight),
      _ => None,
    }
  }
}

/// Interactive-answer widget requested by the coach.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMeta {
  pub answer_type: AnswerType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub options: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub passage: Option<String>,
}

/// Qualitative feedback attached to a scored submission.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
  pub strength: String,
  pub growth_area: String,
  pub encouragement: String,
}

/// Normalized scoring outcome for one submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
  pub scores: std::collections::BTreeMap<String, f64>,
  pub overall_score: f64,
  pub feedback: Feedback,
}
