//! Loading coach configuration (prompts, session policy, extra lessons/rubrics) from TOML.
//!
//! See `CoachConfig`, `Prompts` and `Policy` for the expected schema. Every
//! section is optional; missing pieces fall back to the built-in defaults.

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

use crate::domain::{Lesson, Rubric};

#[derive(Clone, Debug, Deserialize, Default)]
pub struct CoachConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub policy: Policy,
  #[serde(default)]
  pub lessons: Vec<Lesson>,
  #[serde(default)]
  pub rubrics: Vec<Rubric>,
}

/// Session escape caps and generator limits.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Policy {
  /// Guided turns after which the session moves on even without `[PHASE_TRANSITION: assessment]`.
  pub max_guided_attempts: u32,
  /// Instruction turns after which both instruction flags are forced.
  pub max_instruction_turns: u32,
  pub generator_timeout_secs: u64,
  pub generator_max_retries: u32,
  pub generator_base_delay_ms: u64,
  /// Capacity of the interaction-event channel.
  pub telemetry_buffer: usize,
}

impl Default for Policy {
  fn default() -> Self {
    Self {
      max_guided_attempts: 8,
      max_instruction_turns: 12,
      generator_timeout_secs: 30,
      generator_max_retries: 2,
      generator_base_delay_ms: 500,
      telemetry_buffer: 256,
    }
  }
}

impl Policy {
  pub fn generator_timeout(&self) -> Duration { Duration::from_secs(self.generator_timeout_secs) }
  pub fn generator_base_delay(&self) -> Duration { Duration::from_millis(self.generator_base_delay_ms) }
}

/// Prompt templates. Placeholders use `{name}` and are filled by `util::fill_template`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  // Persona per tier
  pub voice_tier1: String,
  pub voice_tier2: String,
  pub voice_tier3: String,
  // Marker grammar the coach must follow
  pub marker_rules: String,
  // Phase pedagogy
  pub instruction_phase: String,
  pub guided_phase: String,
  pub assessment_phase: String,
  pub feedback_phase: String,
  // Rubric scoring
  pub scoring_system: String,
  pub scoring_user_template: String,
  // Placement prompt generation
  pub placement_system: String,
  pub placement_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      voice_tier1: "You are Quill, a warm writing coach for children aged 7 to 8. Use very short sentences and simple words. Celebrate every effort. One idea per message. You may start lines with a friendly emoji.".into(),
      voice_tier2: "You are Quill, a friendly writing coach for children aged 9 to 10. Use clear sentences, concrete examples, and upbeat encouragement. Keep messages under 120 words.".into(),
      voice_tier3: "You are Quill, a writing coach for children aged 11 to 12. Be encouraging but direct, use correct writing vocabulary (thesis, transition, evidence), and keep messages under 150 words.".into(),
      marker_rules: "Control markers (the app reads these; the child never sees them except STEP):\n- [STEP: N] progress through instruction, N from 1 to 5. Put it at the start of the message.\n- [COMPREHENSION_CHECK: passed] or [COMPREHENSION_CHECK: failed] after the child answers your check question.\n- [HINT_GIVEN] whenever your message contains a hint.\n- [ANSWER_TYPE: choice|multiselect|poll|order|highlight] when the child should answer with a widget, followed by [OPTIONS: \"a\" | \"b\" | \"c\"] and, for highlight, [PASSAGE: \"text\"].\n- [PHASE_TRANSITION: guided|assessment] when the current phase is complete.\nWrite markers exactly like this, one per line or at the end of a line.".into(),
      instruction_phase: "PHASE 1: INSTRUCTION for the {lesson_type} lesson \"{lesson_title}\".\nTeach the learning objectives in 5 short steps, one step per message, and mark each with [STEP: N]. At step 4 ask one comprehension question and report it with [COMPREHENSION_CHECK: ...]. When the child has passed the check and step 5 is done, emit [PHASE_TRANSITION: guided].".into(),
      guided_phase: "PHASE 2: GUIDED PRACTICE for \"{lesson_title}\".\nGive short practice tasks that use the learning objectives, preferably as interactive questions with [ANSWER_TYPE] and [OPTIONS]. Give hints instead of answers and mark them with [HINT_GIVEN]. After about three successful attempts, emit [PHASE_TRANSITION: assessment].".into(),
      assessment_phase: "PHASE 3: ASSESSMENT for \"{lesson_title}\".\nGive the child one clear {lesson_type} writing prompt. Do not write any part of the piece for them and do not grade it; the app scores the submission. Answer questions about the task briefly.".into(),
      feedback_phase: "PHASE 4: FEEDBACK for \"{lesson_title}\".\nThe writing has been scored. Talk with the child about one strength and one thing to grow, using their own sentences as examples. Do not emit any markers.".into(),
      scoring_system: "You are a fair, encouraging elementary writing grader. Score strictly by the rubric. Respond ONLY with strict JSON.".into(),
      scoring_user_template: "Rubric: {rubric_description}\nExpected length: {word_min} to {word_max} words.\nCriteria (JSON): {criteria_json}\n\nStudent writing:\n\"\"\"\n{submission}\n\"\"\"\n\nReturn JSON: {\"scores\": {\"<criterion name>\": number}, \"overallScore\": number, \"feedback\": {\"strength\": string, \"growthArea\": string, \"encouragement\": string}}\nScore every criterion on its level scale (1 = first level). Feedback is for a child: kind, specific, one sentence each.".into(),
      placement_system: "You design short writing placement tasks for children aged 7 to 12. Respond ONLY with strict JSON.".into(),
      placement_user_template: "Create exactly 3 writing prompts for a placement check: one narrative, one descriptive, one persuasive, in that order. Each must be answerable in 5 to 10 minutes by a child aged 7 to 12.\nReturn a JSON array: [{\"type\": \"narrative\", \"prompt\": string}, {\"type\": \"descriptive\", \"prompt\": string}, {\"type\": \"persuasive\", \"prompt\": string}]".into(),
    }
  }
}

/// Attempt to load `CoachConfig` from COACH_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_coach_config_from_env() -> Option<CoachConfig> {
  let path = std::env::var("COACH_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_coach_config(&s) {
      Ok(cfg) => {
        info!(target: "writing_coach", %path, lessons = cfg.lessons.len(), rubrics = cfg.rubrics.len(), "Loaded coach config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "writing_coach", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "writing_coach", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

pub fn parse_coach_config(s: &str) -> Result<CoachConfig, toml::de::Error> {
  toml::from_str::<CoachConfig>(s)
}
