//! System-prompt assembly for the coach model.
//!
//! `build_prompt` is a pure function of its inputs: identical context in,
//! identical prompt out. Resumed sessions rely on this, and so does the
//! prompt hash attached to interaction events.

use sha2::{Digest, Sha256};

use crate::config::Prompts;
use crate::domain::{Lesson, LessonType, Phase, PhaseState, Tier};
use crate::util::fill_template;

/// Everything the prompt depends on. All of it is recoverable from a stored
/// session plus the reference catalog.
#[derive(Clone, Debug)]
pub struct PromptContext<'a> {
  pub phase: Phase,
  pub tier: Tier,
  pub lesson_title: &'a str,
  pub lesson_type: LessonType,
  pub learning_objectives: &'a [String],
  pub phase_state: Option<&'a PhaseState>,
  /// Minimum words of the assessment piece, when a rubric is attached.
  pub min_words: Option<usize>,
}

impl<'a> PromptContext<'a> {
  pub fn for_lesson(lesson: &'a Lesson, phase: Phase, tier: Tier) -> Self {
    Self {
      phase,
      tier,
      lesson_title: &lesson.title,
      lesson_type: lesson.lesson_type,
      learning_objectives: &lesson.learning_objectives,
      phase_state: None,
      min_words: None,
    }
  }

  pub fn with_phase_state(mut self, state: &'a PhaseState) -> Self {
    self.phase_state = Some(state);
    self
  }

  pub fn with_min_words(mut self, min_words: usize) -> Self {
    self.min_words = Some(min_words);
    self
  }
}

fn voice<'p>(prompts: &'p Prompts, tier: Tier) -> &'p str {
  match tier.get() {
    1 => &prompts.voice_tier1,
    2 => &prompts.voice_tier2,
    _ => &prompts.voice_tier3,
  }
}

fn phase_template<'p>(prompts: &'p Prompts, phase: Phase) -> &'p str {
  match phase {
    Phase::Instruction => &prompts.instruction_phase,
    Phase::Guided => &prompts.guided_phase,
    Phase::Assessment => &prompts.assessment_phase,
    Phase::Feedback => &prompts.feedback_phase,
  }
}

pub fn build_prompt(prompts: &Prompts, ctx: &PromptContext<'_>) -> String {
  let mut sections: Vec<String> = Vec::with_capacity(5);

  sections.push(voice(prompts, ctx.tier).to_string());

  let mut lesson = format!(
    "Lesson: {} ({} writing, tier {})\nLearning objectives:",
    ctx.lesson_title,
    ctx.lesson_type.as_str(),
    ctx.tier
  );
  if ctx.learning_objectives.is_empty() {
    lesson.push_str("\n- (none listed)");
  }
  for objective in ctx.learning_objectives {
    lesson.push_str("\n- ");
    lesson.push_str(objective);
  }
  sections.push(lesson);

  sections.push(fill_template(
    phase_template(prompts, ctx.phase),
    &[("lesson_title", ctx.lesson_title), ("lesson_type", ctx.lesson_type.as_str())],
  ));

  let progress = progress_lines(ctx);
  if !progress.is_empty() {
    sections.push(progress.join("\n"));
  }

  if ctx.phase != Phase::Feedback {
    sections.push(prompts.marker_rules.clone());
  }

  sections.join("\n\n")
}

/// Phase-local progress. Nothing is reported without a phase state, so "no
/// info" never reads as "step 1".
fn progress_lines(ctx: &PromptContext<'_>) -> Vec<String> {
  let mut lines = Vec::new();
  match (ctx.phase, ctx.phase_state) {
    (Phase::Instruction, Some(state)) => {
      lines.push(format!("Phase 1 current step: {}", state.phase1_step.unwrap_or(1)));
      if state.comprehension_check_passed {
        lines.push("Comprehension check: already passed.".into());
      }
    }
    (Phase::Guided, Some(state)) => {
      lines.push(format!(
        "Guided attempts so far: {}. Hints given so far: {}.",
        state.guided_attempts, state.hints_given
      ));
    }
    (Phase::Assessment, state) => {
      if let Some(min) = ctx.min_words {
        lines.push(format!("The piece must be at least {min} words long."));
      }
      if let Some(state) = state.filter(|s| s.revisions_used > 0) {
        lines.push(format!("Revisions used: {}.", state.revisions_used));
      }
    }
    _ => {}
  }
  lines
}

/// Hex SHA-256 of a prompt, used to correlate interaction events.
pub fn prompt_hash(prompt: &str) -> String {
  format!("{:x}", Sha256::digest(prompt.as_bytes()))
}
