//! Lesson session and its phase state machine.
//!
//! `instruction -> guided -> assessment -> feedback`, forward only. Transitions
//! are driven by decoded coach markers and by scored submissions, never by
//! conversation length alone; the escape caps in `Policy` are the one
//! exception, so a session cannot stall on a marker the model never emits.
//!
//! Callers mutate a working copy and persist it only after the whole turn
//! succeeded; every method here is synchronous and side-effect free.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::Policy;
use crate::domain::{AnswerMeta, Lesson, Message, Phase, PhaseState, Role, Rubric, ScoreResult, Tier};
use crate::markers::{ComprehensionCheck, DecodedReply, MAX_STEP};
use crate::prompt::PromptContext;
use crate::validate::min_words_for;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
  #[error("cannot {action} while session {session_id} is in phase {phase}")]
  InvalidTransition { session_id: String, phase: Phase, action: &'static str },
  #[error("session {0} not found")]
  NotFound(String),
}

/// A phase change caused by one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
  pub from: Phase,
  pub to: Phase,
  /// True when an escape cap, not a marker, completed the phase.
  pub forced: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
  pub id: String,
  pub child_id: String,
  pub lesson_id: String,
  pub tier: Tier,
  pub phase: Phase,
  pub phase_state: PhaseState,
  pub conversation_history: Vec<Message>,
  /// Widget requested by the latest coach message, if any.
  #[serde(default)] pub last_answer: Option<AnswerMeta>,
  #[serde(default)] pub final_score: Option<ScoreResult>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Session {
  pub fn new(child_id: &str, lesson_id: &str, tier: Tier, now: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      child_id: child_id.to_string(),
      lesson_id: lesson_id.to_string(),
      tier,
      phase: Phase::Instruction,
      phase_state: PhaseState::default(),
      conversation_history: Vec::new(),
      last_answer: None,
      final_score: None,
      created_at: now,
      updated_at: now,
    }
  }

  /// Resumable sessions are the ones that have not reached feedback.
  pub fn is_active(&self) -> bool { !self.phase.is_terminal() }

  pub fn last_coach_message(&self) -> Option<&Message> {
    self.conversation_history.iter().rev().find(|m| m.role == Role::Coach)
  }

  /// Prompt inputs, rebuilt purely from persisted fields.
  pub fn prompt_context<'a>(&'a self, lesson: &'a Lesson, rubric: Option<&Rubric>) -> PromptContext<'a> {
    let ctx = PromptContext::for_lesson(lesson, self.phase, self.tier).with_phase_state(&self.phase_state);
    if self.phase == Phase::Assessment {
      ctx.with_min_words(min_words_for(rubric))
    } else {
      ctx
    }
  }

  /// Append a student chat turn and count it toward the current phase.
  pub fn record_student_turn(&mut self, content: &str, now: DateTime<Utc>) {
    match self.phase {
      Phase::Instruction => self.phase_state.instruction_turns += 1,
      Phase::Guided => self.phase_state.guided_attempts += 1,
      Phase::Assessment | Phase::Feedback => {}
    }
    self.push(Role::Student, content, now);
  }

  /// Fold one decoded coach reply into the phase state, append it to the
  /// history, and advance at most one phase.
  pub fn apply_coach_reply(&mut self, reply: &DecodedReply, policy: &Policy, now: DateTime<Utc>) -> Option<Transition> {
    let signals = &reply.signals;
    let state = &mut self.phase_state;

    if signals.hint_given {
      state.hints_given += 1;
    }

    if let Some(target) = signals.phase_transition {
      let expected = self.phase.next();
      if expected != Some(target) || target == Phase::Feedback {
        warn!(target: "coach", session_id = %self.id, phase = %self.phase, requested = %target, "Ignoring out-of-order phase transition marker");
      }
    }

    let mut forced = false;
    match self.phase {
      Phase::Instruction => {
        if let Some(step) = signals.step {
          state.phase1_step = Some(state.phase1_step.map_or(step, |cur| cur.max(step)));
        }
        if signals.comprehension == Some(ComprehensionCheck::Passed) {
          state.comprehension_check_passed = true;
        }
        if signals.step == Some(MAX_STEP) || signals.phase_transition == Some(Phase::Guided) {
          state.instruction_completed = true;
        }
        let done = state.instruction_completed && state.comprehension_check_passed;
        if !done && state.instruction_turns >= policy.max_instruction_turns {
          warn!(target: "coach", session_id = %self.id, turns = state.instruction_turns, "Instruction turn cap reached; moving on");
          state.instruction_completed = true;
          state.comprehension_check_passed = true;
          forced = true;
        }
      }
      Phase::Guided => {
        if signals.phase_transition == Some(Phase::Assessment) {
          state.guided_complete = true;
        }
        if !state.guided_complete && state.guided_attempts >= policy.max_guided_attempts {
          warn!(target: "coach", session_id = %self.id, attempts = state.guided_attempts, "Guided attempt cap reached; moving on");
          state.guided_complete = true;
          forced = true;
        }
      }
      Phase::Assessment | Phase::Feedback => {}
    }

    self.last_answer = match self.phase {
      Phase::Guided | Phase::Assessment => signals.answer_meta(),
      Phase::Instruction | Phase::Feedback => None,
    };
    self.push(Role::Coach, &reply.display_text, now);

    let ready = match self.phase {
      Phase::Instruction => self.phase_state.instruction_completed && self.phase_state.comprehension_check_passed,
      Phase::Guided => self.phase_state.guided_complete,
      // assessment ends only through a scored submission
      Phase::Assessment | Phase::Feedback => false,
    };
    if ready { self.advance(now, forced) } else { None }
  }

  /// Note a writing submission (valid or not). Every submission after the first is a revision.
  pub fn record_submission(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
    self.require(Phase::Assessment, "submit writing")?;
    if self.phase_state.last_submitted_at.is_some() {
      self.phase_state.revisions_used += 1;
    }
    self.phase_state.last_submitted_at = Some(now);
    self.updated_at = now;
    Ok(())
  }

  /// Record a validated, scored submission and close the assessment.
  pub fn complete_assessment(
    &mut self,
    submission: &str,
    score: ScoreResult,
    coach_feedback: &str,
    now: DateTime<Utc>,
  ) -> Result<Transition, SessionError> {
    self.require(Phase::Assessment, "record a score")?;
    self.push(Role::Student, submission, now);
    self.push(Role::Coach, coach_feedback, now);
    self.final_score = Some(score);
    self.last_answer = None;
    self.advance(now, false).ok_or_else(|| SessionError::InvalidTransition {
      session_id: self.id.clone(),
      phase: self.phase,
      action: "close the assessment",
    })
  }

  fn require(&self, phase: Phase, action: &'static str) -> Result<(), SessionError> {
    if self.phase == phase {
      Ok(())
    } else {
      Err(SessionError::InvalidTransition { session_id: self.id.clone(), phase: self.phase, action })
    }
  }

  fn advance(&mut self, now: DateTime<Utc>, forced: bool) -> Option<Transition> {
    let from = self.phase;
    let to = from.next()?;
    debug_assert!(to > from, "phase must only move forward");
    self.phase = to;
    if to == Phase::Assessment && self.phase_state.writing_started_at.is_none() {
      self.phase_state.writing_started_at = Some(now);
    }
    self.updated_at = now;
    Some(Transition { from, to, forced })
  }

  fn push(&mut self, role: Role, content: &str, now: DateTime<Utc>) {
    self.conversation_history.push(Message::new(role, content, now));
    self.updated_at = now;
  }
}
