//! Session orchestration shared by the HTTP handlers.
//!
//! Every mutating operation follows the same shape: take the session's turn
//! lock, clone the stored session into a working copy, run the generator,
//! fold the result into the copy, and only then save it. Any failure before
//! the save leaves the stored session exactly as it was.

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::catalog::PLACEMENT_RUBRIC_ID;
use crate::domain::{Message, Role, ScoreResult, Tier};
use crate::error::CoachError;
use crate::generator::Purpose;
use crate::markers;
use crate::prompt::{build_prompt, prompt_hash};
use crate::scoring::{
  build_scoring_prompt, feedback_message, request_placement_prompts, score_placement, score_submission,
  TierAssignment,
};
use crate::session::{Session, Transition};
use crate::state::AppState;
use crate::store::{LessonProgress, PlacementRecord};
use crate::telemetry::InteractionEvent;
use crate::validate::{validate_submission, ValidationResult};

/// Student line used to open a lesson. Never persisted.
const KICKOFF_MESSAGE: &str = "Hi! I'm ready to start the lesson.";

#[derive(Clone, Debug)]
pub struct StartOutcome {
  pub session: Session,
  pub resumed: bool,
}

#[derive(Clone, Debug)]
pub struct TurnOutcome {
  pub session: Session,
  pub reply: String,
  pub transition: Option<Transition>,
}

#[derive(Clone, Debug)]
pub struct SubmitOutcome {
  pub session: Session,
  pub validation: ValidationResult,
  pub score: Option<ScoreResult>,
  pub transition: Option<Transition>,
}

/// Resume the child's active session for this lesson, or open a new one with a coach greeting.
#[instrument(level = "info", skip(state), fields(%child_id, %lesson_id))]
pub async fn start_lesson(
  state: &AppState,
  child_id: &str,
  lesson_id: &str,
  tier: Option<Tier>,
) -> Result<StartOutcome, CoachError> {
  let lesson = state.lesson(lesson_id)?;
  let _start_guard = state.store.lock_session(&format!("start:{child_id}:{lesson_id}")).await;

  if let Some(session) = state.store.find_active(child_id, lesson_id).await {
    info!(target: "coach", session_id = %session.id, phase = %session.phase, "Resuming active session");
    return Ok(StartOutcome { session, resumed: true });
  }

  let generator = state.generator()?;
  let now = Utc::now();
  let tier = state.resolve_tier(child_id, tier, lesson).await;
  let mut session = Session::new(child_id, lesson_id, tier, now);

  let prompt = build_prompt(&state.prompts, &session.prompt_context(lesson, state.catalog.rubric_for(lesson)));
  let kickoff = [Message::new(Role::Student, KICKOFF_MESSAGE, now)];
  let generation = generator.generate(Purpose::Coach, &prompt, &kickoff).await?;
  let decoded = markers::decode(&generation.text);
  let transition = session.apply_coach_reply(&decoded, &state.policy, Utc::now());

  state.store.create(session.clone()).await;
  state.store.upsert_progress(LessonProgress::of(&session)).await;
  state.telemetry.emit(
    InteractionEvent::new("lesson_start", prompt_hash(&prompt), &generation)
      .for_session(&session.id, session.phase)
      .with_transition(transition),
  );
  info!(target: "coach", session_id = %session.id, %tier, "Session created");
  Ok(StartOutcome { session, resumed: false })
}

/// One conversational turn: student message in, coach reply out.
#[instrument(level = "info", skip(state, text), fields(%session_id, text_len = text.len()))]
pub async fn take_turn(state: &AppState, session_id: &str, text: &str) -> Result<TurnOutcome, CoachError> {
  let text = text.trim();
  if text.is_empty() {
    return Err(CoachError::BadRequest("message text is empty".into()));
  }
  let _turn = state.store.lock_session(session_id).await;
  let stored = state.session(session_id).await?;
  let lesson = state.lesson(&stored.lesson_id)?;
  let generator = state.generator()?;

  let mut working = stored.clone();
  working.record_student_turn(text, Utc::now());
  let prompt = build_prompt(&state.prompts, &working.prompt_context(lesson, state.catalog.rubric_for(lesson)));
  let generation = generator.generate(Purpose::Coach, &prompt, &working.conversation_history).await?;

  let decoded = markers::decode(&generation.text);
  if decoded.display_text.is_empty() {
    warn!(target: "coach", %session_id, "Coach reply was only markers");
  }
  let phase_before = working.phase;
  let transition = working.apply_coach_reply(&decoded, &state.policy, Utc::now());

  state.store.save(&working).await;
  state.store.upsert_progress(LessonProgress::of(&working)).await;
  state.telemetry.emit(
    InteractionEvent::new("turn", prompt_hash(&prompt), &generation)
      .for_session(&working.id, phase_before)
      .with_transition(transition),
  );
  if let Some(t) = transition {
    info!(target: "coach", %session_id, from = %t.from, to = %t.to, forced = t.forced, "Phase transition");
  }
  Ok(TurnOutcome { reply: decoded.display_text, session: working, transition })
}

/// Assessment submission: validate, then score, then move to feedback.
/// An invalid piece is reported without any model call.
#[instrument(level = "info", skip(state, text), fields(%session_id, text_len = text.len()))]
pub async fn submit_writing(state: &AppState, session_id: &str, text: &str) -> Result<SubmitOutcome, CoachError> {
  let _turn = state.store.lock_session(session_id).await;
  let stored = state.session(session_id).await?;
  let lesson = state.lesson(&stored.lesson_id)?;
  let rubric = state.catalog.rubric_for(lesson);

  let mut working = stored.clone();
  working.record_submission(Utc::now())?;
  let validation = validate_submission(text, rubric);
  if !validation.is_valid() {
    debug!(target: "coach", %session_id, words = validation.word_count(), "Submission rejected by validator");
    state.store.save(&working).await;
    return Ok(SubmitOutcome { session: working, validation, score: None, transition: None });
  }

  let rubric = rubric.ok_or_else(|| CoachError::RubricNotFound(lesson.rubric_id.clone().unwrap_or_default()))?;
  let generator = state.generator()?;
  let (result, generation) = score_submission(generator, &state.prompts, text, rubric).await?;

  let feedback = feedback_message(&result);
  let transition = working.complete_assessment(text, result.clone(), &feedback, Utc::now())?;
  state.store.save(&working).await;
  state.store.upsert_progress(LessonProgress::of(&working)).await;

  let (system, user) = build_scoring_prompt(&state.prompts, text, rubric);
  state.telemetry.emit(
    InteractionEvent::new("score", prompt_hash(&format!("{system}\n\n{user}")), &generation)
      .for_session(&working.id, transition.from)
      .with_transition(Some(transition)),
  );
  info!(target: "coach", %session_id, overall = result.overall_score, revisions = working.phase_state.revisions_used, "Assessment scored");
  Ok(SubmitOutcome { session: working, validation, score: Some(result), transition: Some(transition) })
}

#[instrument(level = "info", skip(state))]
pub async fn start_placement(state: &AppState, child_id: &str) -> Result<PlacementRecord, CoachError> {
  let generator = state.generator()?;
  let (prompts, generation) = request_placement_prompts(generator, &state.prompts).await?;
  let record = PlacementRecord {
    id: Uuid::new_v4().to_string(),
    child_id: child_id.to_string(),
    prompts,
    created_at: Utc::now(),
    scores: None,
  };
  state.store.save_placement(record.clone()).await;
  state.telemetry.emit(InteractionEvent::new(
    "placement_prompts",
    prompt_hash(&state.prompts.placement_system),
    &generation,
  ));
  info!(target: "coach", placement_id = %record.id, %child_id, "Placement started");
  Ok(record)
}

/// Score the three responses and record a recommended tier. A parent override is kept.
#[instrument(level = "info", skip(state, responses), fields(%placement_id, responses = responses.len()))]
pub async fn submit_placement(
  state: &AppState,
  placement_id: &str,
  responses: &[String],
) -> Result<TierAssignment, CoachError> {
  let mut record = state
    .store
    .get_placement(placement_id)
    .await
    .ok_or_else(|| CoachError::PlacementNotFound(placement_id.to_string()))?;
  if responses.len() != record.prompts.len() {
    return Err(CoachError::BadRequest(format!(
      "expected {} responses, got {}",
      record.prompts.len(),
      responses.len()
    )));
  }
  let rubric = state
    .catalog
    .get_rubric_by_id(PLACEMENT_RUBRIC_ID)
    .ok_or_else(|| CoachError::RubricNotFound(PLACEMENT_RUBRIC_ID.to_string()))?;
  let generator = state.generator()?;

  let scores = score_placement(generator, &state.prompts, rubric, responses).await?;
  record.scores = Some(scores.clone());
  state.store.save_placement(record.clone()).await;
  let assignment = state.store.set_recommended(&record.child_id, scores, Utc::now()).await;
  info!(
    target: "coach",
    %placement_id,
    child_id = %record.child_id,
    recommended = ?assignment.recommended_tier,
    effective = ?assignment.effective_tier(),
    "Placement scored"
  );
  Ok(assignment)
}

#[instrument(level = "info", skip(state))]
pub async fn assign_tier(state: &AppState, child_id: &str, tier: Tier) -> TierAssignment {
  let assignment = state.store.assign_tier(child_id, tier, Utc::now()).await;
  info!(target: "coach", %child_id, %tier, recommended = ?assignment.recommended_tier, "Tier assigned by parent");
  assignment
}

/// Stand-alone validator, optionally against a rubric's word range.
pub fn validate_text(state: &AppState, text: &str, rubric_id: Option<&str>) -> Result<ValidationResult, CoachError> {
  let rubric = match rubric_id {
    Some(id) => Some(state.catalog.get_rubric_by_id(id).ok_or_else(|| CoachError::RubricNotFound(id.to_string()))?),
    None => None,
  };
  Ok(validate_submission(text, rubric))
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::domain::{AnswerType, Phase};
  use crate::generator::mock::{MockGenerator, MockReply};
  use crate::generator::{Generator, GeneratorError};
  use crate::scoring::ScoringError;
  use crate::session::SessionError;
  use crate::validate::ValidationErrorKind;

  const LESSON: &str = "narr-magic-door";

  fn state_with(replies: Vec<MockReply>) -> (AppState, Arc<MockGenerator>) {
    let mock = Arc::new(MockGenerator::new(replies));
    let generator: Arc<dyn Generator> = mock.clone();
    (AppState::for_tests(Some(generator)), mock)
  }

  fn story() -> String {
    "One sunny morning my brave little dog ran into the tall green woods behind our house and found a shiny \
     old key hidden under a mossy rock near the quiet river bank"
      .to_string()
  }

  const SCORE_REPLY: &str = r#"{"scores": {"ideas": 3, "organization": 3, "word_choice": 2, "conventions": 4},
    "overallScore": 3, "feedback": {"strength": "Great setting!", "growthArea": "Add feelings.", "encouragement": "Keep going!"}}"#;

  #[tokio::test]
  async fn start_creates_then_resumes_without_a_model_call() {
    let (state, mock) = state_with(vec![MockReply::text("[STEP: 1] Welcome, writer! [HINT_GIVEN]")]);
    let first = start_lesson(&state, "kid", LESSON, None).await.expect("start");
    assert!(!first.resumed);
    assert_eq!(first.session.phase, Phase::Instruction);
    assert_eq!(first.session.phase_state.phase1_step, Some(1));
    assert_eq!(first.session.conversation_history.len(), 1, "kickoff message is not stored");
    assert_eq!(first.session.conversation_history[0].content, "[STEP: 1] Welcome, writer!");

    let again = start_lesson(&state, "kid", LESSON, None).await.expect("resume");
    assert!(again.resumed);
    assert_eq!(again.session.id, first.session.id);
    assert_eq!(mock.call_count(), 1);
  }

  #[tokio::test]
  async fn full_lesson_walks_every_phase_in_order() {
    let (state, mock) = state_with(vec![
      MockReply::text("[STEP: 1] Let's learn about story beginnings."),
      MockReply::text("[COMPREHENSION_CHECK: passed] [STEP: 5] You've got it! [PHASE_TRANSITION: guided]"),
      MockReply::text("[ANSWER_TYPE: choice] [OPTIONS: A dragon | A door] Which hook is stronger? [HINT_GIVEN]"),
      MockReply::text("Perfect! [PHASE_TRANSITION: assessment] Time to write your own story."),
      MockReply::text(SCORE_REPLY),
    ]);
    let sid = start_lesson(&state, "kid", LESSON, None).await.expect("start").session.id;

    let t = take_turn(&state, &sid, "A hook grabs the reader").await.expect("turn 1");
    assert_eq!(t.transition.map(|t| t.to), Some(Phase::Guided));
    assert_eq!(t.reply, "[STEP: 5] You've got it!");

    let t = take_turn(&state, &sid, "ok").await.expect("turn 2");
    assert_eq!(t.session.phase, Phase::Guided);
    assert_eq!(t.session.phase_state.hints_given, 1);
    assert_eq!(t.session.phase_state.guided_attempts, 1);
    assert_eq!(t.session.last_answer.as_ref().map(|a| a.answer_type), Some(AnswerType::Choice));

    let t = take_turn(&state, &sid, "A dragon").await.expect("turn 3");
    assert_eq!(t.session.phase, Phase::Assessment);
    assert!(t.session.phase_state.writing_started_at.is_some());

    let rejected = submit_writing(&state, &sid, "The cat sat.").await.expect("submit short");
    match &rejected.validation {
      ValidationResult::Invalid { error, word_count, min_words, .. } => {
        assert_eq!(*error, ValidationErrorKind::TooShort);
        assert_eq!((*word_count, *min_words), (3, 25));
      }
      other => panic!("expected too_short, got {other:?}"),
    }
    assert_eq!(rejected.session.phase, Phase::Assessment);
    assert_eq!(mock.call_count(), 4, "validator failures never reach the model");

    let scored = submit_writing(&state, &sid, &story()).await.expect("submit story");
    assert_eq!(scored.transition.map(|t| t.to), Some(Phase::Feedback));
    assert_eq!(scored.score.as_ref().map(|s| s.overall_score), Some(3.0));
    assert_eq!(scored.session.phase_state.revisions_used, 1);

    let stored = state.session(&sid).await.expect("stored");
    assert_eq!(stored.phase, Phase::Feedback);
    assert!(stored.last_coach_message().map(|m| m.content.contains("Great setting!")).unwrap_or(false));
    assert_eq!(state.store.progress("kid", LESSON).await.and_then(|p| p.score), Some(3.0));
    assert!(state.store.find_active("kid", LESSON).await.is_none());
  }

  #[tokio::test]
  async fn generator_failure_leaves_the_session_untouched() {
    let (state, _mock) = state_with(vec![
      MockReply::text("[STEP: 1] Hello!"),
      MockReply::Error(GeneratorError::Transport("connection reset".into())),
    ]);
    let sid = start_lesson(&state, "kid", LESSON, None).await.expect("start").session.id;
    let before = state.session(&sid).await.expect("stored");

    let err = take_turn(&state, &sid, "hello?").await.expect_err("turn fails");
    assert!(err.is_retryable());
    assert_eq!(state.session(&sid).await.expect("stored"), before);
  }

  #[tokio::test]
  async fn scoring_failure_leaves_the_session_in_assessment() {
    let (state, _mock) = state_with(vec![
      MockReply::text("[STEP: 5] [COMPREHENSION_CHECK: passed] Done!"),
      MockReply::text("[PHASE_TRANSITION: assessment] Write!"),
      MockReply::text("I can't grade this right now."),
    ]);
    let sid = start_lesson(&state, "kid", LESSON, None).await.expect("start").session.id;
    take_turn(&state, &sid, "ready").await.expect("guided");
    let before = state.session(&sid).await.expect("stored");
    assert_eq!(before.phase, Phase::Assessment);

    let err = submit_writing(&state, &sid, &story()).await.expect_err("bad grader reply");
    assert!(matches!(err, CoachError::Scoring(ScoringError::MalformedReply(_))));
    assert_eq!(state.session(&sid).await.expect("stored"), before);
  }

  #[tokio::test]
  async fn submitting_outside_assessment_is_a_conflict() {
    let (state, _mock) = state_with(vec![MockReply::text("Hi!")]);
    let sid = start_lesson(&state, "kid", LESSON, None).await.expect("start").session.id;
    let err = submit_writing(&state, &sid, &story()).await.expect_err("wrong phase");
    assert!(matches!(err, CoachError::Session(SessionError::InvalidTransition { phase: Phase::Instruction, .. })));
  }

  #[tokio::test]
  async fn guided_cap_forces_assessment() {
    let mut replies = vec![MockReply::text("[STEP: 5] [COMPREHENSION_CHECK: passed] Ready!")];
    replies.extend((0..8).map(|_| MockReply::text("Try again!")));
    let (state, _mock) = state_with(replies);
    let sid = start_lesson(&state, "kid", LESSON, None).await.expect("start").session.id;
    let mut last = None;
    for _ in 0..8 {
      last = take_turn(&state, &sid, "guess").await.expect("turn").transition;
    }
    assert_eq!(last.map(|t| (t.to, t.forced)), Some((Phase::Assessment, true)));
  }

  #[tokio::test]
  async fn unknown_ids_are_not_found() {
    let (state, _mock) = state_with(vec![]);
    assert!(matches!(start_lesson(&state, "kid", "nope", None).await, Err(CoachError::LessonNotFound(_))));
    assert!(matches!(take_turn(&state, "missing", "hi").await, Err(CoachError::Session(SessionError::NotFound(_)))));
    assert!(matches!(submit_placement(&state, "missing", &[]).await, Err(CoachError::PlacementNotFound(_))));
  }

  #[tokio::test]
  async fn no_generator_means_unavailable_but_validation_works() {
    let state = AppState::for_tests(None);
    let err = start_lesson(&state, "kid", LESSON, None).await.expect_err("no generator");
    assert!(matches!(err, CoachError::Generator(GeneratorError::Unavailable(_))));
    let v = validate_text(&state, &story(), Some("narrative")).expect("validate");
    assert!(v.is_valid());
    assert!(matches!(validate_text(&state, "x", Some("nope")), Err(CoachError::RubricNotFound(_))));
  }

  #[tokio::test]
  async fn placement_recommends_a_tier_and_keeps_parent_override() {
    let placement_prompts = r#"[{"type":"narrative","prompt":"Tell a story"},{"type":"descriptive","prompt":"Describe a place"},{"type":"persuasive","prompt":"Convince a friend"}]"#;
    let high = r#"{"scores": {"ideas": 4, "organization": 4, "conventions": 4}}"#;
    let (state, _mock) = state_with(vec![MockReply::text(placement_prompts), MockReply::text(high), MockReply::text(high)]);

    let record = start_placement(&state, "kid").await.expect("placement");
    assert_eq!(record.prompts.len(), 3);
    let one = Tier::try_from(1u8).expect("tier");
    assign_tier(&state, "kid", one).await;

    let responses = vec![story(), story(), "too short".to_string()];
    let assignment = submit_placement(&state, &record.id, &responses).await.expect("scored");
    assert_eq!(assignment.placement_scores, vec![1.0, 1.0, 0.0]);
    assert_eq!(assignment.recommended_tier.map(Tier::get), Some(2));
    assert_eq!(assignment.effective_tier(), Some(one));
  }

  #[tokio::test]
  async fn placement_with_two_prompts_is_a_retryable_failure() {
    let (state, _mock) = state_with(vec![MockReply::text(r#"["Tell a story", "Describe a place"]"#)]);
    let err = start_placement(&state, "kid").await.expect_err("two prompts");
    assert!(matches!(err, CoachError::Scoring(ScoringError::PlacementPromptCount { expected: 3, got: 2 })));
    assert!(err.is_retryable());
  }
}
