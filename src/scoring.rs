//! Rubric scoring and placement.
//!
//! The grading judgment itself comes from the generator. Everything around it
//! is deterministic here: the scoring prompt, decoding of the grader's JSON
//! with its common key variants, and the weighted overall score.
//!
//! Placement asks for exactly three prompts and turns the normalized scores
//! of the child's responses into a recommended tier.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::Prompts;
use crate::domain::{Criterion, Feedback, LessonType, Message, Role, Rubric, ScoreResult, Tier};
use crate::error::CoachError;
use crate::generator::{Generation, Generator, Purpose};
use crate::util::{extract_json_block, fill_template, trunc_for_log};
use crate::validate::validate_submission;

/// Order and kinds of the placement prompts.
pub const PLACEMENT_TYPES: [LessonType; 3] = [LessonType::Narrative, LessonType::Descriptive, LessonType::Persuasive];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoringError {
  #[error("grader reply is not usable JSON: {0}")]
  MalformedReply(String),
  #[error("grader reply has no score for criterion {0:?}")]
  MissingCriterion(String),
  #[error("expected {expected} placement prompts, got {got}")]
  PlacementPromptCount { expected: usize, got: usize },
}

// --- Scoring prompt ---

/// System and user prompt for one scoring call. Criteria are embedded verbatim.
pub fn build_scoring_prompt(prompts: &Prompts, submission: &str, rubric: &Rubric) -> (String, String) {
  let criteria_json = serde_json::to_string(&rubric.criteria).unwrap_or_else(|_| "[]".into());
  let word_min = rubric.word_range[0].to_string();
  let word_max = rubric.word_range[1].to_string();
  let user = fill_template(
    &prompts.scoring_user_template,
    &[
      ("rubric_description", rubric.description.as_str()),
      ("word_min", word_min.as_str()),
      ("word_max", word_max.as_str()),
      ("criteria_json", criteria_json.as_str()),
      // last, so text inside the submission is never treated as a placeholder
      ("submission", submission),
    ],
  );
  (prompts.scoring_system.clone(), user)
}

// --- Reply decoding ---

#[derive(Deserialize)]
#[serde(untagged)]
enum ScoreValue {
  Number(f64),
  Detailed { score: f64 },
  Text(String),
}

impl ScoreValue {
  fn as_f64(&self) -> Option<f64> {
    match self {
      ScoreValue::Number(n) | ScoreValue::Detailed { score: n } => Some(*n),
      ScoreValue::Text(s) => s.trim().parse().ok(),
    }
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextValue {
  One(String),
  Many(Vec<String>),
}

impl TextValue {
  fn into_text(self) -> String {
    match self {
      TextValue::One(s) => s,
      TextValue::Many(v) => v.join(" "),
    }
  }
}

/// Feedback under its canonical names, with the alternates models actually use.
#[derive(Deserialize, Default)]
struct FeedbackReply {
  #[serde(default, alias = "strengths")]
  strength: Option<TextValue>,
  #[serde(default, rename = "growthArea", alias = "growth", alias = "growth_area", alias = "areaForGrowth")]
  growth_area: Option<TextValue>,
  #[serde(default, alias = "encouragement_message")]
  encouragement: Option<TextValue>,
}

#[derive(Deserialize)]
struct ScoreReply {
  #[serde(default, alias = "criteria", alias = "criterion_scores", alias = "criterionScores")]
  scores: BTreeMap<String, ScoreValue>,
  #[serde(default, rename = "overallScore", alias = "overall", alias = "overall_score")]
  overall_score: Option<ScoreValue>,
  /// Nested `feedback: {...}` block.
  #[serde(default)]
  feedback: Option<FeedbackReply>,
  /// Same fields written at the top level.
  #[serde(flatten)]
  top_level: FeedbackReply,
}

fn round2(x: f64) -> f64 { (x * 100.0).round() / 100.0 }

/// Into `MIN_LEVEL..=max`; never panics on a degenerate `max`.
fn clamp_level(x: f64, max: f64) -> f64 { x.min(max).max(Criterion::MIN_LEVEL) }

fn find_score(scores: &BTreeMap<String, ScoreValue>, criterion: &Criterion) -> Option<f64> {
  scores
    .get(&criterion.name)
    .or_else(|| scores.get(&criterion.display_name))
    .or_else(|| {
      scores
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(&criterion.name) || k.eq_ignore_ascii_case(&criterion.display_name))
        .map(|(_, v)| v)
    })
    .and_then(ScoreValue::as_f64)
}

/// Weighted mean `Σ(score·weight) / Σweight`; plain mean if weights sum to zero.
pub fn weighted_overall(rubric: &Rubric, scores: &BTreeMap<String, f64>) -> f64 {
  let mut weighted = 0.0;
  let mut weights = 0.0;
  let mut plain = 0.0;
  for c in &rubric.criteria {
    let s = scores.get(&c.name).copied().unwrap_or(0.0);
    weighted += s * c.weight;
    weights += c.weight;
    plain += s;
  }
  if rubric.criteria.is_empty() {
    0.0
  } else if weights > 0.0 {
    round2(weighted / weights)
  } else {
    round2(plain / rubric.criteria.len() as f64)
  }
}

/// Decode a grader reply against the rubric it was asked about.
pub fn parse_score_reply(raw: &str, rubric: &Rubric) -> Result<ScoreResult, ScoringError> {
  let json = extract_json_block(raw).ok_or_else(|| ScoringError::MalformedReply(trunc_for_log(raw, 80)))?;
  let reply: ScoreReply =
    serde_json::from_str(json).map_err(|e| ScoringError::MalformedReply(e.to_string()))?;

  let mut scores = BTreeMap::new();
  for c in &rubric.criteria {
    let value = find_score(&reply.scores, c).ok_or_else(|| ScoringError::MissingCriterion(c.name.clone()))?;
    scores.insert(c.name.clone(), clamp_level(value, c.max_level()));
  }
  let extra = reply.scores.len().saturating_sub(scores.len());
  if extra > 0 {
    debug!(target: "scoring", rubric = %rubric.id, extra, "Grader returned scores for unknown criteria");
  }

  let overall_score = match reply.overall_score.as_ref().and_then(ScoreValue::as_f64) {
    Some(v) if v.is_finite() => round2(clamp_level(v, rubric.max_level())),
    _ => weighted_overall(rubric, &scores),
  };

  let nested = reply.feedback.unwrap_or_default();
  let top = reply.top_level;
  let pick = |a: Option<TextValue>, b: Option<TextValue>| {
    a.or(b).map(TextValue::into_text).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
  };
  let feedback = Feedback {
    strength: pick(nested.strength, top.strength)
      .unwrap_or_else(|| "You got your ideas down on paper. That is a real writer's move!".into()),
    growth_area: pick(nested.growth_area, top.growth_area).unwrap_or_else(|| fallback_growth(rubric, &scores)),
    encouragement: pick(nested.encouragement, top.encouragement)
      .unwrap_or_else(|| "Keep writing. Every piece makes you stronger!".into()),
  };

  Ok(ScoreResult { scores, overall_score, feedback })
}

/// Growth note from the weakest criterion's first feedback stem.
fn fallback_growth(rubric: &Rubric, scores: &BTreeMap<String, f64>) -> String {
  let weakest = rubric.criteria.iter().min_by(|a, b| {
    let sa = scores.get(&a.name).copied().unwrap_or(0.0) / a.max_level();
    let sb = scores.get(&b.name).copied().unwrap_or(0.0) / b.max_level();
    sa.total_cmp(&sb)
  });
  match weakest {
    Some(c) => c.feedback_stems.first().cloned().unwrap_or_else(|| format!("Next time, work on {}.", c.display_name)),
    None => "Next time, add one more detail.".into(),
  }
}

/// Coach message appended to the history once a piece is scored.
pub fn feedback_message(result: &ScoreResult) -> String {
  format!(
    "🌟 {}\n🌱 {}\n💪 {}",
    result.feedback.strength, result.feedback.growth_area, result.feedback.encouragement
  )
}

/// Score one submission. The caller has already run the validator.
#[instrument(level = "info", skip(generator, prompts, submission, rubric), fields(rubric = %rubric.id, text_len = submission.len()))]
pub async fn score_submission(
  generator: &dyn Generator,
  prompts: &Prompts,
  submission: &str,
  rubric: &Rubric,
) -> Result<(ScoreResult, Generation), CoachError> {
  let (system, user) = build_scoring_prompt(prompts, submission, rubric);
  let context = [Message::new(Role::Student, user, Utc::now())];
  let generation = generator.generate(Purpose::Grading, &system, &context).await?;
  let result = parse_score_reply(&generation.text, rubric).map_err(|e| {
    warn!(target: "scoring", rubric = %rubric.id, error = %e, preview = %trunc_for_log(&generation.text, 60), "Unusable grader reply");
    e
  })?;
  info!(target: "scoring", rubric = %rubric.id, overall = result.overall_score, "Submission scored");
  Ok((result, generation))
}

// --- Placement ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementPrompt {
  #[serde(rename = "type")]
  pub prompt_type: LessonType,
  pub prompt: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PromptItem {
  Text(String),
  Object {
    #[serde(default, rename = "type", alias = "kind", alias = "prompt_type")]
    kind: Option<String>,
    #[serde(alias = "text", alias = "question")]
    prompt: String,
  },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlacementReply {
  List(Vec<PromptItem>),
  Wrapped { prompts: Vec<PromptItem> },
}

fn parse_lesson_type(s: &str) -> Option<LessonType> {
  match s.trim().to_ascii_lowercase().as_str() {
    "narrative" => Some(LessonType::Narrative),
    "descriptive" => Some(LessonType::Descriptive),
    "persuasive" => Some(LessonType::Persuasive),
    "expository" => Some(LessonType::Expository),
    _ => None,
  }
}

/// Exactly three prompts, one per placement type, or an error. Never fewer.
pub fn parse_placement_prompts(raw: &str) -> Result<Vec<PlacementPrompt>, ScoringError> {
  let json = extract_json_block(raw).ok_or_else(|| ScoringError::MalformedReply(trunc_for_log(raw, 80)))?;
  let items = match serde_json::from_str::<PlacementReply>(json) {
    Ok(PlacementReply::List(items)) | Ok(PlacementReply::Wrapped { prompts: items }) => items,
    Err(e) => return Err(ScoringError::MalformedReply(e.to_string())),
  };
  if items.len() != PLACEMENT_TYPES.len() {
    return Err(ScoringError::PlacementPromptCount { expected: PLACEMENT_TYPES.len(), got: items.len() });
  }

  let mut out: Vec<PlacementPrompt> = Vec::with_capacity(3);
  for (i, item) in items.into_iter().enumerate() {
    let (kind, prompt) = match item {
      PromptItem::Text(p) => (None, p),
      PromptItem::Object { kind, prompt } => (kind, prompt),
    };
    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
      return Err(ScoringError::MalformedReply(format!("placement prompt {} is empty", i + 1)));
    }
    let prompt_type = kind.as_deref().and_then(parse_lesson_type).unwrap_or(PLACEMENT_TYPES[i]);
    out.push(PlacementPrompt { prompt_type, prompt });
  }

  out.sort_by_key(|p| PLACEMENT_TYPES.iter().position(|t| *t == p.prompt_type).unwrap_or(usize::MAX));
  let kinds: Vec<LessonType> = out.iter().map(|p| p.prompt_type).collect();
  if kinds != PLACEMENT_TYPES {
    return Err(ScoringError::MalformedReply(format!("placement prompt types {kinds:?} do not cover narrative, descriptive, persuasive")));
  }
  Ok(out)
}

#[instrument(level = "info", skip(generator, prompts))]
pub async fn request_placement_prompts(
  generator: &dyn Generator,
  prompts: &Prompts,
) -> Result<(Vec<PlacementPrompt>, Generation), CoachError> {
  let context = [Message::new(Role::Student, prompts.placement_user_template.clone(), Utc::now())];
  let generation = generator.generate(Purpose::Grading, &prompts.placement_system, &context).await?;
  let parsed = parse_placement_prompts(&generation.text).map_err(|e| {
    warn!(target: "scoring", error = %e, "Placement prompt reply rejected");
    e
  })?;
  Ok((parsed, generation))
}

/// Mean normalized score: below 0.45 is tier 1, below 0.75 tier 2, else tier 3.
pub fn recommend_tier(normalized: &[f64]) -> Tier {
  let mean = if normalized.is_empty() { 0.0 } else { normalized.iter().sum::<f64>() / normalized.len() as f64 };
  let tier: u8 = if mean < 0.45 {
    1
  } else if mean < 0.75 {
    2
  } else {
    3
  };
  Tier::try_from(tier).unwrap_or_default()
}

/// Score each placement response against the placement rubric, 0..=1 per response.
/// Responses that fail the validator score 0 without a model call.
#[instrument(level = "info", skip_all, fields(responses = responses.len()))]
pub async fn score_placement(
  generator: &dyn Generator,
  prompts: &Prompts,
  rubric: &Rubric,
  responses: &[String],
) -> Result<Vec<f64>, CoachError> {
  let max = rubric.max_level();
  let mut normalized = Vec::with_capacity(responses.len());
  for (i, text) in responses.iter().enumerate() {
    let check = validate_submission(text, Some(rubric));
    if !check.is_valid() {
      info!(target: "scoring", index = i, words = check.word_count(), "Placement response failed validation; scored 0");
      normalized.push(0.0);
      continue;
    }
    let (result, _) = score_submission(generator, prompts, text, rubric).await?;
    normalized.push(if max > 0.0 { round2(result.overall_score / max) } else { 0.0 });
  }
  Ok(normalized)
}

/// Recommended tier from placement plus an optional parent override. Both are kept.
/// `recommended_tier` stays empty until a placement has been scored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierAssignment {
  pub child_id: String,
  #[serde(default)]
  pub recommended_tier: Option<Tier>,
  #[serde(default)]
  pub assigned_tier: Option<Tier>,
  #[serde(default)]
  pub placement_scores: Vec<f64>,
  pub updated_at: DateTime<Utc>,
}

impl TierAssignment {
  /// No placement yet and no override.
  pub fn unplaced(child_id: &str, now: DateTime<Utc>) -> Self {
    Self {
      child_id: child_id.to_string(),
      recommended_tier: None,
      assigned_tier: None,
      placement_scores: Vec::new(),
      updated_at: now,
    }
  }

  pub fn from_placement(child_id: &str, placement_scores: Vec<f64>, now: DateTime<Utc>) -> Self {
    Self {
      recommended_tier: Some(recommend_tier(&placement_scores)),
      placement_scores,
      ..Self::unplaced(child_id, now)
    }
  }

  /// Parent override first, then the placement recommendation.
  pub fn effective_tier(&self) -> Option<Tier> { self.assigned_tier.or(self.recommended_tier) }

  pub fn assign(&mut self, tier: Tier, now: DateTime<Utc>) {
    self.assigned_tier = Some(tier);
    self.updated_at = now;
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::generator::mock::{MockGenerator, MockReply};

  fn criterion(name: &str, weight: f64) -> Criterion {
    Criterion {
      name: name.into(),
      display_name: name.to_uppercase(),
      weight,
      levels: vec!["1".into(), "2".into(), "3".into(), "4".into()],
      feedback_stems: vec![format!("Try adding more {name}.")],
    }
  }

  fn rubric() -> Rubric {
    Rubric {
      id: "narrative".into(),
      description: "Narrative rubric".into(),
      word_range: [50, 150],
      criteria: vec![criterion("ideas", 0.5), criterion("organization", 0.3), criterion("conventions", 0.2)],
    }
  }

  #[test]
  fn prompt_embeds_criteria_verbatim_and_is_deterministic() {
    let prompts = Prompts::default();
    let r = rubric();
    let (sys_a, user_a) = build_scoring_prompt(&prompts, "My {word_min} dog.", &r);
    let (sys_b, user_b) = build_scoring_prompt(&prompts, "My {word_min} dog.", &r);
    assert_eq!((sys_a, &user_a), (sys_b, &user_b));
    let criteria_json = serde_json::to_string(&r.criteria).expect("json");
    assert!(user_a.contains(&criteria_json));
    assert!(user_a.contains("50 to 150 words"));
    assert!(user_a.contains("My {word_min} dog."));
  }

  #[test]
  fn weighted_overall_when_model_omits_it() {
    let raw = r#"Here you go:
```json
{"scores": {"ideas": 4, "organization": 2, "conventions": 3},
 "feedback": {"strength": "Vivid hook", "growth": "Add paragraphs", "encouragement": "Great job!"}}
```"#;
    let res = parse_score_reply(raw, &rubric()).expect("parsed");
    // 4*0.5 + 2*0.3 + 3*0.2 = 3.2
    assert_eq!(res.overall_score, 3.2);
    assert_eq!(res.feedback.growth_area, "Add paragraphs");
    assert_eq!(res.scores["organization"], 2.0);
  }

  #[test]
  fn model_overall_is_used_and_clamped() {
    let raw = r#"{"scores": {"ideas": 9, "ORGANIZATION": "3", "conventions": {"score": 1}}, "overall": 7, "strengths": ["Bold", "voice"], "growthArea": "Commas"}"#;
    let res = parse_score_reply(raw, &rubric()).expect("parsed");
    assert_eq!(res.scores["ideas"], 4.0);
    assert_eq!(res.scores["organization"], 3.0);
    assert_eq!(res.scores["conventions"], 1.0);
    assert_eq!(res.overall_score, 4.0);
    assert_eq!(res.feedback.strength, "Bold voice");
    assert_eq!(res.feedback.growth_area, "Commas");
    assert!(!res.feedback.encouragement.is_empty());
  }

  #[test]
  fn scores_below_the_first_level_are_raised_to_it() {
    let raw = r#"{"scores": {"ideas": 0, "organization": -2, "conventions": 2}, "overallScore": 0}"#;
    let res = parse_score_reply(raw, &rubric()).expect("parsed");
    assert_eq!(res.scores["ideas"], 1.0);
    assert_eq!(res.scores["organization"], 1.0);
    assert_eq!(res.overall_score, 1.0);
  }

  #[test]
  fn overall_given_as_text_is_accepted() {
    let raw = r#"{"scores": {"ideas": 4, "organization": 3, "conventions": 3}, "overallScore": " 3.5 "}"#;
    let res = parse_score_reply(raw, &rubric()).expect("parsed");
    assert_eq!(res.overall_score, 3.5);

    let raw = r#"{"scores": {"ideas": 4, "organization": 2, "conventions": 3}, "overall": "great"}"#;
    let res = parse_score_reply(raw, &rubric()).expect("parsed");
    assert_eq!(res.overall_score, 3.2);
  }

  #[test]
  fn weights_are_normalized_by_their_total() {
    let mut r = rubric();
    for c in &mut r.criteria {
      c.weight *= 4.0;
    }
    let scores: BTreeMap<String, f64> =
      [("ideas", 4.0), ("organization", 2.0), ("conventions", 3.0)].into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    assert_eq!(weighted_overall(&r, &scores), 3.2);
  }

  #[test]
  fn missing_criterion_is_an_error() {
    let raw = r#"{"scores": {"ideas": 3}}"#;
    assert_eq!(parse_score_reply(raw, &rubric()), Err(ScoringError::MissingCriterion("organization".into())));
  }

  #[test]
  fn non_json_reply_is_malformed() {
    assert!(matches!(parse_score_reply("I think it's a 3.", &rubric()), Err(ScoringError::MalformedReply(_))));
  }

  #[test]
  fn growth_falls_back_to_weakest_criterion_stem() {
    let raw = r#"{"scores": {"ideas": 4, "organization": 1, "conventions": 3}}"#;
    let res = parse_score_reply(raw, &rubric()).expect("parsed");
    assert_eq!(res.feedback.growth_area, "Try adding more organization.");
  }

  #[test]
  fn two_placement_prompts_fail_deterministically() {
    let raw = r#"[{"type": "narrative", "prompt": "Tell about a surprise."}, {"type": "descriptive", "prompt": "Describe your room."}]"#;
    for _ in 0..3 {
      assert_eq!(
        parse_placement_prompts(raw),
        Err(ScoringError::PlacementPromptCount { expected: 3, got: 2 })
      );
    }
  }

  #[test]
  fn placement_accepts_strings_wrapped_lists_and_reorders_by_type() {
    let bare = r#"["A story", "A place", "An opinion"]"#;
    let p = parse_placement_prompts(bare).expect("bare");
    assert_eq!(p.iter().map(|x| x.prompt_type).collect::<Vec<_>>(), PLACEMENT_TYPES.to_vec());

    let wrapped = r#"{"prompts": [
      {"type": "persuasive", "prompt": "Convince me"},
      {"kind": "Narrative", "text": "Tell me"},
      {"type": "descriptive", "question": "Describe"}]}"#;
    let p = parse_placement_prompts(wrapped).expect("wrapped");
    assert_eq!(p[0].prompt, "Tell me");
    assert_eq!(p[2].prompt, "Convince me");
  }

  #[test]
  fn placement_with_duplicate_types_is_rejected() {
    let raw = r#"[{"type": "narrative", "prompt": "a"}, {"type": "narrative", "prompt": "b"}, {"type": "persuasive", "prompt": "c"}]"#;
    assert!(matches!(parse_placement_prompts(raw), Err(ScoringError::MalformedReply(_))));
  }

  #[test]
  fn tier_thresholds() {
    assert_eq!(recommend_tier(&[]).get(), 1);
    assert_eq!(recommend_tier(&[0.2, 0.4, 0.5]).get(), 1);
    assert_eq!(recommend_tier(&[0.5, 0.6, 0.7]).get(), 2);
    assert_eq!(recommend_tier(&[0.75, 0.8, 0.9]).get(), 3);
  }

  #[test]
  fn parent_override_keeps_recommendation() {
    let mut a = TierAssignment::from_placement("kid", vec![0.9, 0.9, 0.9], Utc::now());
    assert_eq!(a.effective_tier().map(Tier::get), Some(3));
    a.assign(Tier::try_from(1u8).expect("tier"), Utc::now());
    assert_eq!(a.recommended_tier.map(Tier::get), Some(3));
    assert_eq!(a.effective_tier().map(Tier::get), Some(1));
  }

  #[test]
  fn unplaced_child_has_no_recommendation() {
    let mut a = TierAssignment::unplaced("kid", Utc::now());
    assert_eq!(a.effective_tier(), None);
    a.assign(Tier::try_from(2u8).expect("tier"), Utc::now());
    assert_eq!(a.recommended_tier, None);
    assert!(a.placement_scores.is_empty());
    assert_eq!(a.effective_tier().map(Tier::get), Some(2));
  }

  #[tokio::test]
  async fn score_submission_goes_through_the_generator() {
    let mock = Arc::new(MockGenerator::new(vec![MockReply::text(
      r#"{"scores": {"ideas": 3, "organization": 3, "conventions": 3}, "overallScore": 3}"#,
    )]));
    let (res, generation) = score_submission(&*mock, &Prompts::default(), "text", &rubric()).await.expect("scored");
    assert_eq!(res.overall_score, 3.0);
    assert_eq!(generation.model, "mock-model");
    assert_eq!(mock.call_count(), 1);
  }

  #[tokio::test]
  async fn placement_scoring_skips_invalid_responses() {
    let mock = Arc::new(MockGenerator::new(vec![MockReply::text(
      r#"{"scores": {"ideas": 2, "organization": 2, "conventions": 2}}"#,
    )]));
    let good = "the little brown fox jumped over a sleepy dog near the old red barn today ".repeat(2);
    let responses = vec!["too short".to_string(), good, "zzz".to_string()];
    let scores = score_placement(&*mock, &Prompts::default(), &rubric(), &responses).await.expect("scored");
    assert_eq!(scores, vec![0.0, 0.5, 0.0]);
    assert_eq!(mock.call_count(), 1);
  }
}
