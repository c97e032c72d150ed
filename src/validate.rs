//! Local gate for free-text writing submissions.
//!
//! Runs before any scoring call so trivially invalid text never costs a model
//! round-trip, and so the child gets immediate, deterministic feedback.

use serde::Serialize;

use crate::domain::Rubric;

/// Floor applied regardless of rubric.
pub const MIN_WORDS_FLOOR: usize = 10;
/// Share of tokens that must contain a vowel (`[aeiouy]`).
pub const MIN_VOWEL_WORD_RATIO: f64 = 0.4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
  TooShort,
  Gibberish,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValidationResult {
  Valid { word_count: usize },
  Invalid { error: ValidationErrorKind, message: String, word_count: usize, min_words: usize },
}

impl ValidationResult {
  pub fn is_valid(&self) -> bool { matches!(self, ValidationResult::Valid { .. }) }

  pub fn word_count(&self) -> usize {
    match self {
      ValidationResult::Valid { word_count } | ValidationResult::Invalid { word_count, .. } => *word_count,
    }
  }
}

/// `max(10, floor(word_range[0] / 2))` with a rubric, otherwise 10.
pub fn min_words_for(rubric: Option<&Rubric>) -> usize {
  match rubric {
    Some(r) => MIN_WORDS_FLOOR.max((r.word_range[0] / 2) as usize),
    None => MIN_WORDS_FLOOR,
  }
}

pub fn words(text: &str) -> Vec<&str> {
  text.split_whitespace().collect()
}

fn has_vowel(word: &str) -> bool {
  word.chars().any(|c| matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u' | 'y'))
}

pub fn validate_submission(text: &str, rubric: Option<&Rubric>) -> ValidationResult {
  let tokens = words(text);
  let word_count = tokens.len();
  let min_words = min_words_for(rubric);

  if word_count < min_words {
    return ValidationResult::Invalid {
      error: ValidationErrorKind::TooShort,
      message: format!(
        "Your writing needs at least {min_words} words. You have {word_count} so far. Keep going, you can do it!"
      ),
      word_count,
      min_words,
    };
  }

  let with_vowel = tokens.iter().filter(|w| has_vowel(w)).count();
  let ratio = with_vowel as f64 / word_count as f64;
  if ratio < MIN_VOWEL_WORD_RATIO {
    return ValidationResult::Invalid {
      error: ValidationErrorKind::Gibberish,
      message: "Hmm, some of those words don't look like real words. Try writing real sentences so I can read your ideas!".into(),
      word_count,
      min_words,
    };
  }

  ValidationResult::Valid { word_count }
}
