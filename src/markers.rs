//! Inline control markers riding inside coach replies.
//!
//! The coach model answers in free text and annotates it with bracketed markers
//! such as `[STEP: 2]`, `[HINT_GIVEN]` or `[OPTIONS: "a" | "b"]`. This module
//! tokenizes those markers into typed tokens, then derives two things from the
//! token stream:
//!
//! - the display text shown to the child (every control marker removed except
//!   `[STEP: N]`, which doubles as a progress indicator and is kept verbatim);
//! - a `Signals` set consumed by the session state machine.
//!
//! Adding a marker kind means adding a `MarkerKind` variant and its name; the
//! stripping code never looks at names.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::domain::{AnswerMeta, AnswerType, Phase};

/// Single-line marker: `[NAME]` or `[NAME: payload]`, any case, loose spacing.
static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?i)\[\s*([a-z][a-z0-9_]*)\s*(?::\s*([^\[\]\r\n]*?))?\s*\]").expect("marker regex")
});

/// Opening of a `[PASSAGE: ...]` marker. The body is scanned by hand since it
/// may span lines and contain brackets of its own.
static PASSAGE_OPEN_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?i)\[\s*passage\s*:\s*").expect("passage regex"));

/// A quote directly followed by the closing bracket.
static PASSAGE_CLOSE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""\s*\]"#).expect("passage close regex"));

static BLANK_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank-run regex"));

/// Highest `[STEP: N]` value of the instruction phase.
pub const MAX_STEP: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerKind {
  AnswerType,
  Options,
  Passage,
  Step,
  ComprehensionCheck,
  HintGiven,
  PhaseTransition,
  /// Any other backend-only marker; stripped, never interpreted.
  Other,
}

impl MarkerKind {
  fn from_name(name: &str) -> Option<MarkerKind> {
    let kind = match name.to_ascii_uppercase().as_str() {
      "ANSWER_TYPE" => MarkerKind::AnswerType,
      "OPTIONS" => MarkerKind::Options,
      "PASSAGE" => MarkerKind::Passage,
      "STEP" => MarkerKind::Step,
      "COMPREHENSION_CHECK" => MarkerKind::ComprehensionCheck,
      "HINT_GIVEN" => MarkerKind::HintGiven,
      "PHASE_TRANSITION" => MarkerKind::PhaseTransition,
      _ => return None,
    };
    Some(kind)
  }

  /// Markers that are also part of what the child sees.
  pub fn is_display(self) -> bool { matches!(self, MarkerKind::Step) }
}

/// One marker occurrence with its byte span in the raw text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkerToken<'a> {
  pub kind: MarkerKind,
  pub name: &'a str,
  pub payload: Option<&'a str>,
  pub span: Range<usize>,
}

/// A marker that was recognized but could not be interpreted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarkerParseError {
  #[error("unknown answer type {0:?}")]
  UnknownAnswerType(String),
  #[error("step value {0:?} is not a number between 1 and 5")]
  BadStep(String),
  #[error("comprehension check value {0:?} is neither passed nor failed")]
  BadComprehension(String),
  #[error("unknown phase {0:?}")]
  UnknownPhase(String),
  #[error("marker {0} requires a payload")]
  MissingPayload(&'static str),
  #[error("passage payload is not quoted: {0:?}")]
  UnquotedPassage(String),
  #[error("passage quote is never closed: {0:?}")]
  UnterminatedPassage(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComprehensionCheck {
  Passed,
  Failed,
}

/// Machine-actionable signals carried by one coach reply.
/// For every kind only the first well-formed occurrence counts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Signals {
  pub answer_type: Option<AnswerType>,
  pub options: Option<Vec<String>>,
  pub passage: Option<String>,
  pub step: Option<u8>,
  pub comprehension: Option<ComprehensionCheck>,
  pub hint_given: bool,
  pub phase_transition: Option<Phase>,
}

impl Signals {
  /// Interactive-answer widget, present only when an answer type was given.
  pub fn answer_meta(&self) -> Option<AnswerMeta> {
    self.answer_type.map(|answer_type| AnswerMeta {
      answer_type,
      options: self.options.clone(),
      passage: self.passage.clone(),
    })
  }
}

/// Result of decoding one raw coach reply.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedReply {
  pub display_text: String,
  pub signals: Signals,
}

/// Tokenize, strip and extract in one pass over the token stream.
pub fn decode(raw: &str) -> DecodedReply {
  let tokens = tokenize(raw);
  DecodedReply { display_text: strip_tokens(raw, &tokens), signals: signals_from_tokens(&tokens) }
}

pub fn strip_markers(raw: &str) -> String {
  strip_tokens(raw, &tokenize(raw))
}

pub fn extract_signals(raw: &str) -> Signals {
  signals_from_tokens(&tokenize(raw))
}

/// All recognized markers in order of appearance.
pub fn tokenize(raw: &str) -> Vec<MarkerToken<'_>> {
  let mut tokens = passage_tokens(raw);

  let passages: Vec<Range<usize>> = tokens.iter().map(|t| t.span.clone()).collect();
  let overlaps_passage = |r: &Range<usize>| passages.iter().any(|p| r.start < p.end && p.start < r.end);

  for caps in MARKER_RE.captures_iter(raw) {
    let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else { continue };
    if overlaps_passage(&whole.range()) {
      continue;
    }
    let payload = caps.get(2).map(|m| m.as_str());
    let kind = match MarkerKind::from_name(name.as_str()) {
      Some(kind) => kind,
      None if is_backend_marker_name(name.as_str(), payload.is_some()) => MarkerKind::Other,
      None => continue,
    };
    tokens.push(MarkerToken { kind, name: name.as_str(), payload, span: whole.range() });
  }

  tokens.sort_by_key(|t| t.span.start);
  tokens
}

/// `[PASSAGE: "..."]` markers. A quoted body runs to the first `"` that is
/// directly followed by `]`, so brackets and newlines inside it are kept.
/// Without such a close the marker still ends at the next `]` (or the end of
/// its line) so it never reaches the child; the payload then fails to parse.
fn passage_tokens(raw: &str) -> Vec<MarkerToken<'_>> {
  let mut tokens = Vec::new();
  let mut from = 0;
  while let Some(open) = PASSAGE_OPEN_RE.find_at(raw, from) {
    let body_start = open.end();
    let rest = &raw[body_start..];
    let close = rest.strip_prefix('"').and_then(|body| PASSAGE_CLOSE_RE.find(body));
    let (payload, end) = match (close, rest.find(']')) {
      // payload keeps the enclosing quotes, the same shape single-line markers have
      (Some(close), _) => (&rest[..close.start() + 2], body_start + 1 + close.end()),
      (None, Some(bracket)) => (&rest[..bracket], body_start + bracket + 1),
      (None, None) => {
        let line = rest.find('\n').unwrap_or(rest.len());
        (&rest[..line], body_start + line)
      }
    };
    tokens.push(MarkerToken {
      kind: MarkerKind::Passage,
      name: "PASSAGE",
      payload: Some(payload.trim_end()),
      span: open.start()..end,
    });
    from = end;
  }
  tokens
}

/// Unknown bracketed words count as markers only when written like one:
/// upper-case identifier with an underscore, or upper-case name with a payload.
fn is_backend_marker_name(name: &str, has_payload: bool) -> bool {
  name.len() >= 2
    && name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    && (name.contains('_') || has_payload)
}

fn strip_tokens(raw: &str, tokens: &[MarkerToken<'_>]) -> String {
  let mut out = String::with_capacity(raw.len());
  let mut cursor = 0usize;

  for token in tokens.iter().filter(|t| !t.kind.is_display()) {
    out.push_str(&raw[cursor..token.span.start]);
    cursor = token.span.end;
    // do not leave a doubled space or a line-leading gap where the marker was
    if out.is_empty() || out.ends_with(|c: char| c == '\n' || is_blank(c)) {
      let rest = &raw[cursor..];
      cursor += rest.len() - rest.trim_start_matches(is_blank).len();
    }
  }
  out.push_str(&raw[cursor..]);

  let trimmed_lines: Vec<&str> = out.lines().map(str::trim_end).collect();
  let joined = trimmed_lines.join("\n");
  BLANK_RUN_RE.replace_all(&joined, "\n\n").trim().to_string()
}

fn is_blank(c: char) -> bool { c == ' ' || c == '\t' }

fn signals_from_tokens(tokens: &[MarkerToken<'_>]) -> Signals {
  let mut signals = Signals::default();

  for token in tokens {
    let outcome = match token.kind {
      MarkerKind::AnswerType if signals.answer_type.is_none() => {
        parse_answer_type(token).map(|v| signals.answer_type = Some(v))
      }
      MarkerKind::Options if signals.options.is_none() => {
        parse_options(token).map(|v| signals.options = Some(v))
      }
      MarkerKind::Passage if signals.passage.is_none() => {
        parse_passage(token).map(|v| signals.passage = Some(v))
      }
      MarkerKind::Step if signals.step.is_none() => parse_step(token).map(|v| signals.step = Some(v)),
      MarkerKind::ComprehensionCheck if signals.comprehension.is_none() => {
        parse_comprehension(token).map(|v| signals.comprehension = Some(v))
      }
      MarkerKind::HintGiven => {
        signals.hint_given = true;
        Ok(())
      }
      MarkerKind::PhaseTransition if signals.phase_transition.is_none() => {
        parse_phase(token).map(|v| signals.phase_transition = Some(v))
      }
      MarkerKind::Other => {
        debug!(target: "markers", name = token.name, "Stripped backend-only marker");
        Ok(())
      }
      // later duplicates are display-stripped only
      _ => Ok(()),
    };

    if let Err(e) = outcome {
      warn!(target: "markers", name = token.name, error = %e, "Malformed marker treated as absent");
    }
  }

  signals
}

fn payload<'a>(token: &MarkerToken<'a>, marker: &'static str) -> Result<&'a str, MarkerParseError> {
  match token.payload.map(str::trim) {
    Some(p) if !p.is_empty() => Ok(p),
    _ => Err(MarkerParseError::MissingPayload(marker)),
  }
}

fn parse_answer_type(token: &MarkerToken<'_>) -> Result<AnswerType, MarkerParseError> {
  let p = payload(token, "ANSWER_TYPE")?;
  AnswerType::parse(unquote(p)).ok_or_else(|| MarkerParseError::UnknownAnswerType(p.to_string()))
}

fn parse_options(token: &MarkerToken<'_>) -> Result<Vec<String>, MarkerParseError> {
  let p = payload(token, "OPTIONS")?;
  Ok(p.split('|').map(|seg| unquote(seg.trim()).to_string()).filter(|s| !s.is_empty()).collect())
}

fn parse_passage(token: &MarkerToken<'_>) -> Result<String, MarkerParseError> {
  let p = payload(token, "PASSAGE")?;
  if !p.starts_with('"') {
    return Err(MarkerParseError::UnquotedPassage(p.to_string()));
  }
  if p.len() < 2 || !p.ends_with('"') {
    return Err(MarkerParseError::UnterminatedPassage(p.to_string()));
  }
  let inner = &p[1..p.len() - 1];
  // triple-quoted form: """text"""
  let inner = match inner.strip_prefix("\"\"").and_then(|s| s.strip_suffix("\"\"")) {
    Some(tripled) => tripled,
    None => inner,
  };
  Ok(inner.to_string())
}

fn parse_step(token: &MarkerToken<'_>) -> Result<u8, MarkerParseError> {
  let p = payload(token, "STEP")?;
  match p.parse::<u8>() {
    Ok(n) if (1..=MAX_STEP).contains(&n) => Ok(n),
    _ => Err(MarkerParseError::BadStep(p.to_string())),
  }
}

fn parse_comprehension(token: &MarkerToken<'_>) -> Result<ComprehensionCheck, MarkerParseError> {
  let p = payload(token, "COMPREHENSION_CHECK")?;
  match unquote(p).to_ascii_lowercase().as_str() {
    "passed" | "pass" => Ok(ComprehensionCheck::Passed),
    "failed" | "fail" => Ok(ComprehensionCheck::Failed),
    _ => Err(MarkerParseError::BadComprehension(p.to_string())),
  }
}

fn parse_phase(token: &MarkerToken<'_>) -> Result<Phase, MarkerParseError> {
  let p = payload(token, "PHASE_TRANSITION")?;
  Phase::parse_loose(unquote(p)).ok_or_else(|| MarkerParseError::UnknownPhase(p.to_string()))
}

/// Strip one layer of surrounding double quotes.
fn unquote(s: &str) -> &str {
  s.strip_prefix('"').and_then(|x| x.strip_suffix('"')).unwrap_or(s)
}
