//! Reference catalog: lessons and rubrics.
//!
//! Built-in entries guarantee the app is usable without any config file.
//! Config-provided lessons and rubrics are loaded first; built-ins never
//! overwrite an id the config already defines. The catalog is immutable
//! after startup.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::domain::{Criterion, Lesson, LessonType, Rubric, Tier};

/// Rubric used to score placement responses.
pub const PLACEMENT_RUBRIC_ID: &str = "placement";

const LEVELS: [&str; 4] = ["Beginning", "Developing", "Proficient", "Advanced"];

fn criterion(name: &str, display_name: &str, weight: f64, stems: &[&str]) -> Criterion {
  Criterion {
    name: name.into(),
    display_name: display_name.into(),
    weight,
    levels: LEVELS.iter().map(|l| l.to_string()).collect(),
    feedback_stems: stems.iter().map(|s| s.to_string()).collect(),
  }
}

fn conventions(weight: f64) -> Criterion {
  criterion(
    "conventions",
    "Spelling & Punctuation",
    weight,
    &["Read it out loud and check that each sentence ends with a period, question mark, or exclamation point."],
  )
}

pub fn builtin_rubrics() -> Vec<Rubric> {
  vec![
    Rubric {
      id: "narrative".into(),
      description: "A personal or imagined story with a beginning, middle, and end.".into(),
      word_range: [50, 200],
      criteria: vec![
        criterion("ideas", "Story Ideas", 0.3, &["Add one detail that shows how your character felt."]),
        criterion("organization", "Beginning, Middle, End", 0.3, &["Try a time word like \"then\" or \"after that\" to move your story along."]),
        criterion("word_choice", "Word Choice", 0.2, &["Swap one plain word for a more exciting one."]),
        conventions(0.2),
      ],
    },
    Rubric {
      id: "persuasive".into(),
      description: "An opinion piece that states a claim and backs it with reasons.".into(),
      word_range: [60, 220],
      criteria: vec![
        criterion("claim", "Clear Opinion", 0.3, &["Say your opinion in the very first sentence."]),
        criterion("reasons", "Reasons & Examples", 0.4, &["Give one more reason, and use \"because\" to explain it."]),
        criterion("organization", "Organization", 0.1, &["End by saying your opinion again in new words."]),
        conventions(0.2),
      ],
    },
    Rubric {
      id: "expository".into(),
      description: "An informational piece that teaches the reader about a topic.".into(),
      word_range: [60, 220],
      criteria: vec![
        criterion("focus", "Topic Focus", 0.3, &["Keep every sentence about your main topic."]),
        criterion("facts", "Facts & Details", 0.4, &["Add one fact or example that teaches the reader something new."]),
        criterion("organization", "Organization", 0.1, &["Group sentences about the same idea together."]),
        conventions(0.2),
      ],
    },
    Rubric {
      id: "descriptive".into(),
      description: "A piece that paints a picture of a person, place, or thing.".into(),
      word_range: [40, 180],
      criteria: vec![
        criterion("senses", "Sensory Details", 0.4, &["Tell what you could hear, smell, or touch, not just what you see."]),
        criterion("word_choice", "Word Choice", 0.3, &["Use an adjective that makes the reader picture it exactly."]),
        criterion("organization", "Organization", 0.1, &["Describe things in order, like top to bottom or near to far."]),
        conventions(0.2),
      ],
    },
    Rubric {
      id: PLACEMENT_RUBRIC_ID.into(),
      description: "A short placement response. Judge overall writing fluency for the child's age.".into(),
      word_range: [20, 150],
      criteria: vec![
        criterion("ideas", "Ideas", 0.4, &["Add one more detail."]),
        criterion("organization", "Organization", 0.3, &["Put your sentences in an order that makes sense."]),
        conventions(0.3),
      ],
    },
  ]
}

fn lesson(id: &str, title: &str, unit: &str, lesson_type: LessonType, tier: u8, objectives: &[&str]) -> Lesson {
  Lesson {
    id: id.into(),
    title: title.into(),
    unit: unit.into(),
    lesson_type,
    tier: Tier::try_from(tier).unwrap_or_default(),
    learning_objectives: objectives.iter().map(|s| s.to_string()).collect(),
    rubric_id: Some(lesson_type.as_str().to_string()),
  }
}

pub fn builtin_lessons() -> Vec<Lesson> {
  vec![
    lesson("narr-magic-door", "The Magic Door", "Stories", LessonType::Narrative, 1, &[
      "Write a story with a beginning, middle, and end",
      "Use time words to show order",
    ]),
    lesson("narr-strong-hooks", "Hook Your Reader", "Stories", LessonType::Narrative, 2, &[
      "Open a story with an action, a sound, or a question",
      "Show feelings through what characters do",
    ]),
    lesson("desc-five-senses", "Five Senses Snapshot", "Painting With Words", LessonType::Descriptive, 1, &[
      "Use details from at least three senses",
      "Choose precise adjectives",
    ]),
    lesson("pers-best-pet", "The Best Class Pet", "Speak Your Mind", LessonType::Persuasive, 2, &[
      "State a clear opinion",
      "Support it with two reasons",
      "Finish with a strong conclusion",
    ]),
    lesson("expo-animal-expert", "Animal Expert", "Teach Someone", LessonType::Expository, 3, &[
      "Introduce a topic clearly",
      "Group related facts into paragraphs",
      "Use linking words like also and another",
    ]),
  ]
}

/// Lessons and rubrics by id. Ordered maps keep listings stable.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
  lessons: BTreeMap<String, Lesson>,
  rubrics: BTreeMap<String, Rubric>,
}

impl Catalog {
  /// Merge configured entries with the built-ins. Config wins on id clashes.
  pub fn new(config_lessons: Vec<Lesson>, config_rubrics: Vec<Rubric>) -> Self {
    let mut catalog = Catalog::default();
    let from_config = (config_lessons.len(), config_rubrics.len());

    for r in &config_rubrics {
      let total: f64 = r.criteria.iter().map(|c| c.weight).sum();
      if !r.criteria.is_empty() && (total - 1.0).abs() > 1e-6 {
        warn!(target: "writing_coach", rubric = %r.id, total, "Rubric weights do not sum to 1; overall score uses their share of the total");
      }
    }
    for r in config_rubrics.into_iter().chain(builtin_rubrics()) {
      if r.criteria.is_empty() {
        warn!(target: "writing_coach", rubric = %r.id, "Skipping rubric with no criteria");
        continue;
      }
      catalog.rubrics.entry(r.id.clone()).or_insert(r);
    }
    for l in config_lessons.into_iter().chain(builtin_lessons()) {
      if let Some(rid) = l.rubric_id.as_deref().filter(|rid| !catalog.rubrics.contains_key(*rid)) {
        warn!(target: "writing_coach", lesson = %l.id, rubric = %rid, "Lesson references an unknown rubric");
      }
      catalog.lessons.entry(l.id.clone()).or_insert(l);
    }

    info!(
      target: "writing_coach",
      lessons = catalog.lessons.len(),
      rubrics = catalog.rubrics.len(),
      config_lessons = from_config.0,
      config_rubrics = from_config.1,
      "Catalog loaded"
    );
    catalog
  }

  pub fn builtin() -> Self { Self::new(Vec::new(), Vec::new()) }

  pub fn get_lesson_by_id(&self, id: &str) -> Option<&Lesson> { self.lessons.get(id) }

  pub fn get_rubric_by_id(&self, id: &str) -> Option<&Rubric> { self.rubrics.get(id) }

  /// Rubric attached to a lesson, if any.
  pub fn rubric_for(&self, lesson: &Lesson) -> Option<&Rubric> {
    lesson.rubric_id.as_deref().and_then(|id| self.get_rubric_by_id(id))
  }

  pub fn lessons(&self) -> impl Iterator<Item = &Lesson> { self.lessons.values() }
}
