//! Application state: config, reference catalog, session store, generator, telemetry.
//!
//! This module owns:
//!   - the prompts and session policy (from TOML or defaults)
//!   - the immutable lesson/rubric catalog
//!   - the in-memory session store
//!   - the optional generator (OpenAI wrapped in retry + timeout)
//!   - the interaction-event sender
//!
//! Without OPENAI_API_KEY the service still answers validation, catalog and
//! session reads; anything that needs the model returns a retryable 503.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::catalog::Catalog;
use crate::config::{load_coach_config_from_env, CoachConfig, Policy, Prompts};
use crate::domain::{Lesson, Tier};
use crate::error::CoachError;
use crate::generator::{Generator, GeneratorError, OpenAI, RetryConfig, RetryingGenerator};
use crate::session::{Session, SessionError};
use crate::store::SessionStore;
use crate::telemetry::Telemetry;

pub struct AppState {
    pub prompts: Prompts,
    pub policy: Policy,
    pub catalog: Arc<Catalog>,
    pub store: SessionStore,
    pub generator: Option<Arc<dyn Generator>>,
    pub telemetry: Telemetry,
}

impl AppState {
    /// Build state from env: load config, merge the catalog, init OpenAI, start telemetry.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let cfg = load_coach_config_from_env().unwrap_or_default();
        let telemetry = Telemetry::spawn(cfg.policy.telemetry_buffer);

        let generator: Option<Arc<dyn Generator>> = match OpenAI::from_env(cfg.policy.generator_timeout()) {
            Some(oa) => {
                info!(target: "writing_coach", base_url = %oa.base_url, coach_model = %oa.coach_model, grader_model = %oa.grader_model, "OpenAI enabled.");
                let retry = RetryConfig {
                    max_retries: cfg.policy.generator_max_retries,
                    attempt_timeout: cfg.policy.generator_timeout(),
                    base_delay: cfg.policy.generator_base_delay(),
                    ..RetryConfig::default()
                };
                Some(Arc::new(RetryingGenerator::new(Arc::new(oa), retry)))
            }
            None => {
                warn!(target: "writing_coach", "OpenAI disabled (no OPENAI_API_KEY). Coaching and scoring will return 503.");
                None
            }
        };

        Self::from_parts(cfg, generator, telemetry)
    }

    pub fn from_parts(cfg: CoachConfig, generator: Option<Arc<dyn Generator>>, telemetry: Telemetry) -> Self {
        let catalog = Arc::new(Catalog::new(cfg.lessons, cfg.rubrics));
        info!(
            target: "writing_coach",
            max_guided_attempts = cfg.policy.max_guided_attempts,
            max_instruction_turns = cfg.policy.max_instruction_turns,
            "Session policy"
        );
        Self {
            prompts: cfg.prompts,
            policy: cfg.policy,
            catalog,
            store: SessionStore::new(),
            generator,
            telemetry,
        }
    }

    pub fn generator(&self) -> Result<&dyn Generator, CoachError> {
        self.generator
            .as_deref()
            .ok_or_else(|| GeneratorError::Unavailable("no generator configured".into()).into())
    }

    pub fn lesson(&self, lesson_id: &str) -> Result<&Lesson, CoachError> {
        self.catalog
            .get_lesson_by_id(lesson_id)
            .ok_or_else(|| CoachError::LessonNotFound(lesson_id.to_string()))
    }

    pub async fn session(&self, session_id: &str) -> Result<Session, CoachError> {
        self.store
            .get(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()).into())
    }

    /// Tier for a new session: explicit request, then the child's assignment, then the lesson's own tier.
    #[instrument(level = "debug", skip(self, lesson), fields(lesson_id = %lesson.id))]
    pub async fn resolve_tier(&self, child_id: &str, requested: Option<Tier>, lesson: &Lesson) -> Tier {
        if let Some(t) = requested {
            return t;
        }
        self.store
            .tier_assignment(child_id)
            .await
            .and_then(|a| a.effective_tier())
            .unwrap_or(lesson.tier)
    }
}

#[cfg(test)]
impl AppState {
    /// State with built-in catalog, default policy and the given generator.
    pub fn for_tests(generator: Option<Arc<dyn Generator>>) -> Self {
        let (telemetry, _rx) = Telemetry::channel(16);
        Self::from_parts(CoachConfig::default(), generator, telemetry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_generator_is_unavailable() {
        let state = AppState::for_tests(None);
        match state.generator() {
            Err(CoachError::Generator(GeneratorError::Unavailable(_))) => {}
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected no generator"),
        }
    }

    #[tokio::test]
    async fn tier_resolution_order() {
        let state = AppState::for_tests(None);
        let lesson = state.lesson("pers-best-pet").expect("lesson").clone();
        assert_eq!(state.resolve_tier("kid", None, &lesson).await.get(), 2);

        let now = chrono::Utc::now();
        state.store.set_recommended("kid", vec![0.1, 0.2, 0.1], now).await;
        assert_eq!(state.resolve_tier("kid", None, &lesson).await.get(), 1);

        let three = Tier::try_from(3u8).expect("tier");
        assert_eq!(state.resolve_tier("kid", Some(three), &lesson).await, three);
        assert!(matches!(state.lesson("nope"), Err(CoachError::LessonNotFound(_))));
    }
}
