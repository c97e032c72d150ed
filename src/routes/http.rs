//! HTTP endpoint handlers. These are thin wrappers that forward to core logic.
//! Each handler is instrumented and logs ids and sizes, never learner text.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use tracing::{info, instrument};

use crate::error::CoachError;
use crate::logic;
use crate::protocol::*;
use crate::state::AppState;

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> Json<HealthOut> {
    Json(HealthOut { ok: true, generator: state.generator.is_some() })
}

#[instrument(level = "info", skip(state))]
pub async fn http_list_lessons(State(state): State<Arc<AppState>>) -> Json<LessonsOut> {
    Json(LessonsOut { lessons: state.catalog.lessons().cloned().collect() })
}

#[instrument(level = "info", skip(state, body), fields(%lesson_id, child_id = %body.child_id))]
pub async fn http_start_lesson(
    State(state): State<Arc<AppState>>,
    Path(lesson_id): Path<String>,
    Json(body): Json<StartLessonIn>,
) -> Result<Json<StartLessonOut>, CoachError> {
    let out = logic::start_lesson(&state, &body.child_id, &lesson_id, body.tier).await?;
    info!(target: "coach", session_id = %out.session.id, resumed = out.resumed, "HTTP lesson started");
    Ok(Json(StartLessonOut { resumed: out.resumed, session: out.session.into() }))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionOut>, CoachError> {
    Ok(Json(state.session(&session_id).await?.into()))
}

#[instrument(level = "info", skip(state, body), fields(%session_id, text_len = body.text.len()))]
pub async fn http_post_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(body): Json<MessageIn>,
) -> Result<Json<TurnOut>, CoachError> {
    let out = logic::take_turn(&state, &session_id, &body.text).await?;
    Ok(Json(TurnOut {
        reply: out.reply,
        phase: out.session.phase,
        answer: out.session.last_answer.clone(),
        transition: out.transition.map(Into::into),
        session: out.session.into(),
    }))
}

#[instrument(level = "info", skip(state, body), fields(%session_id, text_len = body.text.len()))]
pub async fn http_post_submit(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(body): Json<SubmitIn>,
) -> Result<Json<SubmitOut>, CoachError> {
    let out = logic::submit_writing(&state, &session_id, &body.text).await?;
    info!(target: "coach", %session_id, valid = out.validation.is_valid(), "HTTP submission handled");
    Ok(Json(SubmitOut {
        validation: ValidationOut::from(&out.validation),
        score: out.score,
        phase: out.session.phase,
        transition: out.transition.map(Into::into),
        session: out.session.into(),
    }))
}

#[instrument(level = "info", skip(state, body), fields(text_len = body.text.len(), rubric_id = ?body.rubric_id))]
pub async fn http_post_validate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ValidateIn>,
) -> Result<Json<ValidationOut>, CoachError> {
    let result = logic::validate_text(&state, &body.text, body.rubric_id.as_deref())?;
    Ok(Json(ValidationOut::from(&result)))
}

#[instrument(level = "info", skip(state, body), fields(child_id = %body.child_id))]
pub async fn http_start_placement(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PlacementStartIn>,
) -> Result<Json<PlacementStartOut>, CoachError> {
    let record = logic::start_placement(&state, &body.child_id).await?;
    Ok(Json(PlacementStartOut { placement_id: record.id, prompts: record.prompts }))
}

#[instrument(level = "info", skip(state, body), fields(%placement_id, responses = body.responses.len()))]
pub async fn http_submit_placement(
    State(state): State<Arc<AppState>>,
    Path(placement_id): Path<String>,
    Json(body): Json<PlacementSubmitIn>,
) -> Result<Json<TierOut>, CoachError> {
    let assignment = logic::submit_placement(&state, &placement_id, &body.responses).await?;
    Ok(Json(assignment.into()))
}

#[instrument(level = "info", skip(state, body), fields(%child_id, tier = %body.tier))]
pub async fn http_put_tier(
    State(state): State<Arc<AppState>>,
    Path(child_id): Path<String>,
    Json(body): Json<AssignTierIn>,
) -> Json<TierOut> {
    Json(logic::assign_tier(&state, &child_id, body.tier).await.into())
}
