//! Router assembly: HTTP endpoints, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;

/// Build the application router with:
/// - REST-ish API under `/api/v1/...`
/// - CORS (allow any origin/method/headers), adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::http_health))
        .route("/api/v1/lessons", get(http::http_list_lessons))
        .route("/api/v1/lessons/:lesson_id/start", post(http::http_start_lesson))
        .route("/api/v1/sessions/:session_id", get(http::http_get_session))
        .route("/api/v1/sessions/:session_id/message", post(http::http_post_message))
        .route("/api/v1/sessions/:session_id/submit", post(http::http_post_submit))
        .route("/api/v1/validate", post(http::http_post_validate))
        .route("/api/v1/placement/start", post(http::http_start_placement))
        .route("/api/v1/placement/:placement_id/submit", post(http::http_submit_placement))
        .route("/api/v1/children/:child_id/tier", put(http::http_put_tier))
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::generator::mock::{MockGenerator, MockReply};
    use crate::generator::Generator;

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_and_validate() {
        let app = build_router(Arc::new(AppState::for_tests(None)));
        let (status, body) = call(app.clone(), "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true, "generator": false}));

        let (status, body) = call(
            app.clone(),
            "POST",
            "/api/v1/validate",
            Some(json!({"text": "The cat sat.", "rubricId": "narrative"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], json!(false));
        assert_eq!(body["minWords"], json!(25));
        assert_eq!(body["wordCount"], json!(3));

        let (status, _) = call(app, "POST", "/api/v1/validate", Some(json!({"text": "x", "rubricId": "nope"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_without_generator_is_503() {
        let app = build_router(Arc::new(AppState::for_tests(None)));
        let (status, body) =
            call(app, "POST", "/api/v1/lessons/narr-magic-door/start", Some(json!({"childId": "kid"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retryable"], json!(false));
    }

    #[tokio::test]
    async fn lesson_start_then_message_over_http() {
        let generator: Arc<dyn Generator> = Arc::new(MockGenerator::new(vec![
            MockReply::text("[STEP: 1] Welcome!"),
            MockReply::text("[STEP: 2] Nice thinking! [HINT_GIVEN]"),
        ]));
        let app = build_router(Arc::new(AppState::for_tests(Some(generator))));

        let (status, body) =
            call(app.clone(), "POST", "/api/v1/lessons/narr-magic-door/start", Some(json!({"childId": "kid"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resumed"], json!(false));
        assert_eq!(body["session"]["lastCoachMessage"], json!("[STEP: 1] Welcome!"));
        let sid = body["session"]["id"].as_str().expect("id").to_string();

        let (status, body) = call(
            app.clone(),
            "POST",
            &format!("/api/v1/sessions/{sid}/message"),
            Some(json!({"text": "I like dragons"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], json!("[STEP: 2] Nice thinking!"));
        assert_eq!(body["session"]["phaseState"]["phase1Step"], json!(2));
        assert_eq!(body["session"]["phaseState"]["hintsGiven"], json!(1));

        let (status, body) =
            call(app.clone(), "POST", &format!("/api/v1/sessions/{sid}/submit"), Some(json!({"text": "hi"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("wrong_phase"));

        let (status, _) = call(app, "GET", "/api/v1/sessions/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tier_override_rejects_out_of_range() {
        let app = build_router(Arc::new(AppState::for_tests(None)));
        let (status, body) = call(app.clone(), "PUT", "/api/v1/children/kid/tier", Some(json!({"tier": 3}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["effectiveTier"], json!(3));
        assert_eq!(body["assignedTier"], json!(3));
        assert_eq!(body["recommendedTier"], Value::Null);
        assert_eq!(body["placementScores"], json!([]));

        let (status, _) = call(app, "PUT", "/api/v1/children/kid/tier", Some(json!({"tier": 9}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
