use crate::server::AppState;
use axum::extract::Path;
use axum::routing::{delete, get};
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/relay/sessions", get(list_sessions))
        .route("/api/v1/relay/sessions/{id}", delete(clear_session))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.store.list();
    Json(serde_json::json!({ "sessions": sessions }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn clear_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let cleared = state.store.clear(&id);
    Json(serde_json::json!({ "status": if cleared { "ok" } else { "not_found" } }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedBackend;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn listing_and_clearing_round_trip() {
        let state = AppState::for_tests(ScriptedBackend::replying(["hi"]));
        state.store.append_user_turn("s1", "hello");

        let app = router().layer(Extension(state.clone()));
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/relay/sessions")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["sessions"][0]["session_id"], "s1");
        assert_eq!(body["sessions"][0]["messages"], 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/v1/relay/sessions/s1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["status"], "ok");
        assert!(state.store.snapshot("s1").is_empty());

        // Clearing again reports not_found rather than erroring.
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/v1/relay/sessions/s1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["status"], "not_found");
    }
}
