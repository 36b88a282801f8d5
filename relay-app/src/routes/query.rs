use crate::bridge::BridgeError;
use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct QueryRequest {
    #[serde(default)]
    query: Option<String>,
    #[serde(default, rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    response: String,
    message_limit_reached: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/query", post(query))
}

#[tracing::instrument(level = "info", skip_all)]
async fn query(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user_input = req.query.as_deref().unwrap_or("").trim().to_string();
    let session_id = req.session_id.as_deref().unwrap_or("").trim().to_string();
    if user_input.is_empty() || session_id.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "query and sessionId are required",
        ));
    }

    match state.bridge.submit(&session_id, &user_input).await {
        Ok(reply) => Ok(Json(QueryResponse {
            response: reply.message.content,
            message_limit_reached: reply.limit_reached,
        })),
        Err(e @ BridgeError::Timeout(_)) => {
            Err(error_response(StatusCode::GATEWAY_TIMEOUT, &e.to_string()))
        }
        Err(e @ BridgeError::Busy(_)) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &e.to_string(),
        )),
        Err(e @ BridgeError::Upstream(_)) => {
            Err(error_response(StatusCode::BAD_GATEWAY, &e.to_string()))
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}
