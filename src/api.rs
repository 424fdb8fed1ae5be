pub mod chat;
pub mod course;
pub mod user;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tracing::error;
use utoipa::OpenApi;

use crate::error::Error;
use crate::teacher::Tutor;
use crate::teacher::relay::{RATE_LIMIT_MESSAGE, STREAM_FAILURE_MESSAGE};

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            Error::Llm(e) if e.is_rate_limited() => {
                (StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_MESSAGE.to_string())
            }
            Error::Llm(e) => {
                error!("upstream model failure: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    STREAM_FAILURE_MESSAGE.to_string(),
                )
            }
            Error::Database(_) | Error::Fatal(_) => {
                error!("internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

#[derive(OpenApi)]
#[openapi(
    info(title = "DevTutor", description = "Tutoring chat with module progress tracking"),
    paths(
        chat::chat,
        chat::fallback,
        chat::analyze_progress,
        chat::session_chat,
        chat::session_messages,
        chat::close_session,
        course::list_courses,
        course::create_course,
        course::update_course,
        user::create_user,
        user::list_users,
        user::get_user,
        user::delete_user,
        user::save_questionnaire,
        user::list_tools,
        user::store_tool,
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> anyhow::Result<String> {
    Ok(ApiDoc::openapi().to_pretty_json()?)
}

async fn openapi() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

/// All routes, with the API nested under `/api`.
pub fn router(tutor: Arc<Tutor>) -> Router {
    Router::new()
        .route("/api-docs/openapi.json", get(openapi))
        .nest(
            "/api",
            Router::new()
                .merge(chat::get_chat_scope())
                .merge(course::get_course_scope())
                .merge(user::get_user_scope()),
        )
        .with_state(tutor)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (Error::NotFound("course"), StatusCode::NOT_FOUND),
            (Error::BadRequest("bad".into()), StatusCode::BAD_REQUEST),
            (
                Error::Llm(LlmError::RateLimited("429".into())),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Error::Llm(LlmError::RequestFailed("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn serves_openapi_document() {
        let (app, _, _) = testing::app().await;
        let (status, doc) = testing::send_json(&app, "GET", "/api-docs/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(doc["paths"].get("/api/courses").is_some());
        assert!(doc["paths"].get("/api/analyze-progress").is_some());
        assert!(openapi_json().unwrap().contains("/api/session/chat"));
    }
}
