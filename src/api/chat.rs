use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    response::{
        IntoResponse,
        sse::{Event, Sse},
    },
    routing::{delete, get, post},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use utoipa::{IntoParams, ToSchema};

use crate::ai_utils::{ChatTurn, CompletionRequest};
use crate::error::{Error, Result};
use crate::teacher::{
    SessionSnapshot, Tutor,
    messages::Turn,
    progress::ProgressVerdict,
    prompt::{InstructionContext, build_instruction},
    relay::{RATE_LIMIT_MESSAGE, RelayEvent, RelayOutcome, STREAM_FAILURE_MESSAGE, StreamRelay},
};
use crate::tool::Tool;
use crate::user::{UserProfile, personalization_fragments};

fn event_stream(
    rx: mpsc::Receiver<RelayEvent>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    Sse::new(ReceiverStream::new(rx).map(|event| Ok(Event::default().data(event.payload()))))
}

fn required_message(message: &str) -> Result<String> {
    let message = message.trim();
    if message.is_empty() {
        return Err(Error::BadRequest("Message is required".to_string()));
    }
    Ok(message.to_string())
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub user: Option<UserProfile>,
    /// The active tool as a single-element list.
    #[serde(default)]
    pub tools: Option<Vec<Tool>>,
    /// 1-based module being taught.
    #[serde(default)]
    pub current_module: Option<usize>,
    #[serde(default)]
    pub conversation_history: Vec<Turn>,
}

#[utoipa::path(
    context_path = "/api",
    path = "/chat",
    method(post),
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Stream of `data:` frames ending with `[DONE]` (text/event-stream)"),
        (status = 400, description = "Missing message"),
        (status = 429, description = "Upstream model is rate limited"),
        (status = 500, description = "Upstream model failure")
    )
)]
pub async fn chat(
    State(tutor): State<Arc<Tutor>>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse> {
    let message = required_message(&req.message)?;
    let personalization = match &req.user {
        Some(user) => {
            personalization_fragments(tutor.database(), &user.questionnaire_answers).await?
        }
        None => vec![],
    };
    let instruction = build_instruction(&InstructionContext {
        user: req.user.as_ref(),
        tool: req.tools.as_ref().and_then(|tools| tools.first()),
        module_number: req.current_module,
        history: &req.conversation_history,
        history_window: tutor.history_window(),
        personalization: &personalization,
    });
    let request = CompletionRequest {
        system: Some(instruction),
        messages: vec![ChatTurn::user(message)],
    };
    let stream = tutor.relay().open(request).await?;

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        if let RelayOutcome::Failed { error, .. } = StreamRelay::forward(stream, &tx, |_| {}).await {
            let message = if error.is_rate_limited() {
                RATE_LIMIT_MESSAGE
            } else {
                STREAM_FAILURE_MESSAGE
            };
            if tx.send(RelayEvent::Error(message.to_string())).await.is_ok() {
                let _ = tx.send(RelayEvent::Done).await;
            }
        }
    });
    Ok(event_stream(rx))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct FallbackRequest {
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FallbackResponse {
    pub response: String,
}

#[utoipa::path(
    context_path = "/api",
    path = "/chat/fallback",
    method(post),
    request_body = FallbackRequest,
    responses(
        (status = 200, description = "Full reply without conversation context", body = FallbackResponse),
        (status = 400, description = "Missing message"),
        (status = 429, description = "Upstream model is rate limited"),
        (status = 500, description = "Upstream model failure")
    )
)]
pub async fn fallback(
    State(tutor): State<Arc<Tutor>>,
    Json(req): Json<FallbackRequest>,
) -> Result<Json<FallbackResponse>> {
    let message = required_message(&req.message)?;
    let response = tutor.relay().fallback(&message).await?;
    Ok(Json(FallbackResponse { response }))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub messages: Vec<Turn>,
    pub tool_name: String,
    #[serde(default)]
    pub current_module: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AnalyzeResponse {
    pub success: bool,
    pub analysis: ProgressVerdict,
}

#[utoipa::path(
    context_path = "/api",
    path = "/analyze-progress",
    method(post),
    request_body = AnalyzeRequest,
    responses(
        (status = 200, description = "Verdict, or a low-confidence default when analysis failed", body = AnalyzeResponse),
        (status = 400, description = "Missing messages or tool name")
    )
)]
pub async fn analyze_progress(
    State(tutor): State<Arc<Tutor>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>> {
    if req.messages.is_empty() || req.tool_name.trim().is_empty() {
        return Err(Error::BadRequest(
            "Messages and toolName are required".to_string(),
        ));
    }
    let analysis = tutor
        .analyzer()
        .analyze(&req.messages, &req.tool_name, req.current_module.unwrap_or(1))
        .await;
    Ok(Json(AnalyzeResponse {
        success: true,
        analysis,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionChatRequest {
    pub user_id: i64,
    pub tool_id: i64,
    pub message: String,
}

#[utoipa::path(
    context_path = "/api",
    path = "/session/chat",
    method(post),
    request_body = SessionChatRequest,
    responses(
        (status = 200, description = "Stream of `data:` frames ending with `[DONE]` (text/event-stream)"),
        (status = 400, description = "Missing message"),
        (status = 404, description = "Unknown user or tool")
    )
)]
pub async fn session_chat(
    State(tutor): State<Arc<Tutor>>,
    Json(req): Json<SessionChatRequest>,
) -> Result<impl IntoResponse> {
    let message = required_message(&req.message)?;
    let session = tutor.open_session(req.user_id, req.tool_id).await?;
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        if let Err(e) = tutor.chat(&session, &message, tx).await {
            warn!("session chat failed: {}", e);
        }
    });
    Ok(event_stream(rx))
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct SessionQuery {
    pub user_id: i64,
    pub tool_id: i64,
}

#[utoipa::path(
    context_path = "/api",
    path = "/session/messages",
    method(get),
    params(SessionQuery),
    responses(
        (status = 200, description = "Conversation and course progress of a live session", body = SessionSnapshot),
        (status = 404, description = "No live session")
    )
)]
pub async fn session_messages(
    State(tutor): State<Arc<Tutor>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SessionSnapshot>> {
    let session = tutor
        .session(query.user_id, query.tool_id)
        .await
        .ok_or(Error::NotFound("session"))?;
    Ok(Json(session.snapshot()))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CloseSessionResponse {
    pub success: bool,
    pub closed: bool,
}

#[utoipa::path(
    context_path = "/api",
    path = "/session",
    method(delete),
    params(SessionQuery),
    responses(
        (status = 200, description = "Session closed if it was live", body = CloseSessionResponse)
    )
)]
pub async fn close_session(
    State(tutor): State<Arc<Tutor>>,
    Query(query): Query<SessionQuery>,
) -> Json<CloseSessionResponse> {
    let closed = tutor.close_session(query.user_id, query.tool_id).await;
    Json(CloseSessionResponse {
        success: true,
        closed,
    })
}

pub fn get_chat_scope() -> Router<Arc<Tutor>> {
    Router::new()
        .route("/chat", post(chat))
        .route("/chat/fallback", post(fallback))
        .route("/analyze-progress", post(analyze_progress))
        .route("/session/chat", post(session_chat))
        .route("/session/messages", get(session_messages))
        .route("/session", delete(close_session))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::api::testing::{app, send, send_json};
    use crate::error::LlmError;
    use crate::tool::{fixtures::new_tool, store_tool};
    use crate::user::create_user;

    #[tokio::test]
    async fn streams_frames_and_done_marker() {
        let (app, _, model) = app().await;
        model.push_stream(&["Hello ", "\"there\""]);
        let (status, body) = send(
            &app,
            "POST",
            "/api/chat",
            Some(json!({
                "message": "hi",
                "tools": [{"name": "Python", "description": "snakes", "modules": []}],
                "currentModule": 1,
                "conversationHistory": [{"sender": "ai", "text": "welcome"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            "data: {\"text\":\"Hello \"}\n\ndata: {\"text\":\"\\\"there\\\"\"}\n\ndata: [DONE]\n\n"
        );
        let system = model.requests.lock()[0].system.clone().unwrap();
        assert!(system.contains("Python"));
        assert!(system.contains("ai: welcome"));
    }

    #[tokio::test]
    async fn rate_limited_open_is_429() {
        let (app, _, model) = app().await;
        model.push_stream_error(LlmError::RateLimited("quota exceeded".into()));
        let (status, body) =
            send_json(&app, "POST", "/api/chat", Some(json!({"message": "hi"}))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], RATE_LIMIT_MESSAGE);
    }

    #[tokio::test]
    async fn mid_stream_failure_sends_error_frame() {
        let (app, _, model) = app().await;
        model.push_stream_items(vec![
            Ok("Par".into()),
            Err(LlmError::RequestFailed("reset".into())),
        ]);
        let (_, body) = send(&app, "POST", "/api/chat", Some(json!({"message": "hi"}))).await;
        assert_eq!(
            body,
            "data: {\"text\":\"Par\"}\n\ndata: {\"error\":\"Failed to get response\"}\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (app, _, _) = app().await;
        let (status, body) =
            send_json(&app, "POST", "/api/chat", Some(json!({"message": " "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn fallback_returns_full_text() {
        let (app, _, model) = app().await;
        model.push_completion(Ok("All at once.".into()));
        let (status, body) = send_json(
            &app,
            "POST",
            "/api/chat/fallback",
            Some(json!({"message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"response": "All at once."}));
    }

    #[tokio::test]
    async fn analysis_failure_keeps_success_envelope() {
        let (app, _, model) = app().await;
        model.push_completion(Ok("no idea".into()));
        let (status, body) = send_json(
            &app,
            "POST",
            "/api/analyze-progress",
            Some(json!({
                "messages": [{"sender": "user", "text": "what is a loop?"}],
                "toolName": "Python",
                "currentModule": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["analysis"]["moduleComplete"], false);
        assert_eq!(body["analysis"]["summary"], "Could not properly analyze the conversation");

        let (status, _) = send_json(
            &app,
            "POST",
            "/api/analyze-progress",
            Some(json!({"messages": [], "toolName": "Python"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn session_chat_records_conversation() {
        let (app, tutor, model) = app().await;
        let user = create_user(tutor.database(), "ada".into(), None).await.unwrap();
        let tool = store_tool(tutor.database(), user.id, new_tool("Rust", 2))
            .await
            .unwrap();
        model.push_stream(&["Ownership ", "moves values."]);
        let (status, body) = send(
            &app,
            "POST",
            "/api/session/chat",
            Some(json!({"userId": user.id, "toolId": tool.id, "message": "ownership?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with("data: [DONE]\n\n"));

        let uri = format!("/api/session/messages?userId={}&toolId={}", user.id, tool.id);
        let (status, snapshot) = send_json(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["currentModule"], 1);
        assert_eq!(snapshot["course"]["modulesCompleted"], 0);
        let messages = snapshot["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["text"], "Ownership moves values.");
        assert_eq!(messages[2]["isStreaming"], false);

        let uri = format!("/api/session?userId={}&toolId={}", user.id, tool.id);
        let (_, closed) = send_json(&app, "DELETE", &uri, None).await;
        assert_eq!(closed["closed"], true);
        let uri = format!("/api/session/messages?userId={}&toolId={}", user.id, tool.id);
        let (status, _) = send_json(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
