use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::error::{Error, Result};
use crate::teacher::Tutor;
use crate::tool::{NewTool, Tool};
use crate::user::{self, UserProfile};

#[derive(Debug, Serialize, ToSchema)]
pub struct UserResponse {
    pub success: bool,
    pub user: UserProfile,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
}

#[utoipa::path(
    context_path = "/api",
    path = "/users",
    method(post),
    request_body = CreateUserRequest,
    responses(
        (status = 200, description = "User created", body = UserResponse),
        (status = 400, description = "Missing or taken username")
    )
)]
pub async fn create_user(
    State(tutor): State<Arc<Tutor>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<UserResponse>> {
    let user = user::create_user(tutor.database(), req.username, req.first_name).await?;
    Ok(Json(UserResponse {
        success: true,
        user,
    }))
}

#[utoipa::path(
    context_path = "/api",
    path = "/users/{id}",
    method(get),
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "User profile", body = UserResponse),
        (status = 404, description = "User not found")
    )
)]
pub async fn get_user(
    State(tutor): State<Arc<Tutor>>,
    Path(id): Path<i64>,
) -> Result<Json<UserResponse>> {
    let user = user::get_user(tutor.database(), id).await?;
    Ok(Json(UserResponse {
        success: true,
        user,
    }))
}

#[utoipa::path(
    context_path = "/api",
    path = "/users",
    method(get),
    responses(
        (status = 200, description = "All users", body = Vec<UserProfile>)
    )
)]
pub async fn list_users(State(tutor): State<Arc<Tutor>>) -> Result<Json<Vec<UserProfile>>> {
    Ok(Json(user::get_user_list(tutor.database()).await?))
}

#[utoipa::path(
    context_path = "/api",
    path = "/users/{id}",
    method(delete),
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "User, courses and tools deleted", body = SuccessResponse),
        (status = 404, description = "User not found")
    )
)]
pub async fn delete_user(
    State(tutor): State<Arc<Tutor>>,
    Path(id): Path<i64>,
) -> Result<Json<SuccessResponse>> {
    let tools = crate::tool::list_tools(tutor.database(), id).await?;
    user::delete_user(tutor.database(), id).await?;
    for tool in tools {
        tutor.close_session(id, tool.id).await;
    }
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireRequest {
    pub user_id: i64,
    /// question -> index of the chosen answer
    pub answers: BTreeMap<String, usize>,
}

#[utoipa::path(
    context_path = "/api",
    path = "/questionnaire",
    method(post),
    request_body = QuestionnaireRequest,
    responses(
        (status = 200, description = "Answers saved and survey marked completed", body = UserResponse),
        (status = 404, description = "User not found")
    )
)]
pub async fn save_questionnaire(
    State(tutor): State<Arc<Tutor>>,
    Json(req): Json<QuestionnaireRequest>,
) -> Result<Json<UserResponse>> {
    let user = user::save_questionnaire(tutor.database(), req.user_id, &req.answers).await?;
    Ok(Json(UserResponse {
        success: true,
        user,
    }))
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ToolQuery {
    #[serde(alias = "id")]
    pub user_id: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ToolsResponse {
    pub success: bool,
    pub tools: Vec<Tool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ToolResponse {
    pub success: bool,
    pub tool: Tool,
}

#[utoipa::path(
    context_path = "/api",
    path = "/tools",
    method(get),
    params(ToolQuery),
    responses(
        (status = 200, description = "Tools owned by the user", body = ToolsResponse),
        (status = 404, description = "User not found")
    )
)]
pub async fn list_tools(
    State(tutor): State<Arc<Tutor>>,
    Query(query): Query<ToolQuery>,
) -> Result<Json<ToolsResponse>> {
    user::get_user(tutor.database(), query.user_id).await?;
    let tools = crate::tool::list_tools(tutor.database(), query.user_id).await?;
    Ok(Json(ToolsResponse {
        success: true,
        tools,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoreToolRequest {
    pub user_id: i64,
    pub tool: NewTool,
}

#[utoipa::path(
    context_path = "/api",
    path = "/tools",
    method(post),
    request_body = StoreToolRequest,
    responses(
        (status = 200, description = "Stored tool, or the one the user already had with that name", body = ToolResponse),
        (status = 400, description = "Tool without name or modules"),
        (status = 404, description = "User not found")
    )
)]
pub async fn store_tool(
    State(tutor): State<Arc<Tutor>>,
    Json(req): Json<StoreToolRequest>,
) -> Result<Json<ToolResponse>> {
    if req.tool.modules.is_empty() {
        return Err(Error::BadRequest("a tool needs at least one module".to_string()));
    }
    user::get_user(tutor.database(), req.user_id).await?;
    let tool = crate::tool::store_tool(tutor.database(), req.user_id, req.tool).await?;
    Ok(Json(ToolResponse {
        success: true,
        tool,
    }))
}

pub fn get_user_scope() -> Router<Arc<Tutor>> {
    Router::new()
        .route("/users", post(create_user).get(list_users))
        .route("/users/{id}", get(get_user).delete(delete_user))
        .route("/questionnaire", post(save_questionnaire))
        .route("/tools", get(list_tools).post(store_tool))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::testing::{app, send_json};

    #[tokio::test]
    async fn user_tool_and_questionnaire_flow() {
        let (app, _, _) = app().await;
        let (status, created) = send_json(
            &app,
            "POST",
            "/api/users",
            Some(json!({"username": "grace", "firstName": "Grace"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = created["user"]["id"].as_i64().unwrap();
        assert_eq!(created["user"]["hasCompletedSurvey"], false);

        let (_, saved) = send_json(
            &app,
            "POST",
            "/api/questionnaire",
            Some(json!({"userId": id, "answers": {"experience": 2}})),
        )
        .await;
        assert_eq!(saved["user"]["hasCompletedSurvey"], true);
        assert_eq!(saved["user"]["questionnaireAnswers"]["experience"], 2);

        let tool = json!({
            "name": "Python",
            "description": "General purpose language",
            "difficulty": "beginner",
            "modules": [
                {"title": "Basics", "description": "Syntax"},
                {"title": "Collections", "description": "Lists"}
            ]
        });
        let (status, stored) = send_json(
            &app,
            "POST",
            "/api/tools",
            Some(json!({"userId": id, "tool": tool})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["tool"]["modules"][1]["title"], "Collections");

        let (_, tools) = send_json(&app, "GET", &format!("/api/tools?id={id}"), None).await;
        assert_eq!(tools["tools"].as_array().unwrap().len(), 1);

        let (_, fetched) = send_json(&app, "GET", &format!("/api/users/{id}"), None).await;
        assert_eq!(fetched["user"]["firstName"], "Grace");
    }

    #[tokio::test]
    async fn deleting_user_removes_courses_and_tools() {
        let (app, tutor, _) = app().await;
        let (_, created) =
            send_json(&app, "POST", "/api/users", Some(json!({"username": "linus"}))).await;
        let id = created["user"]["id"].as_i64().unwrap();
        let tool = json!({"name": "C", "description": "Systems", "modules": [{"title": "Pointers", "description": "Memory"}]});
        let (_, stored) =
            send_json(&app, "POST", "/api/tools", Some(json!({"userId": id, "tool": tool}))).await;
        let tool_id = stored["tool"]["id"].as_i64().unwrap();
        tutor.open_session(id, tool_id).await.unwrap();

        let (status, _) = send_json(&app, "DELETE", &format!("/api/users/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(tutor.session(id, tool_id).await.is_none());
        assert!(tutor.store().list_for_user(id).await.unwrap().is_empty());
        let (status, _) = send_json(&app, "GET", &format!("/api/tools?userId={id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send_json(&app, "DELETE", &format!("/api/users/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tool_without_modules_is_rejected() {
        let (app, _, _) = app().await;
        let (_, created) =
            send_json(&app, "POST", "/api/users", Some(json!({"username": "ken"}))).await;
        let id = created["user"]["id"].as_i64().unwrap();
        let (status, _) = send_json(
            &app,
            "POST",
            "/api/tools",
            Some(json!({"userId": id, "tool": {"name": "B", "description": "old", "modules": []}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
