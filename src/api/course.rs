use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::course::Course;
use crate::error::{Error, Result};
use crate::teacher::Tutor;
use crate::tool::get_tool;
use crate::user::get_user;

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct CourseQuery {
    #[serde(alias = "id")]
    pub user_id: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CoursesResponse {
    pub success: bool,
    pub courses: Vec<Course>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CourseResponse {
    pub success: bool,
    pub course: Course,
}

#[utoipa::path(
    context_path = "/api",
    path = "/courses",
    method(get),
    params(CourseQuery),
    responses(
        (status = 200, description = "Courses of the user", body = CoursesResponse)
    )
)]
pub async fn list_courses(
    State(tutor): State<Arc<Tutor>>,
    Query(query): Query<CourseQuery>,
) -> Result<Json<CoursesResponse>> {
    let courses = tutor.store().list_for_user(query.user_id).await?;
    Ok(Json(CoursesResponse {
        success: true,
        courses,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateCourseRequest {
    pub user_id: i64,
    pub tool_id: i64,
}

#[utoipa::path(
    context_path = "/api",
    path = "/courses",
    method(post),
    request_body = CreateCourseRequest,
    responses(
        (status = 200, description = "The new or already existing course", body = CourseResponse),
        (status = 404, description = "Unknown user or tool")
    )
)]
pub async fn create_course(
    State(tutor): State<Arc<Tutor>>,
    Json(req): Json<CreateCourseRequest>,
) -> Result<Json<CourseResponse>> {
    get_user(tutor.database(), req.user_id).await?;
    get_tool(tutor.database(), req.tool_id).await?;
    let course = tutor.store().create(req.user_id, req.tool_id).await?;
    Ok(Json(CourseResponse {
        success: true,
        course,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCourseRequest {
    pub user_id: i64,
    pub tool_id: i64,
    /// Must be present; the stored count always moves up by exactly one.
    pub modules_completed: Option<i64>,
}

#[utoipa::path(
    context_path = "/api",
    path = "/courses",
    method(put),
    request_body = UpdateCourseRequest,
    responses(
        (status = 200, description = "Course after completing one more module", body = CourseResponse),
        (status = 400, description = "Missing modulesCompleted"),
        (status = 404, description = "User is not enrolled in the tool")
    )
)]
pub async fn update_course(
    State(tutor): State<Arc<Tutor>>,
    Json(req): Json<UpdateCourseRequest>,
) -> Result<Json<CourseResponse>> {
    if req.modules_completed.is_none() {
        return Err(Error::BadRequest(
            "modulesCompleted is required".to_string(),
        ));
    }
    let course = tutor
        .store()
        .increment_modules_completed(req.user_id, req.tool_id)
        .await?;
    tutor.sync_course(&course).await;
    Ok(Json(CourseResponse {
        success: true,
        course,
    }))
}

pub fn get_course_scope() -> Router<Arc<Tutor>> {
    Router::new().route(
        "/courses",
        get(list_courses).post(create_course).put(update_course),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::testing::{app, send_json};
    use crate::tool::{fixtures::new_tool, store_tool};
    use crate::user::create_user;

    #[tokio::test]
    async fn course_lifecycle() {
        let (app, tutor, _) = app().await;
        let user = create_user(tutor.database(), "ada".into(), None).await.unwrap();
        let tool = store_tool(tutor.database(), user.id, new_tool("Go", 2))
            .await
            .unwrap();
        let body = json!({"userId": user.id, "toolId": tool.id});

        let (status, first) = send_json(&app, "POST", "/api/courses", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (_, second) = send_json(&app, "POST", "/api/courses", Some(body)).await;
        assert_eq!(first["course"]["id"], second["course"]["id"]);

        let update = json!({"userId": user.id, "toolId": tool.id, "modulesCompleted": 40});
        for expected in [1, 2, 2] {
            let (status, updated) =
                send_json(&app, "PUT", "/api/courses", Some(update.clone())).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(updated["course"]["modulesCompleted"], expected);
        }

        let uri = format!("/api/courses?userId={}", user.id);
        let (_, listed) = send_json(&app, "GET", &uri, None).await;
        assert_eq!(listed["success"], true);
        assert_eq!(listed["courses"].as_array().unwrap().len(), 1);
        let (_, listed) = send_json(&app, "GET", &format!("/api/courses?id={}", user.id), None).await;
        assert_eq!(listed["courses"][0]["modulesCompleted"], 2);
    }

    #[tokio::test]
    async fn update_requires_enrollment_and_count() {
        let (app, tutor, _) = app().await;
        let user = create_user(tutor.database(), "ada".into(), None).await.unwrap();
        let tool = store_tool(tutor.database(), user.id, new_tool("Go", 2))
            .await
            .unwrap();
        let (status, body) = send_json(
            &app,
            "PUT",
            "/api/courses",
            Some(json!({"userId": user.id, "toolId": tool.id, "modulesCompleted": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (status, _) = send_json(
            &app,
            "PUT",
            "/api/courses",
            Some(json!({"userId": user.id, "toolId": tool.id})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send_json(
            &app,
            "POST",
            "/api/courses",
            Some(json!({"userId": user.id, "toolId": 999})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
