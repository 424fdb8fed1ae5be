use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::utils::now_utc;

/// A user's enrollment in one tool and the number of modules completed so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: i64,
    pub user_id: i64,
    pub tool_id: i64,
    pub modules_completed: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub create_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub update_time: OffsetDateTime,
}

/// Persistence of course progress, always keyed by the (user, tool) pair.
#[async_trait]
pub trait CompletionStore: Send + Sync {
    async fn get(&self, user_id: i64, tool_id: i64) -> Result<Option<Course>>;

    /// Enroll the user. Returns the existing course when one is already present.
    async fn create(&self, user_id: i64, tool_id: i64) -> Result<Course>;

    /// Add exactly one completed module, never below zero and never past the
    /// tool's module count. Fails with `NotFound` when the user is not enrolled.
    async fn increment_modules_completed(&self, user_id: i64, tool_id: i64) -> Result<Course>;

    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Course>>;
}

#[derive(Debug, Clone)]
pub struct SqliteCourseStore {
    database: SqlitePool,
}

impl SqliteCourseStore {
    pub fn new(database: SqlitePool) -> Self {
        Self { database }
    }
}

const COURSE_COLUMNS: &str = "id, user_id, tool_id, modules_completed, create_time, update_time";

#[async_trait]
impl CompletionStore for SqliteCourseStore {
    async fn get(&self, user_id: i64, tool_id: i64) -> Result<Option<Course>> {
        let course = sqlx::query_as::<_, Course>(&format!(
            "SELECT {COURSE_COLUMNS} FROM course WHERE user_id = ? AND tool_id = ?"
        ))
        .bind(user_id)
        .bind(tool_id)
        .fetch_optional(&self.database)
        .await?;
        Ok(course)
    }

    async fn create(&self, user_id: i64, tool_id: i64) -> Result<Course> {
        let now = now_utc();
        let inserted = sqlx::query(
            "INSERT INTO course (user_id, tool_id, modules_completed, create_time, update_time) VALUES (?, ?, 0, ?, ?) ON CONFLICT(user_id, tool_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(tool_id)
        .bind(now)
        .bind(now)
        .execute(&self.database)
        .await?
        .rows_affected();
        if inserted > 0 {
            info!(user_id, tool_id, "enrolled in course");
        }
        self.get(user_id, tool_id)
            .await?
            .ok_or(Error::NotFound("course"))
    }

    async fn increment_modules_completed(&self, user_id: i64, tool_id: i64) -> Result<Course> {
        let course = sqlx::query_as::<_, Course>(&format!(
            "UPDATE course SET \
                modules_completed = MIN(MAX(modules_completed, 0) + 1, \
                    (SELECT COUNT(*) FROM tool_module WHERE tool_module.tool_id = course.tool_id)), \
                update_time = ? \
             WHERE user_id = ? AND tool_id = ? \
             RETURNING {COURSE_COLUMNS}"
        ))
        .bind(now_utc())
        .bind(user_id)
        .bind(tool_id)
        .fetch_optional(&self.database)
        .await?
        .ok_or(Error::NotFound("course"))?;
        info!(
            user_id,
            tool_id,
            modules_completed = course.modules_completed,
            "course progress updated"
        );
        Ok(course)
    }

    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Course>> {
        let courses = sqlx::query_as::<_, Course>(&format!(
            "SELECT {COURSE_COLUMNS} FROM course WHERE user_id = ? ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.database)
        .await?;
        Ok(courses)
    }
}
