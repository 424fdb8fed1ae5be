use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::utils::now_utc;

/// A learner as seen by the tutor: identity plus the questionnaire used for personalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub has_completed_survey: bool,
    /// question -> index of the chosen answer
    #[serde(default)]
    pub questionnaire_answers: BTreeMap<String, usize>,
}

impl UserProfile {
    pub fn display_name(&self) -> &str {
        self.first_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.username)
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    first_name: Option<String>,
    has_completed_survey: bool,
    questionnaire_answers: String,
}

impl TryFrom<UserRow> for UserProfile {
    type Error = Error;
    fn try_from(row: UserRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            username: row.username,
            first_name: row.first_name,
            has_completed_survey: row.has_completed_survey,
            questionnaire_answers: serde_json::from_str(&row.questionnaire_answers)?,
        })
    }
}

pub async fn create_user(
    database: &SqlitePool,
    username: String,
    first_name: Option<String>,
) -> Result<UserProfile> {
    if username.trim().is_empty() {
        return Err(Error::BadRequest("username is required".to_string()));
    }
    let now = now_utc();
    let id = sqlx::query(
        "INSERT INTO app_user (username, first_name, has_completed_survey, questionnaire_answers, create_time) VALUES (?, ?, 0, '{}', ?)",
    )
    .bind(&username)
    .bind(&first_name)
    .bind(now)
    .execute(database)
    .await?
    .last_insert_rowid();
    info!(user_id = id, "created user {}", username);
    get_user(database, id).await
}

pub async fn get_user(database: &SqlitePool, id: i64) -> Result<UserProfile> {
    let row = sqlx::query_as::<_, UserRow>(
        "SELECT id, username, first_name, has_completed_survey, questionnaire_answers FROM app_user WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(database)
    .await?
    .ok_or(Error::NotFound("user"))?;
    row.try_into()
}

pub async fn get_user_list(database: &SqlitePool) -> Result<Vec<UserProfile>> {
    let rows = sqlx::query_as::<_, UserRow>(
        "SELECT id, username, first_name, has_completed_survey, questionnaire_answers FROM app_user ORDER BY id",
    )
    .fetch_all(database)
    .await?;
    rows.into_iter().map(UserProfile::try_from).collect()
}

/// Delete the account together with its courses and tools.
pub async fn delete_user(database: &SqlitePool, id: i64) -> Result<()> {
    let mut tx = database.begin().await?;
    sqlx::query("DELETE FROM course WHERE user_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM tool WHERE user_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query("DELETE FROM app_user WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(Error::NotFound("user"));
    }
    tx.commit().await?;
    info!(user_id = id, "deleted user and associated data");
    Ok(())
}

pub async fn save_questionnaire(
    database: &SqlitePool,
    id: i64,
    answers: &BTreeMap<String, usize>,
) -> Result<UserProfile> {
    let answers_json = serde_json::to_string(answers)?;
    let updated = sqlx::query(
        "UPDATE app_user SET questionnaire_answers = ?, has_completed_survey = 1 WHERE id = ?",
    )
    .bind(answers_json)
    .bind(id)
    .execute(database)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(Error::NotFound("user"));
    }
    get_user(database, id).await
}

/// Register the personalization fragments offered for one questionnaire question,
/// indexed by answer.
pub async fn set_meta_prompt(database: &SqlitePool, question: &str, prompts: &[String]) -> Result<()> {
    let prompts = serde_json::to_string(prompts)?;
    sqlx::query(
        "INSERT INTO meta_prompt (question, prompts) VALUES (?, ?) ON CONFLICT(question) DO UPDATE SET prompts = excluded.prompts",
    )
    .bind(question)
    .bind(prompts)
    .execute(database)
    .await?;
    Ok(())
}

/// Look up the persona fragments selected by the user's questionnaire answers.
/// Unknown questions and out-of-range answers are skipped.
pub async fn personalization_fragments(
    database: &SqlitePool,
    answers: &BTreeMap<String, usize>,
) -> Result<Vec<String>> {
    if answers.is_empty() {
        return Ok(vec![]);
    }
    let mut query: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT question, prompts FROM meta_prompt WHERE question IN (");
    let mut separated = query.separated(", ");
    for question in answers.keys() {
        separated.push_bind(question.clone());
    }
    separated.push_unseparated(")");
    let rows: Vec<(String, String)> = query.build_query_as().fetch_all(database).await?;
    let mut prompts_by_question = BTreeMap::new();
    for (question, prompts) in rows {
        prompts_by_question.insert(question, serde_json::from_str::<Vec<String>>(&prompts)?);
    }
    let fragments = answers
        .iter()
        .filter_map(|(question, &answer)| {
            prompts_by_question
                .get(question)
                .and_then(|prompts| prompts.get(answer))
                .cloned()
        })
        .collect();
    Ok(fragments)
}
