use std::{fmt, str::FromStr};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::utils::now_utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Difficulty::Beginner => "beginner",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced => "advanced",
        };
        f.write_str(s)
    }
}

impl FromStr for Difficulty {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginner" => Ok(Difficulty::Beginner),
            "intermediate" => Ok(Difficulty::Intermediate),
            "advanced" => Ok(Difficulty::Advanced),
            other => Err(anyhow!("unknown difficulty: {}", other)),
        }
    }
}

/// One ordered unit of a tool's curriculum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolModule {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    pub description: String,
}

/// A learnable subject with its curriculum. Modules are kept in curriculum order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Tool {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub modules: Vec<ToolModule>,
}

impl Tool {
    /// Module by 1-based curriculum position.
    pub fn module(&self, number: usize) -> Option<&ToolModule> {
        number.checked_sub(1).and_then(|index| self.modules.get(index))
    }
}

/// A tool as produced by the tool generator, before it has an id.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewTool {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    pub modules: Vec<NewToolModule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewToolModule {
    pub title: String,
    pub description: String,
}

/// Store a generated tool for `user_id`. A tool with the same name already owned
/// by the user is returned unchanged instead.
pub async fn store_tool(database: &SqlitePool, user_id: i64, tool: NewTool) -> Result<Tool> {
    if tool.name.trim().is_empty() {
        return Err(Error::BadRequest("tool name is required".to_string()));
    }
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM tool WHERE user_id = ? AND name = ?")
        .bind(user_id)
        .bind(&tool.name)
        .fetch_optional(database)
        .await?
    {
        return get_tool(database, id).await;
    }
    let mut tx = database.begin().await?;
    let tool_id = sqlx::query(
        "INSERT INTO tool (user_id, name, description, difficulty, create_time) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(&tool.name)
    .bind(&tool.description)
    .bind(tool.difficulty.to_string())
    .bind(now_utc())
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();
    for (position, module) in tool.modules.iter().enumerate() {
        sqlx::query(
            "INSERT INTO tool_module (tool_id, position, title, description) VALUES (?, ?, ?, ?)",
        )
        .bind(tool_id)
        .bind(position as i64)
        .bind(&module.title)
        .bind(&module.description)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    info!(user_id, tool_id, "stored tool {} with {} modules", tool.name, tool.modules.len());
    get_tool(database, tool_id).await
}

pub async fn get_tool(database: &SqlitePool, id: i64) -> Result<Tool> {
    let (name, description, difficulty) = sqlx::query_as::<_, (String, String, String)>(
        "SELECT name, description, difficulty FROM tool WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(database)
    .await?
    .ok_or(Error::NotFound("tool"))?;
    let modules = sqlx::query_as::<_, (i64, String, String)>(
        "SELECT id, title, description FROM tool_module WHERE tool_id = ? ORDER BY position",
    )
    .bind(id)
    .fetch_all(database)
    .await?
    .into_iter()
    .map(|(id, title, description)| ToolModule {
        id,
        title,
        description,
    })
    .collect();
    Ok(Tool {
        id,
        name,
        description,
        difficulty: difficulty.parse()?,
        modules,
    })
}

pub async fn list_tools(database: &SqlitePool, user_id: i64) -> Result<Vec<Tool>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM tool WHERE user_id = ? ORDER BY id")
        .bind(user_id)
        .fetch_all(database)
        .await?;
    let mut tools = Vec::with_capacity(ids.len());
    for id in ids {
        tools.push(get_tool(database, id).await?);
    }
    Ok(tools)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::connect_in_memory, user::create_user};

    #[tokio::test]
    async fn tool_is_unique_per_user_and_name() {
        let database = connect_in_memory().await.unwrap();
        let user = create_user(&database, "grace".into(), None).await.unwrap();
        let first = store_tool(&database, user.id, fixtures::new_tool("Python", 3))
            .await
            .unwrap();
        let second = store_tool(&database, user.id, fixtures::new_tool("Python", 5))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.modules.len(), 3);
        assert_eq!(list_tools(&database, user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn modules_keep_curriculum_order() {
        let database = connect_in_memory().await.unwrap();
        let user = create_user(&database, "grace".into(), None).await.unwrap();
        let tool = store_tool(&database, user.id, fixtures::new_tool("Rust", 4))
            .await
            .unwrap();
        let titles: Vec<_> = tool.modules.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(
            titles,
            ["Rust module 1", "Rust module 2", "Rust module 3", "Rust module 4"]
        );
        assert_eq!(tool.module(1).unwrap().title, "Rust module 1");
        assert!(tool.module(0).is_none());
        assert!(tool.module(5).is_none());
    }

    #[test]
    fn difficulty_round_trips_through_text() {
        assert_eq!("Advanced".parse::<Difficulty>().unwrap(), Difficulty::Advanced);
        assert!("expert".parse::<Difficulty>().is_err());
    }
}
