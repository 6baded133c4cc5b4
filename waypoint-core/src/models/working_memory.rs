use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingMemoryFormat {
    #[default]
    Markdown,
    Json,
}

impl WorkingMemoryFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkingMemoryFormat::Markdown => "markdown",
            WorkingMemoryFormat::Json => "json",
        }
    }
}

impl TryFrom<String> for WorkingMemoryFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "markdown" => Ok(WorkingMemoryFormat::Markdown),
            "json" => Ok(WorkingMemoryFormat::Json),
            other => Err(format!("unknown working memory format '{other}'")),
        }
    }
}

/// The per-resource profile document. `version` increases on every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkingMemory {
    pub resource_id: String,
    #[sqlx(try_from = "String")]
    pub format: WorkingMemoryFormat,
    pub content: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}
