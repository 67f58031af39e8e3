use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageTemplate {
    pub id: Uuid,
    pub name: String,
    pub content: String,
    /// JSON object of `{key}` placeholders to values.
    pub variables: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a caller supplies when creating or replacing a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInput {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub variables: serde_json::Value,
}

impl TemplateInput {
    pub fn into_template(self, id: Uuid, now: DateTime<Utc>) -> MessageTemplate {
        let variables = match self.variables {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };
        MessageTemplate {
            id,
            name: self.name,
            content: self.content,
            variables,
            created_at: now,
            updated_at: now,
        }
    }
}
