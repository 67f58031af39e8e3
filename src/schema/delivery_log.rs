use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Sent,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::Failed => "failed",
        }
    }
}

/// One record per execution attempt, handed to the audit sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: Uuid,
    pub session_ref: String,
    pub destination: String,
    pub content_summary: String,
    pub outcome: DeliveryOutcome,
    pub attempts: i32,
    pub external_message_id: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub job_id: Uuid,
    pub session_ref: String,
    pub destination: String,
    pub content_summary: String,
    pub outcome: String,
    pub attempts: i32,
    pub external_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
