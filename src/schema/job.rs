use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl JobStatus {
    #[cfg(test)]
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Sent,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "sent" => Ok(JobStatus::Sent),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Once,
    Recurring,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Once => "once",
            JobKind::Recurring => "recurring",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(JobKind::Once),
            "recurring" => Ok(JobKind::Recurring),
            other => Err(format!("unknown job kind `{other}`")),
        }
    }
}

/// What to send. A template reference wins over inline text; the text is the
/// fallback when the template is gone or renders empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub template_id: Option<Uuid>,
    pub text: Option<String>,
}

impl MessageRef {
    #[cfg(test)]
    pub fn inline(text: impl Into<String>) -> Self {
        Self {
            template_id: None,
            text: Some(text.into()),
        }
    }

    #[cfg(test)]
    pub fn template(id: Uuid) -> Self {
        Self {
            template_id: Some(id),
            text: None,
        }
    }

    pub fn inline_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub session_ref: String,
    pub destination: String,
    pub message: MessageRef,
    pub kind: JobKind,
    pub interval_days: Option<i32>,
    /// Eligibility gate; pushed forward on retry.
    pub send_at: DateTime<Utc>,
    /// The `send_at` the job was created with. Never moved by retries.
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub external_message_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    #[cfg(test)]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.send_at <= now
    }

    pub fn is_recurring(&self) -> bool {
        self.kind == JobKind::Recurring
    }
}

/// Fields a caller supplies when scheduling a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub session_ref: String,
    pub destination: String,
    pub message: MessageRef,
    pub kind: JobKind,
    pub interval_days: Option<i32>,
    pub send_at: DateTime<Utc>,
}

impl NewJob {
    pub fn into_pending(self, now: DateTime<Utc>) -> Job {
        let interval_days = match self.kind {
            JobKind::Recurring => self.interval_days,
            JobKind::Once => None,
        };
        Job {
            id: Uuid::new_v4(),
            session_ref: self.session_ref,
            destination: self.destination,
            message: self.message,
            kind: self.kind,
            interval_days,
            send_at: self.send_at,
            scheduled_for: self.send_at,
            status: JobStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            external_message_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
