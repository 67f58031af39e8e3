//! Operations behind the admin API.
//!
//! Job status only ever moves through the executor; everything here is a
//! read, an insert, or a guarded change on a `pending` row.

use super::executor::Execution;
use super::scheduler::{Scheduler, SchedulerStatus};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::schema::{
    DeliveryLog, DeliveryOutcome, Job, JobKind, JobStatus, MessageTemplate, NewJob, RetrySettings,
    TemplateInput,
};
use crate::services::{
    AuditSink, GatewayError, LogFilter, LogStats, SessionRegistry, SessionStatus, SettingsProvider,
    TemplateProvider,
};
use crate::store::{JobFilter, JobStats, JobStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub page: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub logs: Vec<DeliveryLog>,
    pub page: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteNow {
    pub job: Job,
    /// Present when the executor was run right away.
    pub execution: Option<Execution>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub status: SessionStatus,
}

#[derive(Clone)]
pub struct Admin {
    store: Arc<dyn JobStore>,
    templates: Arc<dyn TemplateProvider>,
    settings: Arc<dyn SettingsProvider>,
    audit: Arc<dyn AuditSink>,
    scheduler: Arc<Scheduler>,
    sessions: Arc<SessionRegistry>,
    clock: Arc<dyn Clock>,
}

impl Admin {
    pub fn new(
        store: Arc<dyn JobStore>,
        templates: Arc<dyn TemplateProvider>,
        settings: Arc<dyn SettingsProvider>,
        audit: Arc<dyn AuditSink>,
        scheduler: Arc<Scheduler>,
        sessions: Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            templates,
            settings,
            audit,
            scheduler,
            sessions,
            clock,
        }
    }

    /// Trimmed copy of `new`, or the first rule it breaks.
    async fn validate(&self, new: NewJob, now: DateTime<Utc>) -> Result<NewJob> {
        let new = NewJob {
            session_ref: new.session_ref.trim().to_string(),
            destination: new.destination.trim().to_string(),
            ..new
        };

        if new.session_ref.is_empty() {
            return Err(Error::validation("session_ref is required"));
        }
        if new.destination.is_empty() {
            return Err(Error::validation("destination is required"));
        }
        match new.message.template_id {
            Some(id) => {
                if !self.templates.exists(id).await? {
                    return Err(Error::validation(format!("template {id} does not exist")));
                }
            }
            None if new.message.inline_text().is_none() => {
                return Err(Error::validation(
                    "either a template_id or a non-empty text is required",
                ));
            }
            None => {}
        }
        if new.send_at <= now {
            return Err(Error::validation("send_at must be in the future"));
        }
        if new.kind == JobKind::Recurring && new.interval_days.is_none_or(|d| d < 1) {
            return Err(Error::validation(
                "interval_days must be at least 1 for recurring jobs",
            ));
        }
        Ok(new)
    }

    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        let now = self.clock.now();
        let job = self.validate(new, now).await?.into_pending(now);
        self.store.insert(&job).await?;
        tracing::info!(
            job_id = %job.id,
            session = %job.session_ref,
            kind = job.kind.as_str(),
            send_at = %job.send_at,
            "admin: job scheduled"
        );
        Ok(job)
    }

    /// Replace a pending job with `new`, validated as on create. The job keeps
    /// its id and creation time and starts over with no attempts.
    pub async fn update_job(&self, id: Uuid, new: NewJob) -> Result<Job> {
        let now = self.clock.now();
        let current = self.get_job(id).await?;
        if current.status != JobStatus::Pending {
            return Err(self.not_pending(id).await);
        }

        let job = Job {
            id,
            created_at: current.created_at,
            ..self.validate(new, now).await?.into_pending(now)
        };
        if !self.store.update_pending(&job).await? {
            return Err(self.not_pending(id).await);
        }
        tracing::info!(job_id = %id, send_at = %job.send_at, "admin: job updated");
        Ok(job)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("schedule {id}")))
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<()> {
        if self.store.delete_pending(id).await? {
            tracing::info!(job_id = %id, "admin: job deleted");
            return Ok(());
        }
        Err(self.not_pending(id).await)
    }

    /// Make a pending job due immediately, and optionally run it now instead
    /// of waiting for the next tick.
    pub async fn execute_now(&self, id: Uuid, run: bool) -> Result<ExecuteNow> {
        if !self.store.force_due(id, self.clock.now()).await? {
            return Err(self.not_pending(id).await);
        }
        tracing::info!(job_id = %id, run, "admin: job forced due");

        let execution = if run {
            Some(self.scheduler.executor().execute(id).await?)
        } else {
            None
        };
        Ok(ExecuteNow {
            job: self.get_job(id).await?,
            execution,
        })
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        page: Option<i64>,
        limit: Option<i64>,
    ) -> Result<JobPage> {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let jobs = self
            .store
            .list(&JobFilter {
                status,
                limit,
                offset: (page - 1).saturating_mul(limit),
            })
            .await?;
        Ok(JobPage { jobs, page, limit })
    }

    pub async fn job_stats(&self) -> Result<JobStats> {
        self.store.stats().await
    }

    pub async fn job_history(&self, id: Uuid) -> Result<Vec<DeliveryLog>> {
        let history = self.audit.history(id).await?;
        if history.is_empty() && self.store.get(id).await?.is_none() {
            return Err(Error::not_found(format!("schedule {id}")));
        }
        Ok(history)
    }

    pub async fn retry_settings(&self) -> Result<RetrySettings> {
        self.settings.retry_settings().await
    }

    pub async fn update_retry_settings(&self, settings: RetrySettings) -> Result<RetrySettings> {
        if settings.max_attempts < 1 {
            return Err(Error::validation("max_attempts must be at least 1"));
        }
        self.settings.update_retry_settings(&settings).await?;
        Ok(settings)
    }

    pub async fn list_logs(
        &self,
        outcome: Option<DeliveryOutcome>,
        session_ref: Option<String>,
        page: Option<i64>,
        limit: Option<i64>,
    ) -> Result<LogPage> {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let logs = self
            .audit
            .list(&LogFilter {
                outcome,
                session_ref: session_ref.filter(|s| !s.trim().is_empty()),
                limit,
                offset: (page - 1).saturating_mul(limit),
            })
            .await?;
        Ok(LogPage { logs, page, limit })
    }

    pub async fn log_stats(&self) -> Result<LogStats> {
        self.audit.stats().await
    }

    pub async fn list_templates(&self) -> Result<Vec<MessageTemplate>> {
        self.templates.list().await
    }

    pub async fn get_template(&self, id: Uuid) -> Result<MessageTemplate> {
        self.templates
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("template {id}")))
    }

    pub async fn create_template(&self, input: TemplateInput) -> Result<MessageTemplate> {
        let template = validate_template(input)?.into_template(Uuid::new_v4(), self.clock.now());
        self.templates.insert(&template).await?;
        tracing::info!(
            template_id = %template.id,
            name = %template.name,
            "admin: template created"
        );
        Ok(template)
    }

    pub async fn update_template(&self, id: Uuid, input: TemplateInput) -> Result<MessageTemplate> {
        let current = self.get_template(id).await?;
        let template = MessageTemplate {
            created_at: current.created_at,
            ..validate_template(input)?.into_template(id, self.clock.now())
        };
        if !self.templates.update(&template).await? {
            return Err(Error::not_found(format!("template {id}")));
        }
        tracing::info!(template_id = %id, "admin: template updated");
        Ok(template)
    }

    pub async fn delete_template(&self, id: Uuid) -> Result<()> {
        if !self.templates.delete(id).await? {
            return Err(Error::not_found(format!("template {id}")));
        }
        tracing::info!(template_id = %id, "admin: template deleted");
        Ok(())
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();
        for name in self.sessions.names().await {
            // a session removed between the two calls is simply left out
            if let Some(status) = self.sessions.status(&name).await {
                sessions.push(SessionInfo { name, status });
            }
        }
        sessions
    }

    /// Disconnect and unregister a session. Jobs still pointing at it fail
    /// their attempts until it is registered again.
    pub async fn disconnect_session(&self, name: &str) -> Result<()> {
        self.sessions.disconnect(name).await.map_err(|e| match e {
            GatewayError::UnknownSession(name) => Error::not_found(format!("session {name}")),
            other => Error::Internal(other.to_string()),
        })?;
        tracing::info!(session = %name, "admin: session disconnected");
        Ok(())
    }

    async fn not_pending(&self, id: Uuid) -> Error {
        match self.store.get(id).await {
            Ok(None) => Error::not_found(format!("schedule {id}")),
            Ok(Some(job)) if job.status == JobStatus::Processing => {
                Error::conflict(format!("schedule {id} is in flight"))
            }
            Ok(Some(job)) if job.status.is_terminal() => Error::conflict(format!(
                "schedule {id} is {} and kept as history",
                job.status
            )),
            // became pending again between the two reads
            Ok(Some(_)) => Error::conflict(format!("schedule {id} changed concurrently, retry")),
            Err(e) => e,
        }
    }
}

fn validate_template(input: TemplateInput) -> Result<TemplateInput> {
    let input = TemplateInput {
        name: input.name.trim().to_string(),
        ..input
    };
    if input.name.is_empty() {
        return Err(Error::validation("name is required"));
    }
    if input.content.trim().is_empty() {
        return Err(Error::validation("content is required"));
    }
    if !(input.variables.is_object() || input.variables.is_null()) {
        return Err(Error::validation("variables must be a JSON object"));
    }
    Ok(input)
}
