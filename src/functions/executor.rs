use super::backoff::{self, BackoffDecision};
use super::recurrence;
use super::resolver::MessageResolver;
use crate::clock::Clock;
use crate::error::Result;
use crate::schema::{AuditRecord, DeliveryOutcome, Job, JobStatus, RetrySettings};
use crate::services::{AuditSink, Gateway, SentMessage, SettingsProvider, summarize};
use crate::store::{AttemptOutcome, JobStore};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use uuid::Uuid;

pub const UNRESOLVED_ERROR: &str = "message content unresolved";
pub const INTERRUPTED_ERROR: &str = "processing interrupted before completion";

/// What happened to a job handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Execution {
    /// Someone else owned the job; nothing was touched.
    Skipped,
    Sent {
        message_id: String,
        successor: Option<Uuid>,
    },
    Retrying {
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        attempts: i32,
        error: String,
    },
}

/// Runs one job through claim, resolve, send and bookkeeping.
///
/// Gateway errors and panics never escape; they become a failed attempt.
/// Only store errors are returned, and the caller treats those as a tick
/// failure.
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    resolver: MessageResolver,
    gateway: Arc<dyn Gateway>,
    settings: Arc<dyn SettingsProvider>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        resolver: MessageResolver,
        gateway: Arc<dyn Gateway>,
        settings: Arc<dyn SettingsProvider>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            resolver,
            gateway,
            settings,
            audit,
            clock,
        }
    }

    pub async fn execute(&self, job_id: Uuid) -> Result<Execution> {
        let Some(job) = self.store.claim(job_id, self.clock.now()).await? else {
            tracing::debug!(%job_id, "executor: claim lost, skipping");
            return Ok(Execution::Skipped);
        };

        let attempts = job.attempts + 1;
        tracing::info!(
            job_id = %job.id,
            session = %job.session_ref,
            destination = %job.destination,
            attempt = attempts,
            "executor: sending message"
        );

        let (content, result) = self.attempt(&job).await;
        let now = self.clock.now();
        match result {
            Ok(sent) => self.complete(&job, attempts, content, sent, now).await,
            Err(error) => self.fail(&job, attempts, content, error, now).await,
        }
    }

    /// Close out a job whose worker vanished mid-attempt. The lost attempt
    /// counts like any other failure.
    pub async fn recover(&self, job_id: Uuid, claimed_before: DateTime<Utc>) -> Result<Execution> {
        let now = self.clock.now();
        let Some(job) = self.store.reclaim_stale(job_id, claimed_before, now).await? else {
            return Ok(Execution::Skipped);
        };

        tracing::warn!(
            job_id = %job.id,
            session = %job.session_ref,
            stuck_since = %job.updated_at,
            "executor: recovering stale job"
        );
        self.fail(&job, job.attempts + 1, None, INTERRUPTED_ERROR.to_string(), now)
            .await
    }

    async fn attempt(&self, job: &Job) -> (Option<String>, std::result::Result<SentMessage, String>) {
        let content = match self.resolver.resolve(&job.message, self.clock.now()).await {
            Ok(Some(text)) => text,
            Ok(None) => return (None, Err(UNRESOLVED_ERROR.to_string())),
            Err(e) => return (None, Err(format!("{UNRESOLVED_ERROR}: {e}"))),
        };

        let send = AssertUnwindSafe(self.gateway.send(&job.session_ref, &job.destination, &content))
            .catch_unwind()
            .await
            .map_err(|panic| format!("gateway panicked: {}", panic_message(&*panic)))
            .and_then(|sent| sent.map_err(|e| e.to_string()));

        (Some(content), send)
    }

    async fn complete(
        &self,
        job: &Job,
        attempts: i32,
        content: Option<String>,
        sent: SentMessage,
        now: DateTime<Utc>,
    ) -> Result<Execution> {
        let outcome = AttemptOutcome {
            status: JobStatus::Sent,
            attempts,
            attempted_at: now,
            send_at: None,
            external_message_id: Some(sent.message_id.clone()),
            last_error: None,
        };

        let successor = recurrence::next_occurrence(job, now);
        match &successor {
            Some(next) => {
                self.store
                    .complete_with_successor(job.id, &outcome, next)
                    .await?;
                tracing::info!(
                    job_id = %job.id,
                    next_job_id = %next.id,
                    next_send_at = %next.send_at,
                    "executor: scheduled next occurrence"
                );
            }
            None => {
                if job.is_recurring() {
                    tracing::warn!(
                        job_id = %job.id,
                        interval_days = ?job.interval_days,
                        "executor: recurring job has no valid interval, series ends"
                    );
                }
                self.store.persist_outcome(job.id, &outcome).await?;
            }
        }

        tracing::info!(
            job_id = %job.id,
            message_id = %sent.message_id,
            attempt = attempts,
            "executor: message sent"
        );

        self.emit(AuditRecord {
            job_id: job.id,
            session_ref: job.session_ref.clone(),
            destination: job.destination.clone(),
            content_summary: summarize(content.as_deref()),
            outcome: DeliveryOutcome::Sent,
            attempts,
            external_message_id: Some(sent.message_id.clone()),
            error: None,
            timestamp: now,
        })
        .await;

        Ok(Execution::Sent {
            message_id: sent.message_id,
            successor: successor.map(|next| next.id),
        })
    }

    async fn fail(
        &self,
        job: &Job,
        attempts: i32,
        content: Option<String>,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<Execution> {
        let settings = match self.settings.retry_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "executor: retry settings unavailable, using defaults");
                RetrySettings::default()
            }
        };

        let (outcome, execution) = match backoff::decide(attempts, &settings, now) {
            BackoffDecision::Retry { at, delay } => {
                tracing::warn!(
                    job_id = %job.id,
                    attempt = attempts,
                    max_attempts = settings.max_attempts,
                    retry_in_secs = delay.num_seconds(),
                    error = %error,
                    "executor: send failed, will retry"
                );
                (
                    AttemptOutcome {
                        status: JobStatus::Pending,
                        attempts,
                        attempted_at: now,
                        send_at: Some(at),
                        external_message_id: None,
                        last_error: Some(error.clone()),
                    },
                    Execution::Retrying {
                        attempts,
                        next_attempt_at: at,
                    },
                )
            }
            BackoffDecision::Exhausted => {
                tracing::error!(
                    job_id = %job.id,
                    attempt = attempts,
                    error = %error,
                    "executor: send failed, giving up"
                );
                (
                    AttemptOutcome {
                        status: JobStatus::Failed,
                        attempts,
                        attempted_at: now,
                        send_at: None,
                        external_message_id: None,
                        last_error: Some(error.clone()),
                    },
                    Execution::Failed {
                        attempts,
                        error: error.clone(),
                    },
                )
            }
        };

        self.store.persist_outcome(job.id, &outcome).await?;

        self.emit(AuditRecord {
            job_id: job.id,
            session_ref: job.session_ref.clone(),
            destination: job.destination.clone(),
            content_summary: summarize(content.as_deref()),
            outcome: DeliveryOutcome::Failed,
            attempts,
            external_message_id: None,
            error: Some(error),
            timestamp: now,
        })
        .await;

        Ok(execution)
    }

    async fn emit(&self, record: AuditRecord) {
        if let Err(e) = self.audit.record(&record).await {
            tracing::warn!(job_id = %record.job_id, error = %e, "executor: audit write failed");
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
