//! Persistence of scheduled jobs.
//!
//! The conditional claim (`pending` → `processing` only while still
//! `pending`) is the only concurrency guard in the system: whoever wins the
//! claim owns the attempt, everyone else skips the job.

mod postgres;

pub use postgres::PgJobStore;

use crate::error::Result;
use crate::schema::{Job, JobStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Result of one execution attempt, written back by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub status: JobStatus,
    pub attempts: i32,
    pub attempted_at: DateTime<Utc>,
    /// New eligibility time when the job goes back to `pending`.
    pub send_at: Option<DateTime<Utc>>,
    pub external_message_id: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Sent => self.sent += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    #[cfg(test)]
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.sent + self.failed
    }
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Pending jobs with `send_at <= now`, oldest-due first.
    async fn select_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// Atomically move a job from `pending` to `processing`.
    ///
    /// Succeeds only while the job is still pending and due at `now`; returns
    /// the row as claimed, or `None` when someone else got there first.
    async fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Write the result of an attempt on a job this process has claimed.
    ///
    /// Fails with [`crate::error::Error::Conflict`] when the job is not in
    /// `processing`, so terminal rows are never rewritten.
    async fn persist_outcome(&self, id: Uuid, outcome: &AttemptOutcome) -> Result<()>;

    async fn insert(&self, job: &Job) -> Result<()>;

    async fn insert_recurrence(&self, job: &Job) -> Result<()> {
        self.insert(job).await
    }

    /// Mark a job `sent` and insert its next occurrence.
    async fn complete_with_successor(
        &self,
        id: Uuid,
        outcome: &AttemptOutcome,
        successor: &Job,
    ) -> Result<()> {
        self.persist_outcome(id, outcome).await?;
        self.insert_recurrence(successor).await
    }

    /// Jobs left in `processing` since before `claimed_before`.
    async fn select_stale(&self, claimed_before: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// Take over a stale `processing` job. Only one caller can win.
    async fn reclaim_stale(
        &self,
        id: Uuid,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Jobs ordered by creation time, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn stats(&self) -> Result<JobStats>;

    /// Delete a job only while it is still `pending`.
    async fn delete_pending(&self, id: Uuid) -> Result<bool>;

    /// Rewrite what, where and when of a job only while it is still `pending`.
    async fn update_pending(&self, job: &Job) -> Result<bool>;

    /// Set `send_at = now` on a job only while it is still `pending`.
    async fn force_due(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;
}
