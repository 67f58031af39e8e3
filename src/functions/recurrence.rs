use crate::schema::{Job, JobKind, JobStatus};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Next occurrence of a recurring job that has just been sent.
///
/// The successor is due `interval_days` after the original scheduled time, not
/// after the actual send, so retries never shift the series.
pub fn next_occurrence(job: &Job, now: DateTime<Utc>) -> Option<Job> {
    if job.kind != JobKind::Recurring {
        return None;
    }
    let days = job.interval_days.filter(|d| *d >= 1)?;
    let send_at = job
        .scheduled_for
        .checked_add_signed(Duration::days(i64::from(days)))?;

    Some(Job {
        id: Uuid::new_v4(),
        session_ref: job.session_ref.clone(),
        destination: job.destination.clone(),
        message: job.message.clone(),
        kind: JobKind::Recurring,
        interval_days: Some(days),
        send_at,
        scheduled_for: send_at,
        status: JobStatus::Pending,
        attempts: 0,
        last_attempt_at: None,
        external_message_id: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    })
}
