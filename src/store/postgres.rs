use super::{AttemptOutcome, JobFilter, JobStats, JobStore};
use crate::error::{Error, Result};
use crate::schema::{Job, JobKind, JobStatus, MessageRef};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const JOB_COLUMNS: &str = r#"
    id, session_ref, destination, template_id, custom_message, kind, interval_days,
    send_at, scheduled_for, status, attempts, last_attempt_at, external_message_id,
    last_error, created_at, updated_at
"#;

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    session_ref: String,
    destination: String,
    template_id: Option<Uuid>,
    custom_message: Option<String>,
    kind: String,
    interval_days: Option<i32>,
    send_at: DateTime<Utc>,
    scheduled_for: DateTime<Utc>,
    status: String,
    attempts: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    external_message_id: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let kind: JobKind = row
            .kind
            .parse()
            .map_err(|e| Error::Internal(format!("schedule {}: {e}", row.id)))?;
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e| Error::Internal(format!("schedule {}: {e}", row.id)))?;

        Ok(Job {
            id: row.id,
            session_ref: row.session_ref,
            destination: row.destination,
            message: MessageRef {
                template_id: row.template_id,
                text: row.custom_message,
            },
            kind,
            interval_days: row.interval_days,
            send_at: row.send_at,
            scheduled_for: row.scheduled_for,
            status,
            attempts: row.attempts,
            last_attempt_at: row.last_attempt_at,
            external_message_id: row.external_message_id,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_tx(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
                id, session_ref, destination, template_id, custom_message, kind, interval_days,
                send_at, scheduled_for, status, attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id)
        .bind(&job.session_ref)
        .bind(&job.destination)
        .bind(job.message.template_id)
        .bind(&job.message.text)
        .bind(job.kind.as_str())
        .bind(job.interval_days)
        .bind(job.send_at)
        .bind(job.scheduled_for)
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn persist_tx(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        outcome: &AttemptOutcome,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE schedules
            SET status = $2,
                attempts = $3,
                last_attempt_at = $4,
                send_at = COALESCE($5, send_at),
                external_message_id = $6,
                last_error = $7,
                updated_at = $4
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(outcome.attempts)
        .bind(outcome.attempted_at)
        .bind(outcome.send_at)
        .bind(&outcome.external_message_id)
        .bind(&outcome.last_error)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Error::conflict(format!("schedule {id} is not processing")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for PgJobStore {
    async fn select_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM schedules
            WHERE status = 'pending' AND send_at <= $1
            ORDER BY send_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE schedules SET status = 'processing', updated_at = $2
            WHERE id = $1 AND status = 'pending' AND send_at <= $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn persist_outcome(&self, id: Uuid, outcome: &AttemptOutcome) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::persist_tx(&mut tx, id, outcome).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert(&self, job: &Job) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_tx(&mut tx, job).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn complete_with_successor(
        &self,
        id: Uuid,
        outcome: &AttemptOutcome,
        successor: &Job,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::persist_tx(&mut tx, id, outcome).await?;
        Self::insert_tx(&mut tx, successor).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn select_stale(&self, claimed_before: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM schedules
            WHERE status = 'processing' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(claimed_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn reclaim_stale(
        &self,
        id: Uuid,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE schedules SET updated_at = $3
            WHERE id = $1 AND status = 'processing' AND updated_at < $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(claimed_before)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM schedules
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(filter.status.map(JobStatus::as_str))
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn stats(&self) -> Result<JobStats> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*)::bigint FROM schedules GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            let status: JobStatus = status.parse().map_err(Error::Internal)?;
            stats.record(status, count);
        }
        Ok(stats)
    }

    async fn delete_pending(&self, id: Uuid) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM schedules WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }

    async fn update_pending(&self, job: &Job) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE schedules
            SET session_ref = $2,
                destination = $3,
                template_id = $4,
                custom_message = $5,
                kind = $6,
                interval_days = $7,
                send_at = $8,
                scheduled_for = $9,
                attempts = $10,
                last_attempt_at = $11,
                last_error = $12,
                updated_at = $13
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job.id)
        .bind(&job.session_ref)
        .bind(&job.destination)
        .bind(job.message.template_id)
        .bind(&job.message.text)
        .bind(job.kind.as_str())
        .bind(job.interval_days)
        .bind(job.send_at)
        .bind(job.scheduled_for)
        .bind(job.attempts)
        .bind(job.last_attempt_at)
        .bind(&job.last_error)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn force_due(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE schedules SET send_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NewJob;
    use chrono::Duration;

    /// Connects to `DATABASE_URL` and migrates, or `None` when no database is configured.
    async fn setup() -> Option<PgJobStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.unwrap();
        crate::db::migrate(&pool).await.unwrap();
        Some(PgJobStore::new(pool))
    }

    fn new_job(session: &str, send_at: DateTime<Utc>) -> Job {
        NewJob {
            session_ref: session.to_string(),
            destination: "5511999999999@c.us".to_string(),
            message: MessageRef::inline("bom dia"),
            kind: JobKind::Once,
            interval_days: None,
            send_at,
        }
        .into_pending(Utc::now())
    }

    #[tokio::test]
    async fn claim_succeeds_only_once() {
        let Some(store) = setup().await else { return };
        let now = Utc::now();
        let job = new_job("pg-claim", now - Duration::seconds(1));
        store.insert(&job).await.unwrap();

        let (a, b) = tokio::join!(store.claim(job.id, now), store.claim(job.id, now));
        assert!(a.unwrap().is_some() ^ b.unwrap().is_some());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn persisting_a_terminal_row_conflicts() {
        let Some(store) = setup().await else { return };
        let now = Utc::now();
        let job = new_job("pg-terminal", now - Duration::seconds(1));
        store.insert(&job).await.unwrap();
        assert!(store.claim(job.id, now).await.unwrap().is_some());

        let sent = AttemptOutcome {
            status: JobStatus::Sent,
            attempts: 1,
            attempted_at: now,
            send_at: None,
            external_message_id: Some("wamid.1".to_string()),
            last_error: None,
        };
        store.persist_outcome(job.id, &sent).await.unwrap();

        let again = store.persist_outcome(job.id, &sent).await;
        assert!(matches!(again, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn due_selection_skips_future_and_claimed_jobs() {
        let Some(store) = setup().await else { return };
        let now = Utc::now();
        let session = format!("pg-due-{}", Uuid::new_v4());
        let older = new_job(&session, now - Duration::minutes(5));
        let newer = new_job(&session, now - Duration::minutes(1));
        let future = new_job(&session, now + Duration::minutes(5));
        for job in [&newer, &future, &older] {
            store.insert(job).await.unwrap();
        }

        let due: Vec<Uuid> = store
            .select_due(now, 1000)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.session_ref == session)
            .map(|j| j.id)
            .collect();
        assert_eq!(due, vec![older.id, newer.id]);

        assert!(store.claim(older.id, now).await.unwrap().is_some());
        let due_after_claim = store
            .select_due(now, 1000)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.session_ref == session)
            .count();
        assert_eq!(due_after_claim, 1);
    }

    #[tokio::test]
    async fn successor_is_written_with_the_sent_outcome() {
        let Some(store) = setup().await else { return };
        let now = Utc::now();
        let mut job = new_job("pg-recurring", now - Duration::seconds(1));
        job.kind = JobKind::Recurring;
        job.interval_days = Some(7);
        store.insert(&job).await.unwrap();
        let claimed = store.claim(job.id, now).await.unwrap().unwrap();

        let successor = crate::functions::recurrence::next_occurrence(&claimed, now).unwrap();
        let sent = AttemptOutcome {
            status: JobStatus::Sent,
            attempts: 1,
            attempted_at: now,
            send_at: None,
            external_message_id: Some("wamid.2".to_string()),
            last_error: None,
        };
        store
            .complete_with_successor(job.id, &sent, &successor)
            .await
            .unwrap();

        let next = store.get(successor.id).await.unwrap().unwrap();
        assert_eq!(next.status, JobStatus::Pending);
        assert_eq!(next.interval_days, Some(7));

        // a second completion must not leave a stray successor behind
        let stray = crate::functions::recurrence::next_occurrence(&claimed, now).unwrap();
        assert!(store.complete_with_successor(job.id, &sent, &stray).await.is_err());
        assert!(store.get(stray.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_pending_rows_are_rewritten() {
        let Some(store) = setup().await else { return };
        let now = Utc::now();
        let job = new_job("pg-update", now - Duration::seconds(1));
        store.insert(&job).await.unwrap();

        let mut edited = job.clone();
        edited.destination = "5547988887777@c.us".to_string();
        edited.send_at = now + Duration::hours(2);
        edited.scheduled_for = edited.send_at;
        assert!(store.update_pending(&edited).await.unwrap());
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.destination, edited.destination);
        assert_eq!(stored.scheduled_for, stored.send_at);

        store.force_due(job.id, now).await.unwrap();
        assert!(store.claim(job.id, now).await.unwrap().is_some());
        assert!(!store.update_pending(&edited).await.unwrap());
    }

    #[tokio::test]
    async fn stale_claims_are_reclaimed_once() {
        let Some(store) = setup().await else { return };
        let claimed_at = Utc::now() - Duration::minutes(10);
        let job = new_job("pg-stale", claimed_at - Duration::seconds(1));
        store.insert(&job).await.unwrap();
        assert!(store.claim(job.id, claimed_at).await.unwrap().is_some());

        let now = Utc::now();
        let cutoff = now - Duration::minutes(2);
        let stale = store.select_stale(cutoff, 1000).await.unwrap();
        assert!(stale.iter().any(|j| j.id == job.id));

        let (a, b) = tokio::join!(
            store.reclaim_stale(job.id, cutoff, now),
            store.reclaim_stale(job.id, cutoff, now)
        );
        assert!(a.unwrap().is_some() ^ b.unwrap().is_some());
    }
}
