use crate::error::Result;
use crate::schema::{AuditRecord, DeliveryLog, DeliveryOutcome};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

const SUMMARY_CHARS: usize = 120;
pub const UNRESOLVED_SUMMARY: &str = "<unresolved>";

/// Receives one record per execution attempt.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;

    /// Attempts recorded for a job, oldest first.
    async fn history(&self, job_id: Uuid) -> Result<Vec<DeliveryLog>>;

    /// Attempts across all jobs, newest first.
    async fn list(&self, filter: &LogFilter) -> Result<Vec<DeliveryLog>>;

    async fn stats(&self) -> Result<LogStats>;
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub outcome: Option<DeliveryOutcome>,
    pub session_ref: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LogStats {
    pub total: i64,
    pub sent: i64,
    pub failed: i64,
    /// Percentage of attempts that were sent, two decimals.
    pub success_rate: f64,
}

impl LogStats {
    pub fn new(sent: i64, failed: i64) -> Self {
        let total = sent + failed;
        let success_rate = if total > 0 {
            (sent as f64 * 10_000.0 / total as f64).round() / 100.0
        } else {
            0.0
        };
        Self {
            total,
            sent,
            failed,
            success_rate,
        }
    }
}

/// At most `SUMMARY_CHARS` characters, ellipsis included.
pub fn summarize(content: Option<&str>) -> String {
    match content {
        Some(text) if text.chars().count() > SUMMARY_CHARS => {
            let mut summary: String = text.chars().take(SUMMARY_CHARS - 1).collect();
            summary.push('…');
            summary
        }
        Some(text) => text.to_string(),
        None => UNRESOLVED_SUMMARY.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_logs (
                id, job_id, session_ref, destination, content_summary, outcome,
                attempts, external_message_id, error, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.job_id)
        .bind(&record.session_ref)
        .bind(&record.destination)
        .bind(&record.content_summary)
        .bind(record.outcome.as_str())
        .bind(record.attempts)
        .bind(&record.external_message_id)
        .bind(&record.error)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn history(&self, job_id: Uuid) -> Result<Vec<DeliveryLog>> {
        let logs = sqlx::query_as::<_, DeliveryLog>(
            r#"
            SELECT id, job_id, session_ref, destination, content_summary, outcome,
                   attempts, external_message_id, error, created_at
            FROM delivery_logs
            WHERE job_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    async fn list(&self, filter: &LogFilter) -> Result<Vec<DeliveryLog>> {
        let logs = sqlx::query_as::<_, DeliveryLog>(
            r#"
            SELECT id, job_id, session_ref, destination, content_summary, outcome,
                   attempts, external_message_id, error, created_at
            FROM delivery_logs
            WHERE ($1::text IS NULL OR outcome = $1)
              AND ($2::text IS NULL OR session_ref = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.outcome.map(DeliveryOutcome::as_str))
        .bind(&filter.session_ref)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    async fn stats(&self) -> Result<LogStats> {
        let (sent, failed) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT COUNT(*) FILTER (WHERE outcome = 'sent')::bigint,
                   COUNT(*) FILTER (WHERE outcome = 'failed')::bigint
            FROM delivery_logs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(LogStats::new(sent, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_are_truncated() {
        let long = "a".repeat(200);
        let summary = summarize(Some(&long));
        assert_eq!(summary.chars().count(), SUMMARY_CHARS);
        assert!(summary.ends_with('…'));

        let exact = "b".repeat(SUMMARY_CHARS);
        assert_eq!(summarize(Some(&exact)), exact);

        assert_eq!(summarize(Some("short")), "short");
        assert_eq!(summarize(None), UNRESOLVED_SUMMARY);
    }

    #[test]
    fn success_rate_is_a_rounded_percentage() {
        assert_eq!(LogStats::new(2, 1).success_rate, 66.67);
        assert_eq!(LogStats::new(3, 0).success_rate, 100.0);
        assert_eq!(LogStats::new(0, 0), LogStats::default());
        assert_eq!(LogStats::new(1, 3).total, 4);
    }
}
