use crate::error::{Error, Result};
use crate::schema::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_INTERVALS, RetrySettings};
use serde_json::Value;
use sqlx::PgPool;

const MAX_ATTEMPTS_KEY: &str = "max_attempts";
const RETRY_INTERVALS_KEY: &str = "retry_intervals";

#[async_trait::async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Current retry policy. Called for every backoff decision, never cached.
    async fn retry_settings(&self) -> Result<RetrySettings>;

    async fn update_retry_settings(&self, settings: &RetrySettings) -> Result<()>;
}

fn parse_max_attempts(value: Option<&Value>) -> i32 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) => n.clamp(1, i64::from(i32::MAX)) as i32,
        None => DEFAULT_MAX_ATTEMPTS,
    }
}

fn parse_retry_intervals(value: Option<&Value>) -> Vec<u64> {
    let value = match value {
        // stored as a JSON string holding the array in older rows
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).ok(),
        other => other.cloned(),
    };
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_u64).collect(),
        _ => DEFAULT_RETRY_INTERVALS.to_vec(),
    }
}

pub fn parse_retry_settings(max_attempts: Option<&Value>, intervals: Option<&Value>) -> RetrySettings {
    RetrySettings::new(
        parse_max_attempts(max_attempts),
        parse_retry_intervals(intervals),
    )
}

#[derive(Debug, Clone)]
pub struct PgSettings {
    pool: PgPool,
}

impl PgSettings {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SettingsProvider for PgSettings {
    async fn retry_settings(&self) -> Result<RetrySettings> {
        let rows = sqlx::query_as::<_, (String, Value)>(
            "SELECT key, value FROM settings WHERE key = ANY($1)",
        )
        .bind(vec![MAX_ATTEMPTS_KEY.to_string(), RETRY_INTERVALS_KEY.to_string()])
        .fetch_all(&self.pool)
        .await?;

        let lookup = |key: &str| rows.iter().find(|(k, _)| k == key).map(|(_, v)| v);
        Ok(parse_retry_settings(
            lookup(MAX_ATTEMPTS_KEY),
            lookup(RETRY_INTERVALS_KEY),
        ))
    }

    async fn update_retry_settings(&self, settings: &RetrySettings) -> Result<()> {
        if settings.max_attempts < 1 {
            return Err(Error::validation("max_attempts must be at least 1"));
        }

        let mut tx = self.pool.begin().await?;
        for (key, value) in [
            (MAX_ATTEMPTS_KEY, serde_json::json!(settings.max_attempts)),
            (RETRY_INTERVALS_KEY, serde_json::json!(settings.retry_intervals)),
        ] {
            sqlx::query(
                r#"
                INSERT INTO settings (key, value, updated_at)
                VALUES ($1, $2, now())
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(
            max_attempts = settings.max_attempts,
            retry_intervals = ?settings.retry_intervals,
            "settings: retry policy updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_values_use_defaults() {
        assert_eq!(parse_retry_settings(None, None), RetrySettings::default());
    }

    #[test]
    fn accepts_numbers_and_numeric_strings() {
        let settings = parse_retry_settings(Some(&json!("5")), Some(&json!([10, 20])));
        assert_eq!(settings, RetrySettings::new(5, vec![10, 20]));

        let settings = parse_retry_settings(Some(&json!(2)), Some(&json!("[15, 45]")));
        assert_eq!(settings, RetrySettings::new(2, vec![15, 45]));
    }

    #[test]
    fn non_positive_max_attempts_is_clamped() {
        let settings = parse_retry_settings(Some(&json!(0)), None);
        assert_eq!(settings.max_attempts, 1);
        let settings = parse_retry_settings(Some(&json!(-4)), None);
        assert_eq!(settings.max_attempts, 1);
    }

    #[test]
    fn empty_interval_list_is_kept() {
        // an empty list is a valid setting; the backoff policy owns the fallback
        let settings = parse_retry_settings(None, Some(&json!([])));
        assert!(settings.retry_intervals.is_empty());
    }

    #[test]
    fn malformed_values_fall_back() {
        let settings = parse_retry_settings(Some(&json!({"n": 1})), Some(&json!("nope")));
        assert_eq!(settings, RetrySettings::default());
    }
}
