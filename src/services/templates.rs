use crate::error::{Error, Result};
use crate::schema::MessageTemplate;
use chrono::{DateTime, Datelike, Utc, Weekday};
use chrono_tz::Tz;
use sqlx::PgPool;
use uuid::Uuid;

const TEMPLATE_COLUMNS: &str = "id, name, content, variables, created_at, updated_at";

#[async_trait::async_trait]
pub trait TemplateProvider: Send + Sync {
    /// Rendered text of a template, or `None` when it no longer exists.
    async fn resolve(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<String>>;

    async fn get(&self, id: Uuid) -> Result<Option<MessageTemplate>>;

    async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    /// Templates ordered by creation time, newest first.
    async fn list(&self) -> Result<Vec<MessageTemplate>>;

    /// Fails with [`Error::Validation`] when the name is already taken.
    async fn insert(&self, template: &MessageTemplate) -> Result<()>;

    /// Replace name, content and variables. `false` when the template is gone.
    async fn update(&self, template: &MessageTemplate) -> Result<bool>;

    /// Jobs still pointing at a deleted template fall back to their inline text.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "segunda-feira",
        Weekday::Tue => "terça-feira",
        Weekday::Wed => "quarta-feira",
        Weekday::Thu => "quinta-feira",
        Weekday::Fri => "sexta-feira",
        Weekday::Sat => "sábado",
        Weekday::Sun => "domingo",
    }
}

/// Replace `{data}`, `{hora}` and `{dia_semana}` with `now` in `timezone`,
/// then each `{key}` from `variables`.
pub fn render_template(
    content: &str,
    variables: &serde_json::Value,
    now: DateTime<Utc>,
    timezone: Tz,
) -> String {
    let local = now.with_timezone(&timezone);
    let mut rendered = content
        .replace("{data}", &local.format("%d/%m/%Y").to_string())
        .replace("{hora}", &local.format("%H:%M:%S").to_string())
        .replace("{dia_semana}", weekday_name(local.weekday()));

    if let Some(vars) = variables.as_object() {
        for (key, value) in vars {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&format!("{{{key}}}"), &value);
        }
    }

    rendered
}

fn name_taken(err: sqlx::Error, name: &str) -> Error {
    if let sqlx::Error::Database(db) = &err
        && db.is_unique_violation()
    {
        return Error::validation(format!("a template named `{name}` already exists"));
    }
    err.into()
}

#[derive(Debug, Clone)]
pub struct PgTemplateProvider {
    pool: PgPool,
    timezone: Tz,
}

impl PgTemplateProvider {
    pub fn new(pool: PgPool, timezone: Tz) -> Self {
        Self { pool, timezone }
    }
}

#[async_trait::async_trait]
impl TemplateProvider for PgTemplateProvider {
    async fn resolve(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self
            .get(id)
            .await?
            .map(|t| render_template(&t.content, &t.variables, now, self.timezone)))
    }

    async fn get(&self, id: Uuid) -> Result<Option<MessageTemplate>> {
        let template = sqlx::query_as::<_, MessageTemplate>(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM message_templates WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(template)
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        let found = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM message_templates WHERE id = $1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn list(&self) -> Result<Vec<MessageTemplate>> {
        let templates = sqlx::query_as::<_, MessageTemplate>(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM message_templates ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(templates)
    }

    async fn insert(&self, template: &MessageTemplate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO message_templates (id, name, content, variables, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(&template.content)
        .bind(&template.variables)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| name_taken(e, &template.name))?;
        Ok(())
    }

    async fn update(&self, template: &MessageTemplate) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE message_templates
            SET name = $2, content = $3, variables = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(&template.content)
        .bind(&template.variables)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| name_taken(e, &template.name))?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM message_templates WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }
}
