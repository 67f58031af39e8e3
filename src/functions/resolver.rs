use crate::error::Result;
use crate::schema::MessageRef;
use crate::services::TemplateProvider;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct MessageResolver {
    templates: Arc<dyn TemplateProvider>,
}

impl MessageResolver {
    pub fn new(templates: Arc<dyn TemplateProvider>) -> Self {
        Self { templates }
    }

    /// Final text for a message reference, or `None` when nothing usable is left.
    ///
    /// Templates are rendered at send time so edits reach jobs not yet sent.
    pub async fn resolve(&self, message: &MessageRef, now: DateTime<Utc>) -> Result<Option<String>> {
        if let Some(template_id) = message.template_id {
            match self.templates.resolve(template_id, now).await? {
                Some(text) if !text.trim().is_empty() => return Ok(Some(text)),
                Some(_) => {
                    tracing::debug!(%template_id, "resolver: template rendered empty");
                }
                None => {
                    tracing::warn!(%template_id, "resolver: template not found");
                }
            }
        }
        Ok(message.inline_text().map(ToString::to_string))
    }
}
