use crate::config::GatewayConfig;
use crate::error::Error as AppError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session `{0}` is not registered")]
    UnknownSession(String),
    #[error("session `{session}` is {status}")]
    NotConnected {
        session: String,
        status: SessionStatus,
    },
    #[error("gateway rejected message: {0}")]
    Rejected(String),
    #[error("gateway transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

/// The only capability the dispatch core needs from the messaging side.
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    async fn send(
        &self,
        session: &str,
        destination: &str,
        content: &str,
    ) -> Result<SentMessage, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SessionStatus::Connected => "connected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Disconnected => "disconnected",
        })
    }
}

/// One live messaging session. Pairing, QR codes and chat listing stay behind
/// whatever implements this.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    async fn status(&self) -> SessionStatus;
    async fn send(&self, destination: &str, content: &str) -> Result<SentMessage, GatewayError>;
    async fn disconnect(&self) -> Result<(), GatewayError>;
}

/// Sessions keyed by name, exposed to the core as a [`Gateway`].
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
    country_code: Option<String>,
}

impl SessionRegistry {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sessions(sessions: impl IntoIterator<Item = (String, Arc<dyn Session>)>) -> Self {
        Self {
            sessions: RwLock::new(sessions.into_iter().collect()),
            country_code: None,
        }
    }

    pub fn with_country_code(mut self, country_code: Option<String>) -> Self {
        self.country_code = country_code;
        self
    }

    /// One session per configured name, either bridged over HTTP or fake.
    pub fn from_config(config: &GatewayConfig) -> crate::error::Result<Self> {
        let mut sessions: Vec<(String, Arc<dyn Session>)> = Vec::new();
        for name in &config.sessions {
            let session: Arc<dyn Session> = match (&config.base_url, config.fake_send) {
                (_, true) => Arc::new(LoggingSession::new(name)),
                (Some(base_url), false) => Arc::new(
                    HttpSession::new(base_url, name, config.token.clone(), config.timeout)
                        .map_err(|e| AppError::Config(format!("session `{name}`: {e}")))?,
                ),
                (None, false) => {
                    return Err(AppError::Config(format!(
                        "session `{name}` needs HERALD_GATEWAY_URL or HERALD_FAKE_SEND=true"
                    )));
                }
            };
            sessions.push((name.clone(), session));
        }

        if sessions.is_empty() {
            tracing::warn!("gateway: no sessions configured, every send will fail");
        } else {
            tracing::info!(
                sessions = ?config.sessions,
                fake_send = config.fake_send,
                "gateway: sessions registered"
            );
        }
        Ok(Self::from_sessions(sessions).with_country_code(config.country_code.clone()))
    }

    #[cfg(test)]
    pub async fn register(&self, name: impl Into<String>, session: Arc<dyn Session>) {
        self.sessions.write().await.insert(name.into(), session);
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn status(&self, name: &str) -> Option<SessionStatus> {
        let session = self.sessions.read().await.get(name).cloned()?;
        Some(session.status().await)
    }

    pub async fn disconnect(&self, name: &str) -> Result<(), GatewayError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(name)
            .ok_or_else(|| GatewayError::UnknownSession(name.to_string()))?;
        session.disconnect().await
    }
}

#[async_trait::async_trait]
impl Gateway for SessionRegistry {
    async fn send(
        &self,
        session: &str,
        destination: &str,
        content: &str,
    ) -> Result<SentMessage, GatewayError> {
        // clone the handle out so a slow send never holds the registry lock
        let handle = self
            .sessions
            .read()
            .await
            .get(session)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownSession(session.to_string()))?;

        let status = handle.status().await;
        if status != SessionStatus::Connected {
            return Err(GatewayError::NotConnected {
                session: session.to_string(),
                status,
            });
        }

        let destination = normalize_destination(destination, self.country_code.as_deref())?;
        handle.send(&destination, content).await
    }
}

fn is_group_id(id: &str) -> bool {
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    id.split_once('-')
        .is_some_and(|(creator, created)| all_digits(creator) && all_digits(created))
}

/// Turn a destination into a chat id.
///
/// Anything already carrying a domain is kept. Group ids (`<creator>-<ts>`)
/// become `@g.us`; everything else is reduced to its digits, prefixed with
/// `country_code` when missing, and becomes `@c.us`.
pub fn normalize_destination(
    destination: &str,
    country_code: Option<&str>,
) -> Result<String, GatewayError> {
    let trimmed = destination.trim();
    if trimmed.contains('@') {
        return Ok(trimmed.to_string());
    }
    if is_group_id(trimmed) {
        return Ok(format!("{trimmed}@g.us"));
    }

    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(GatewayError::Rejected(format!(
            "destination `{trimmed}` has no phone number"
        )));
    }
    match country_code {
        Some(code) if !digits.starts_with(code) => Ok(format!("{code}{digits}@c.us")),
        _ => Ok(format!("{digits}@c.us")),
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: SessionStatus,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
    error: Option<String>,
}

/// Session backed by an external HTTP messaging bridge.
pub struct HttpSession {
    client: reqwest::Client,
    base_url: String,
    name: String,
    token: Option<String>,
}

impl HttpSession {
    pub fn new(
        base_url: impl Into<String>,
        name: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            name: name.into(),
            token,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/sessions/{}{suffix}", self.base_url, self.name)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl Session for HttpSession {
    async fn status(&self) -> SessionStatus {
        let response = self.authorize(self.client.get(self.url("/status"))).send().await;
        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!(session = %self.name, status = %r.status(), "gateway: status check rejected");
                return SessionStatus::Disconnected;
            }
            Err(e) => {
                tracing::warn!(session = %self.name, error = %e, "gateway: status check failed");
                return SessionStatus::Disconnected;
            }
        };
        match response.json::<StatusResponse>().await {
            Ok(body) => body.status,
            Err(e) => {
                tracing::warn!(session = %self.name, error = %e, "gateway: unreadable status");
                SessionStatus::Disconnected
            }
        }
    }

    async fn send(&self, destination: &str, content: &str) -> Result<SentMessage, GatewayError> {
        let body = serde_json::json!({ "to": destination, "text": content });
        let response = self
            .authorize(self.client.post(self.url("/messages")))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("{status}: {body}")));
        }

        let body: SendResponse = response.json().await?;
        match (body.id, body.error) {
            (Some(id), _) if !id.is_empty() => Ok(SentMessage { message_id: id }),
            (_, Some(error)) => Err(GatewayError::Rejected(error)),
            _ => Err(GatewayError::Rejected(
                "gateway returned no message id".to_string(),
            )),
        }
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        let response = self.authorize(self.client.delete(self.url(""))).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Rejected(format!(
                "disconnect returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Fake-send session: logs the message and returns a synthetic id.
pub struct LoggingSession {
    name: String,
}

impl LoggingSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait::async_trait]
impl Session for LoggingSession {
    async fn status(&self) -> SessionStatus {
        SessionStatus::Connected
    }

    async fn send(&self, destination: &str, content: &str) -> Result<SentMessage, GatewayError> {
        let message_id = format!("fake_{}", Uuid::new_v4().as_simple());
        tracing::info!(
            session = %self.name,
            destination,
            chars = content.chars().count(),
            message_id = %message_id,
            "gateway: fake send"
        );
        Ok(SentMessage { message_id })
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}
