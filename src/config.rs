use crate::error::{Error, Result};
use chrono_tz::Tz;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_TICK_SECS: u64 = 60;
const DEFAULT_BATCH_LIMIT: i64 = 50;
const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Sao_Paulo;
const DEFAULT_COUNTRY_CODE: &str = "55";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub http_addr: SocketAddr,
    /// Zone used for the date and time placeholders in templates.
    pub timezone: Tz,
    pub scheduler: SchedulerConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub batch_limit: i64,
    /// How long a job may sit in `processing` before it counts as a crashed attempt.
    pub stale_after: Duration,
    /// One concurrent worker per session instead of a single sequential pass.
    pub session_parallelism: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let tick_interval = Duration::from_secs(DEFAULT_TICK_SECS);
        Self {
            tick_interval,
            batch_limit: DEFAULT_BATCH_LIMIT,
            stale_after: tick_interval * 2,
            session_parallelism: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
    pub sessions: Vec<String>,
    pub fake_send: bool,
    /// Prefixed to bare phone numbers that do not already start with it.
    pub country_code: Option<String>,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| split_list(&v))
        .unwrap_or_default()
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| Error::Config("DATABASE_URL not set".to_string()))?;

        let http_addr = std::env::var("HERALD_HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let http_addr = http_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid HERALD_HTTP_ADDR `{http_addr}`: {e}")))?;

        let tick_secs: u64 = env_parse("HERALD_TICK_INTERVAL_SECS").unwrap_or(DEFAULT_TICK_SECS);
        if tick_secs == 0 {
            return Err(Error::Config(
                "HERALD_TICK_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        let tick_interval = Duration::from_secs(tick_secs);
        let stale_after = env_parse("HERALD_STALE_AFTER_SECS")
            .map(Duration::from_secs)
            .unwrap_or(tick_interval * 2);

        let scheduler = SchedulerConfig {
            tick_interval,
            batch_limit: env_parse::<i64>("HERALD_BATCH_LIMIT")
                .unwrap_or(DEFAULT_BATCH_LIMIT)
                .max(1),
            stale_after,
            session_parallelism: env_flag("HERALD_SESSION_PARALLELISM").unwrap_or(true),
        };

        let timezone = match std::env::var("HERALD_TIMEZONE") {
            Ok(raw) => raw
                .trim()
                .parse::<Tz>()
                .map_err(|_| Error::Config(format!("invalid HERALD_TIMEZONE `{raw}`")))?,
            Err(_) => DEFAULT_TIMEZONE,
        };

        let country_code = std::env::var("HERALD_COUNTRY_CODE")
            .unwrap_or_else(|_| DEFAULT_COUNTRY_CODE.to_string());
        let country_code = Some(country_code.trim().to_string()).filter(|c| !c.is_empty());

        let gateway = GatewayConfig {
            base_url: std::env::var("HERALD_GATEWAY_URL").ok(),
            token: std::env::var("HERALD_GATEWAY_TOKEN").ok(),
            timeout: Duration::from_secs(env_parse("HERALD_GATEWAY_TIMEOUT_SECS").unwrap_or(30)),
            sessions: env_list("HERALD_SESSIONS"),
            fake_send: env_flag("HERALD_FAKE_SEND").unwrap_or(false),
            country_code,
        };

        let config = Self {
            database_url,
            db_max_connections: env_parse("HERALD_DB_MAX_CONNECTIONS").unwrap_or(10),
            http_addr,
            timezone,
            scheduler,
            gateway,
        };
        config.validate()?;
        Ok(config)
    }

    /// A send may spend one gateway timeout on the status check and another on
    /// the message itself; stale recovery must not fire while that is running.
    pub fn validate(&self) -> Result<()> {
        let slowest_send = self.gateway.timeout * 2;
        if self.scheduler.stale_after <= slowest_send {
            return Err(Error::Config(format!(
                "HERALD_STALE_AFTER_SECS ({}s) must exceed twice HERALD_GATEWAY_TIMEOUT_SECS ({}s)",
                self.scheduler.stale_after.as_secs(),
                self.gateway.timeout.as_secs()
            )));
        }
        Ok(())
    }
}
