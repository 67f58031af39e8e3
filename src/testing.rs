//! In-memory stand-ins for the storage and messaging seams.

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::functions::{Admin, JobExecutor, MessageResolver, Scheduler};
use crate::schema::{
    AuditRecord, DeliveryLog, DeliveryOutcome, Job, JobStatus, MessageTemplate, RetrySettings,
    TemplateInput,
};
use crate::services::{
    AuditSink, Gateway, GatewayError, LogFilter, LogStats, LoggingSession, SentMessage, Session,
    SessionRegistry, SettingsProvider, TemplateProvider, render_template,
};
use crate::store::{AttemptOutcome, JobFilter, JobStats, JobStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::America::Sao_Paulo;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap()
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn job(&self, id: Uuid) -> Job {
        self.jobs.lock().unwrap().get(&id).cloned().unwrap()
    }

    pub fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by_key(|j| (j.scheduled_for, j.created_at));
        jobs
    }

    /// Make every call fail as if the database were down.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Internal("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn select_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        self.check()?;
        let mut due: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.send_at, j.id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.is_due(now) => {
                job.status = JobStatus::Processing;
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn persist_outcome(&self, id: Uuid, outcome: &AttemptOutcome) -> Result<()> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .filter(|j| j.status == JobStatus::Processing)
            .ok_or_else(|| Error::conflict(format!("schedule {id} is not processing")))?;
        job.status = outcome.status;
        job.attempts = outcome.attempts;
        job.last_attempt_at = Some(outcome.attempted_at);
        if let Some(send_at) = outcome.send_at {
            job.send_at = send_at;
        }
        job.external_message_id = outcome.external_message_id.clone();
        job.last_error = outcome.last_error.clone();
        job.updated_at = outcome.attempted_at;
        Ok(())
    }

    async fn insert(&self, job: &Job) -> Result<()> {
        self.check()?;
        self.put(job.clone());
        Ok(())
    }

    async fn select_stale(&self, claimed_before: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        self.check()?;
        let mut stale: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.updated_at < claimed_before)
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn reclaim_stale(
        &self,
        id: Uuid,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing && job.updated_at < claimed_before => {
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        self.check()?;
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.check()?;
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn stats(&self) -> Result<JobStats> {
        self.check()?;
        let mut stats = JobStats::default();
        for job in self.jobs.lock().unwrap().values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    async fn delete_pending(&self, id: Uuid) -> Result<bool> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.get(&id).is_some_and(|j| j.status == JobStatus::Pending) {
            jobs.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn update_pending(&self, job: &Job) -> Result<bool> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job.id) {
            Some(current) if current.status == JobStatus::Pending => {
                *current = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_due(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.send_at = now;
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub enum Scripted {
    Ok,
    Fail(&'static str),
    Panic,
}

/// Gateway that plays back a queue of results, then repeats `fallback`.
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Scripted>>,
    fallback_ok: bool,
    delay: Option<std::time::Duration>,
    calls: AtomicUsize,
    sent: Mutex<Vec<(String, String, String)>>,
}

impl ScriptedGateway {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::new(Vec::new(), true, None))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::new(Vec::new(), false, None))
    }

    pub fn scripted(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self::new(script, true, None))
    }

    pub fn slow(delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self::new(Vec::new(), true, Some(delay)))
    }

    fn new(script: Vec<Scripted>, fallback_ok: bool, delay: Option<std::time::Duration>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback_ok,
            delay,
            calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(session, destination, content)` of every call, in order.
    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Gateway for ScriptedGateway {
    async fn send(
        &self,
        session: &str,
        destination: &str,
        content: &str,
    ) -> std::result::Result<SentMessage, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent.lock().unwrap().push((
            session.to_string(),
            destination.to_string(),
            content.to_string(),
        ));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Ok) => {}
            Some(Scripted::Fail(reason)) => return Err(GatewayError::Rejected(reason.to_string())),
            Some(Scripted::Panic) => panic!("gateway blew up"),
            None if self.fallback_ok => {}
            None => return Err(GatewayError::Transport("connection refused".to_string())),
        }
        Ok(SentMessage {
            message_id: format!("msg-{call}"),
        })
    }
}

#[derive(Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    broken: AtomicBool,
}

impl RecordingAuditSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn broken() -> Arc<Self> {
        let sink = Self::default();
        sink.broken.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Internal("audit table missing".to_string()));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn history(&self, job_id: Uuid) -> Result<Vec<DeliveryLog>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.job_id == job_id)
            .map(as_log)
            .collect())
    }

    async fn list(&self, filter: &LogFilter) -> Result<Vec<DeliveryLog>> {
        let logs: Vec<DeliveryLog> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|r| filter.outcome.is_none_or(|o| r.outcome == o))
            .filter(|r| {
                filter
                    .session_ref
                    .as_deref()
                    .is_none_or(|s| r.session_ref == s)
            })
            .map(as_log)
            .collect();
        Ok(logs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn stats(&self) -> Result<LogStats> {
        let records = self.records.lock().unwrap();
        let sent = records
            .iter()
            .filter(|r| r.outcome == DeliveryOutcome::Sent)
            .count() as i64;
        Ok(LogStats::new(sent, records.len() as i64 - sent))
    }
}

fn as_log(r: &AuditRecord) -> DeliveryLog {
    DeliveryLog {
        id: Uuid::new_v4(),
        job_id: r.job_id,
        session_ref: r.session_ref.clone(),
        destination: r.destination.clone(),
        content_summary: r.content_summary.clone(),
        outcome: r.outcome.as_str().to_string(),
        attempts: r.attempts,
        external_message_id: r.external_message_id.clone(),
        error: r.error.clone(),
        created_at: r.timestamp,
    }
}

#[derive(Default)]
pub struct StaticTemplates {
    templates: Mutex<HashMap<Uuid, MessageTemplate>>,
}

impl StaticTemplates {
    pub fn with(mut self, id: Uuid, text: &str) -> Self {
        let template = TemplateInput {
            name: format!("template-{id}"),
            content: text.to_string(),
            variables: serde_json::json!({}),
        }
        .into_template(id, t0());
        self.templates.get_mut().unwrap().insert(id, template);
        self
    }
}

#[async_trait::async_trait]
impl TemplateProvider for StaticTemplates {
    async fn resolve(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self
            .templates
            .lock()
            .unwrap()
            .get(&id)
            .map(|t| render_template(&t.content, &t.variables, now, Sao_Paulo)))
    }

    async fn get(&self, id: Uuid) -> Result<Option<MessageTemplate>> {
        Ok(self.templates.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<MessageTemplate>> {
        let mut templates: Vec<MessageTemplate> =
            self.templates.lock().unwrap().values().cloned().collect();
        templates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(templates)
    }

    async fn insert(&self, template: &MessageTemplate) -> Result<()> {
        let mut templates = self.templates.lock().unwrap();
        if templates.values().any(|t| t.name == template.name) {
            return Err(Error::validation(format!(
                "a template named `{}` already exists",
                template.name
            )));
        }
        templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn update(&self, template: &MessageTemplate) -> Result<bool> {
        let mut templates = self.templates.lock().unwrap();
        if templates
            .values()
            .any(|t| t.name == template.name && t.id != template.id)
        {
            return Err(Error::validation(format!(
                "a template named `{}` already exists",
                template.name
            )));
        }
        match templates.get_mut(&template.id) {
            Some(current) => {
                current.name = template.name.clone();
                current.content = template.content.clone();
                current.variables = template.variables.clone();
                current.updated_at = template.updated_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.templates.lock().unwrap().remove(&id).is_some())
    }
}

#[derive(Default)]
pub struct StaticSettings {
    settings: Mutex<RetrySettings>,
    broken: AtomicBool,
}

impl StaticSettings {
    pub fn new(settings: RetrySettings) -> Arc<Self> {
        Arc::new(Self {
            settings: Mutex::new(settings),
            broken: AtomicBool::new(false),
        })
    }

    pub fn broken() -> Arc<Self> {
        let settings = Self::default();
        settings.broken.store(true, Ordering::SeqCst);
        Arc::new(settings)
    }
}

#[async_trait::async_trait]
impl SettingsProvider for StaticSettings {
    async fn retry_settings(&self) -> Result<RetrySettings> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Internal("settings table missing".to_string()));
        }
        Ok(self.settings.lock().unwrap().clone())
    }

    async fn update_retry_settings(&self, settings: &RetrySettings) -> Result<()> {
        *self.settings.lock().unwrap() = settings.clone();
        Ok(())
    }
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Admin operations wired over in-memory collaborators.
pub struct Harness {
    pub store: Arc<InMemoryJobStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub clock: Arc<ManualClock>,
    pub admin: Admin,
}

pub fn harness(templates: StaticTemplates) -> Harness {
    let store = InMemoryJobStore::new();
    let clock = ManualClock::at(t0());
    let gateway = ScriptedGateway::succeeding();
    let templates = Arc::new(templates);
    let settings = StaticSettings::new(RetrySettings::default());
    let audit = RecordingAuditSink::new();
    let executor = JobExecutor::new(
        store.clone(),
        MessageResolver::new(templates.clone()),
        gateway.clone(),
        settings.clone(),
        audit.clone(),
        clock.clone(),
    );
    let scheduler = Arc::new(
        Scheduler::new(
            store.clone(),
            executor,
            clock.clone(),
            SchedulerConfig::default(),
        )
        .unwrap(),
    );
    let sessions: Arc<dyn Session> = Arc::new(LoggingSession::new("main"));
    let admin = Admin::new(
        store.clone(),
        templates,
        settings,
        audit,
        scheduler,
        Arc::new(SessionRegistry::from_sessions([("main".to_string(), sessions)])),
        clock.clone(),
    );
    Harness {
        store,
        gateway,
        clock,
        admin,
    }
}
