use super::executor::{Execution, JobExecutor, panic_message};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::store::JobStore;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub selected: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    pub recovered: usize,
}

impl TickSummary {
    fn record(&mut self, execution: &Execution) {
        match execution {
            Execution::Skipped => self.skipped += 1,
            Execution::Sent { .. } => self.sent += 1,
            Execution::Retrying { .. } => self.retried += 1,
            Execution::Failed { .. } => self.failed += 1,
        }
    }

    fn merge(&mut self, other: TickSummary) {
        self.selected += other.selected;
        self.sent += other.sent;
        self.retried += other.retried;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.recovered += other.recovered;
    }

    pub fn is_empty(&self) -> bool {
        *self == TickSummary::default()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub tick_interval_secs: u64,
    pub batch_limit: i64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_summary: Option<TickSummary>,
    pub last_error: Option<String>,
    pub next_tick_at: Option<DateTime<Utc>>,
}

/// Periodically selects due jobs and drives them through the executor.
///
/// Ticks never overlap: the next one starts only after the current one has
/// finished, however long it took.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    executor: JobExecutor,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    stale_after: TimeDelta,
    status: Mutex<SchedulerStatus>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: JobExecutor,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let stale_after = TimeDelta::from_std(config.stale_after)
            .map_err(|e| Error::Config(format!("stale threshold out of range: {e}")))?;
        let status = SchedulerStatus {
            tick_interval_secs: config.tick_interval.as_secs(),
            batch_limit: config.batch_limit,
            ..SchedulerStatus::default()
        };
        Ok(Self {
            store,
            executor,
            clock,
            config,
            stale_after,
            status: Mutex::new(status),
        })
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_status(&self, f: impl FnOnce(&mut SchedulerStatus)) {
        f(&mut self.status.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Run ticks until `shutdown` fires. A tick in progress is allowed to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.update_status(|s| s.running = true);
        tracing::info!(
            tick_secs = self.config.tick_interval.as_secs(),
            batch_limit = self.config.batch_limit,
            session_parallelism = self.config.session_parallelism,
            "scheduler: started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match AssertUnwindSafe(self.tick()).catch_unwind().await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::error!(error = %e, "scheduler: tick failed"),
                        Err(panic) => {
                            let message = panic_message(&*panic);
                            tracing::error!(error = %message, "scheduler: tick panicked");
                            self.update_status(|s| s.last_error = Some(message));
                        }
                    }
                }
            }
        }

        self.update_status(|s| {
            s.running = false;
            s.next_tick_at = None;
        });
        tracing::info!("scheduler: stopped");
    }

    /// One pass: recover stale claims, then process the due batch.
    pub async fn tick(&self) -> Result<TickSummary> {
        let started_at = self.clock.now();
        let result = self.process(started_at).await;

        let next_tick_at = TimeDelta::from_std(self.config.tick_interval)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d));
        self.update_status(|s| {
            s.last_tick_at = Some(started_at);
            s.next_tick_at = next_tick_at;
            match &result {
                Ok(summary) => {
                    s.last_summary = Some(*summary);
                    s.last_error = None;
                }
                Err(e) => s.last_error = Some(e.to_string()),
            }
        });

        if let Ok(summary) = &result {
            if summary.is_empty() {
                tracing::debug!("scheduler: nothing due");
            } else {
                tracing::info!(
                    selected = summary.selected,
                    sent = summary.sent,
                    retried = summary.retried,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    recovered = summary.recovered,
                    "scheduler: tick complete"
                );
            }
        }
        result
    }

    async fn process(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary {
            recovered: self.recover_stale(now).await?,
            ..TickSummary::default()
        };

        let due = self.store.select_due(now, self.config.batch_limit).await?;
        summary.selected = due.len();
        if due.is_empty() {
            return Ok(summary);
        }

        let batches = if self.config.session_parallelism {
            by_session(due.iter().map(|job| (job.session_ref.as_str(), job.id)))
        } else {
            vec![due.iter().map(|job| job.id).collect()]
        };

        let mut first_error = None;
        for (partial, result) in join_all(batches.into_iter().map(|ids| self.drain(ids))).await {
            summary.merge(partial);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Execute jobs one after another, stopping at the first store error.
    async fn drain(&self, ids: Vec<Uuid>) -> (TickSummary, Result<()>) {
        let mut summary = TickSummary::default();
        for id in ids {
            match self.executor.execute(id).await {
                Ok(execution) => summary.record(&execution),
                Err(e) => return (summary, Err(e)),
            }
        }
        (summary, Ok(()))
    }

    async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(cutoff) = now.checked_sub_signed(self.stale_after) else {
            return Ok(0);
        };
        let stale = self.store.select_stale(cutoff, self.config.batch_limit).await?;
        let mut recovered = 0;
        for job in stale {
            if self.executor.recover(job.id, cutoff).await? != Execution::Skipped {
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

/// Group job ids per session, keeping due order inside each group.
fn by_session<'a>(jobs: impl Iterator<Item = (&'a str, Uuid)>) -> Vec<Vec<Uuid>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<Vec<Uuid>> = Vec::new();
    for (session, id) in jobs {
        let slot = *index.entry(session).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(id);
    }
    groups
}
