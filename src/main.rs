use clock::{Clock, SystemClock};
use config::AppConfig;
use functions::{Admin, JobExecutor, MessageResolver, Scheduler};
use services::{PgAuditSink, PgSettings, PgTemplateProvider, SessionRegistry, TemplateProvider};
use std::sync::Arc;
use store::{JobStore, PgJobStore};
use tokio_util::sync::CancellationToken;

mod clock;
mod config;
mod db;
mod error;
mod functions;
mod schema;
mod services;
mod store;

#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;
    let pool = db::connect(&config).await?;
    db::migrate(&pool).await?;
    tracing::info!(
        max_connections = config.db_max_connections,
        timezone = %config.timezone,
        "database ready"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let templates: Arc<dyn TemplateProvider> =
        Arc::new(PgTemplateProvider::new(pool.clone(), config.timezone));
    let settings = Arc::new(PgSettings::new(pool.clone()));
    let audit = Arc::new(PgAuditSink::new(pool.clone()));
    let sessions = Arc::new(SessionRegistry::from_config(&config.gateway)?);

    let executor = JobExecutor::new(
        store.clone(),
        MessageResolver::new(templates.clone()),
        sessions.clone(),
        settings.clone(),
        audit.clone(),
        clock.clone(),
    );
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        executor,
        clock.clone(),
        config.scheduler.clone(),
    )?);
    let admin = Admin::new(
        store,
        templates,
        settings,
        audit,
        scheduler.clone(),
        sessions,
        clock,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
            }
        }
    });

    let scheduler_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    let served = functions::http::serve(listener, admin, shutdown.clone()).await;

    // the server may have stopped on its own; the scheduler goes with it
    shutdown.cancel();
    scheduler_task.await?;
    served?;
    Ok(())
}
