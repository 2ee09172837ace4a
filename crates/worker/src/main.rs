//! PlanHub Background Worker
//!
//! Handles scheduled jobs:
//! - Expiry sweep: auto-renews or expires subscriptions past their end date
//! - Invariant checks over plans and subscriptions
//! - Heartbeat (every 5 minutes)

mod config;

use std::sync::Arc;

use planhub_billing::{BillingService, InvariantCheckSummary, ViolationSeverity};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::Config;

/// Log the outcome of an invariant run at a level matching the worst violation
fn log_invariant_results(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Invariant checks passed");
        return;
    }

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Invariant checks found violations"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting PlanHub Worker");

    let config = Config::from_env()?;

    // Create database pool
    let pool =
        planhub_shared::create_pool(&config.database_url, config.database_max_connections).await?;
    info!(
        max_connections = config.database_max_connections,
        "Database pool created"
    );

    if config.run_migrations {
        let migration_pool = planhub_shared::create_migration_pool(&config.database_url).await?;
        planhub_shared::run_migrations(&migration_pool).await?;
        migration_pool.close().await;
        info!("Database migrations applied");
    }

    let billing = Arc::new(BillingService::postgres(pool));

    // Create scheduler
    let scheduler = JobScheduler::new().await?;
    let mut scheduled = 0;

    // Job 1: Expiry sweep
    if config.enable_expiry_sweep {
        let sweep_billing = billing.clone();
        scheduler
            .add(Job::new_async(
                config.expiry_sweep_cron.as_str(),
                move |_uuid, _l| {
                    let billing = sweep_billing.clone();
                    Box::pin(async move {
                        match billing.expiry.expire_due(OffsetDateTime::now_utc()).await {
                            Ok(summary) if summary.failed > 0 => {
                                warn!(
                                    examined = summary.examined,
                                    renewed = summary.renewed,
                                    expired = summary.expired,
                                    failed = summary.failed,
                                    "Expiry sweep completed with failures"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Expiry sweep failed"),
                        }
                    })
                },
            )?)
            .await?;
        scheduled += 1;
        info!(cron = %config.expiry_sweep_cron, "Scheduled: Expiry sweep");
    } else {
        warn!("Expiry sweep disabled; subscriptions will not expire or auto-renew");
    }

    // Job 2: Invariant checks
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async(
            config.invariant_check_cron.as_str(),
            move |_uuid, _l| {
                let billing = invariant_billing.clone();
                Box::pin(async move {
                    match billing.invariants.run_all_checks().await {
                        Ok(summary) => log_invariant_results(&summary),
                        Err(e) => error!(error = %e, "Invariant check run failed"),
                    }
                })
            },
        )?)
        .await?;
    scheduled += 1;
    info!(cron = %config.invariant_check_cron, "Scheduled: Invariant checks");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    scheduled += 1;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(jobs = scheduled, "PlanHub Worker started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let mut scheduler = scheduler;
    scheduler.shutdown().await?;
    info!("Worker stopped");

    Ok(())
}
