use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::AppContext;
use crate::orchestrator::Orchestrator;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::{db, janitor, migrations, server, store};

pub async fn run(config: Config) -> Result<()> {
    let pool = db::create_pool(&config.database_url)
        .await
        .context("creating database")?;

    // A failed migration halts the manager but not the process: the service
    // starts degraded and reports the unapplied set over the API.
    let report = migrations::run_migrations(&pool)
        .await
        .context("running migrations")?;
    if report.degraded {
        error!(
            pending = ?report.pending,
            error = ?report.error,
            "migrations incomplete, starting in degraded mode"
        );
    }

    let ctx = AppContext::build(config, pool, report.clone())?;

    if !report.degraded {
        seed_defaults(&ctx).await.context("seeding defaults")?;
    }

    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(ctx.clone());

    let scheduler = Arc::new(Scheduler::new(
        ctx.queue.clone(),
        SchedulerConfig {
            check_interval: ctx.config.scheduler_check_interval,
            stuck_hours: ctx.config.scheduler_stuck_hours,
            default_task_timeout: ctx.config.scheduler_task_timeout,
        },
        orchestrator,
    ));
    let scheduler_handle = tokio::spawn(scheduler.run_loop(cancel.clone()));
    let janitor_handle = tokio::spawn(janitor::janitor_loop(ctx.clone(), cancel.clone()));

    let router = server::build_router(ctx.clone());
    let listener = tokio::net::TcpListener::bind(&ctx.config.listen)
        .await
        .with_context(|| format!("binding to {}", ctx.config.listen))?;
    info!(listen = %ctx.config.listen, "HTTP server listening");

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    wait_for_shutdown().await;
    info!("shutdown signal received");

    cancel.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(10);
    let joined = tokio::time::timeout(shutdown_timeout, async {
        let _ = scheduler_handle.await;
        let _ = janitor_handle.await;
        let _ = server_handle.await;
    })
    .await;
    if joined.is_err() {
        warn!("background tasks did not stop within the shutdown window");
    }

    ctx.render.shutdown().await;
    ctx.queue.close();
    ctx.pool.close().await;
    info!("shutdown complete");

    Ok(())
}

/// Seed the fixed taxonomy and the default scheduled tasks.
async fn seed_defaults(ctx: &Arc<AppContext>) -> Result<()> {
    let names = ctx.config.news_categories.clone();
    ctx.queue
        .write(
            "categories",
            Arc::new(move |conn| {
                let names = names.clone();
                Box::pin(async move { store::sync_categories(&mut *conn, &names).await })
            }),
        )
        .await?;
    ctx.queue
        .write(
            "schedule_settings",
            Arc::new(|conn| Box::pin(async move { store::seed_default_tasks(conn).await })),
        )
        .await?;
    info!("taxonomy and default tasks seeded");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
