use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use vesti::cli::{Cli, Commands};
use vesti::config::Config;
use vesti::{context, daemon, db, migrations, orchestrator, store};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("loading configuration from environment")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(db = %config.database_url, "configuration loaded");

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
        }
        Some(Commands::Migrate) => {
            let pool = db::create_pool(&config.database_url)
                .await
                .context("creating database")?;
            let report = migrations::run_migrations(&pool).await?;
            if report.degraded {
                anyhow::bail!(
                    "migrations incomplete: {:?} pending ({})",
                    report.pending,
                    report.error.unwrap_or_default()
                );
            }
            println!(
                "Migrations complete: {} applied, {} already in place.",
                report.applied.len(),
                report.skipped.len()
            );
        }
        Some(Commands::RunCycle { no_emit }) => {
            let pool = db::create_pool(&config.database_url)
                .await
                .context("creating database")?;
            let report = migrations::run_migrations(&pool).await?;
            if report.degraded {
                anyhow::bail!("database schema incomplete, run migrations first");
            }
            let ctx = context::AppContext::build(config, pool, report)?;

            let names = ctx.config.news_categories.clone();
            ctx.queue
                .write(
                    "categories",
                    std::sync::Arc::new(move |conn| {
                        let names = names.clone();
                        Box::pin(async move { store::sync_categories(&mut *conn, &names).await })
                    }),
                )
                .await?;

            let orchestrator = orchestrator::Orchestrator::new(ctx.clone());
            let cancel = CancellationToken::new();
            let stats = orchestrator.run_cycle(!no_emit, &cancel).await?;
            println!(
                "Cycle complete: {} fetched, {} processed, {} AI calls, {} errors.",
                stats.articles_fetched,
                stats.articles_processed,
                stats.api_calls_made,
                stats.errors.len()
            );
            ctx.render.shutdown().await;
        }
        None => {
            daemon::run(config).await?;
        }
    }

    Ok(())
}
