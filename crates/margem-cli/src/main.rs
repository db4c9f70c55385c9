use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use margem_core::Population;
use margem_portal::{load_portal_fixture, ScriptedPortal};
use margem_storage::{HttpClientConfig, HttpFetcher, MemoryStore, PgStore, SubjectStore};
use margem_sync::{
    build_cron_scheduler, CancellationJob, ImportJob, JobScheduler, ProposalRunner, ReconciliationEngine,
    RunOutcome, SyncConfig, YamlCredentialFile,
};
use serde::Serialize;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "margem-cli")]
#[command(about = "Margin harvesting and proposal automation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extraction job for a population (priority | general).
    Extract { population: Population },
    /// Run one proposal pass over eligible subjects.
    Propose,
    /// Cancel proposals by number through the portal's cancellation form.
    Cancel {
        #[arg(required = true)]
        numbers: Vec<String>,
    },
    /// Import subjects from the configured sheets / import directory.
    Import,
    /// Run the cron triggers until interrupted.
    Schedule,
    /// Serve the operator endpoints, with cron triggers when enabled.
    Serve,
    /// Apply database migrations.
    Migrate,
}

struct Runtime {
    config: SyncConfig,
    engine: Arc<ReconciliationEngine>,
    extraction: JobScheduler,
    proposals: ProposalRunner,
    import: ImportJob,
    cancellation: CancellationJob,
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn SubjectStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to database")?;
            info!("using postgres store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn build_runtime(config: SyncConfig) -> Result<Runtime> {
    let store = open_store(&config).await?;
    let engine = Arc::new(ReconciliationEngine::new(store));
    let fixture = load_portal_fixture(&config.portal_fixture)?;
    let portal = Arc::new(ScriptedPortal::new(fixture));
    let credentials = Arc::new(YamlCredentialFile::new(&config.credentials_file));

    let extraction = JobScheduler::new(
        Arc::clone(&engine),
        portal.clone(),
        credentials.clone(),
        config.extraction.clone(),
        config.reports_dir.clone(),
    );
    let proposals = ProposalRunner::new(
        Arc::clone(&engine),
        portal.clone(),
        credentials.clone(),
        config.proposals.clone(),
    );
    let cancellation = CancellationJob::new(
        Arc::clone(&engine),
        portal,
        credentials,
        config.cancellation.clone(),
    );

    let mut import = ImportJob::new(Arc::clone(&engine), &config.import_dir);
    if config.sheets_file.exists() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        })?;
        import = import.with_sheets(&config.sheets_file, Arc::new(fetcher));
    } else {
        info!(file = %config.sheets_file.display(), "no sheet registry; importing local files only");
    }

    Ok(Runtime {
        config,
        engine,
        extraction,
        proposals,
        import,
        cancellation,
    })
}

fn finish<R: Serialize>(label: &str, outcome: RunOutcome<R>) -> Result<()> {
    match outcome {
        RunOutcome::Completed { run_id, report } => {
            println!("{label} complete: run_id={run_id}");
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing report")?
            );
            Ok(())
        }
        RunOutcome::AlreadyRunning => {
            println!("{label} already running; nothing started");
            Ok(())
        }
        RunOutcome::Failed { run_id, error } => bail!("{label} run {run_id} failed: {error}"),
    }
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutdown requested");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL is required for migrate");
            };
            PgStore::connect(url)
                .await
                .context("connecting to database")?
                .migrate()
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Extract { population } => {
            let runtime = build_runtime(config).await?;
            finish("extraction", runtime.extraction.run(population).await)?;
        }
        Commands::Propose => {
            let runtime = build_runtime(config).await?;
            finish("proposal", runtime.proposals.run().await)?;
        }
        Commands::Cancel { numbers } => {
            let runtime = build_runtime(config).await?;
            finish("cancellation", runtime.cancellation.run(numbers).await)?;
        }
        Commands::Import => {
            let runtime = build_runtime(config).await?;
            finish("import", runtime.import.run().await)?;
        }
        Commands::Schedule => {
            let mut runtime = build_runtime(config).await?;
            runtime.config.scheduler_enabled = true;
            let Some(mut sched) = build_cron_scheduler(
                &runtime.config,
                runtime.extraction.clone(),
                runtime.proposals.clone(),
                runtime.import.clone(),
            )
            .await?
            else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!("cron triggers running");
            wait_for_shutdown().await?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let runtime = build_runtime(config).await?;
            let sched = build_cron_scheduler(
                &runtime.config,
                runtime.extraction.clone(),
                runtime.proposals.clone(),
                runtime.import.clone(),
            )
            .await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
                info!("cron triggers running alongside the web server");
            }
            let state = margem_web::AppState {
                engine: runtime.engine,
                extraction: runtime.extraction,
                proposals: runtime.proposals,
                import: runtime.import,
                cancellation: runtime.cancellation,
            };
            let bind_addr = runtime.config.bind_addr.clone();
            tokio::select! {
                served = margem_web::serve(state, &bind_addr) => served?,
                shutdown = wait_for_shutdown() => shutdown?,
            }
        }
    }

    Ok(())
}
