use anyhow::{Context, Result};
use margem_core::Population;
use tokio_cron_scheduler::{Job, JobScheduler as CronScheduler};
use tracing::info;

use crate::config::SyncConfig;
use crate::import::ImportJob;
use crate::proposal::ProposalRunner;
use crate::scheduler::JobScheduler;

fn job_for<F, Fut>(cron: &str, label: &'static str, trigger: F) -> Result<Job>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Job::new_async(cron, move |_uuid, _lock| {
        let run = trigger();
        Box::pin(async move {
            info!(job = label, "cron trigger fired");
            run.await;
        })
    })
    .with_context(|| format!("creating {label} job for cron {cron}"))
}

/// Registers the extraction, proposal and import triggers. Each fires the
/// same single-flight entry point as a manual trigger. `None` when
/// scheduling is disabled.
pub async fn build_cron_scheduler(
    config: &SyncConfig,
    extraction: JobScheduler,
    proposals: ProposalRunner,
    import: ImportJob,
) -> Result<Option<CronScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = CronScheduler::new().await.context("creating scheduler")?;
    for population in Population::ALL {
        let scheduler = extraction.clone();
        let job = job_for(config.cron_for(population), population.as_str(), move || {
            let scheduler = scheduler.clone();
            async move {
                let outcome = scheduler.run(population).await;
                info!(%population, status = ?outcome.status(), run_id = ?outcome.run_id(), "scheduled extraction done");
            }
        })?;
        sched.add(job).await.context("adding extraction job")?;
    }

    if config.proposals_enabled {
        let job = job_for(&config.cron_proposals, "proposals", move || {
            let runner = proposals.clone();
            async move {
                let outcome = runner.run().await;
                info!(status = ?outcome.status(), run_id = ?outcome.run_id(), "scheduled proposal run done");
            }
        })?;
        sched.add(job).await.context("adding proposal job")?;
    } else {
        info!("automatic proposal runs disabled");
    }

    let job = job_for(&config.cron_import, "import", move || {
        let import = import.clone();
        async move {
            let outcome = import.run().await;
            info!(status = ?outcome.status(), run_id = ?outcome.run_id(), "scheduled import done");
        }
    })?;
    sched.add(job).await.context("adding import job")?;

    Ok(Some(sched))
}
