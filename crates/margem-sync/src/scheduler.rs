use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use margem_core::{today, Population, Subject};
use margem_portal::SessionFactory;
use margem_storage::{RateLimiter, SubjectStore};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ExtractionSettings;
use crate::credentials::{CredentialPool, CredentialSource, CredentialUse};
use crate::pool::await_workers;
use crate::reconcile::ReconciliationEngine;
use crate::single_flight::SingleFlight;
use crate::worker::{ExtractionWorker, RelaunchSignal, WorkerAssignment, WorkerContext, WorkerReport};
use crate::{RunOutcome, SyncError, SyncResult};

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub population: Population,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub chunks: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub sessions_failed: usize,
    pub chunks_halted: usize,
    pub circuit_broken: bool,
    pub timed_out: bool,
    pub relaunch_scheduled: bool,
    pub workers: Vec<WorkerReport>,
}

impl RunReport {
    fn new(run_id: Uuid, population: Population) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            population,
            started_at: now,
            finished_at: now,
            candidates: 0,
            chunks: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            sessions_failed: 0,
            chunks_halted: 0,
            circuit_broken: false,
            timed_out: false,
            relaunch_scheduled: false,
            workers: Vec::new(),
        }
    }

    fn absorb(&mut self, worker: WorkerReport) {
        self.processed += worker.processed;
        self.succeeded += worker.succeeded;
        self.failed += worker.failed;
        self.skipped += worker.skipped;
        self.sessions_failed += usize::from(worker.login_failed);
        self.chunks_halted += usize::from(worker.halted);
        self.circuit_broken |= worker.circuit_broken;
        self.relaunch_scheduled |= worker.relaunch_requested;
        self.workers.push(worker);
    }
}

/// Subjects not yet queried on `today`, never-queried first, then oldest
/// snapshot first, capped at `quota`.
pub fn select_candidates(subjects: Vec<Subject>, today: NaiveDate, quota: Option<usize>) -> Vec<Subject> {
    let mut candidates: Vec<Subject> = subjects
        .into_iter()
        .filter(|s| !s.queried_on(today))
        .collect();
    candidates.sort_by_key(Subject::latest_query_date);
    if let Some(quota) = quota {
        candidates.truncate(quota);
    }
    candidates
}

/// Contiguous fixed-size chunks preserving order.
pub fn partition<T>(items: Vec<T>, chunk_size: usize) -> Vec<Vec<T>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(chunk_size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(chunk_size).collect());
    }
    chunks
}

#[derive(Debug, Default)]
struct JobState {
    flight: SingleFlight,
    relaunch_pending: AtomicBool,
    relaunch_attempts: AtomicUsize,
}

struct SchedulerInner {
    store: Arc<dyn SubjectStore>,
    engine: Arc<ReconciliationEngine>,
    sessions: Arc<dyn SessionFactory>,
    credentials: Arc<dyn CredentialSource>,
    settings: ExtractionSettings,
    reports_dir: Option<PathBuf>,
    priority: JobState,
    general: JobState,
}

impl SchedulerInner {
    fn job(&self, population: Population) -> &JobState {
        match population {
            Population::Priority => &self.priority,
            Population::General => &self.general,
        }
    }
}

/// Runs extraction jobs, one single-flight job per population. Clones share
/// the same job state. With a reports directory, each run's report lands in
/// `<dir>/<run_id>/run_report.json`.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        sessions: Arc<dyn SessionFactory>,
        credentials: Arc<dyn CredentialSource>,
        settings: ExtractionSettings,
        reports_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store: Arc::clone(engine.store()),
                engine,
                sessions,
                credentials,
                settings,
                reports_dir,
                priority: JobState::default(),
                general: JobState::default(),
            }),
        }
    }

    pub fn is_running(&self, population: Population) -> bool {
        self.inner.job(population).flight.is_running()
    }

    pub fn relaunch_attempts(&self, population: Population) -> usize {
        self.inner
            .job(population)
            .relaunch_attempts
            .load(Ordering::SeqCst)
    }

    /// One extraction run. A trigger while the same population is running is
    /// a no-op.
    pub async fn run(&self, population: Population) -> RunOutcome<RunReport> {
        let job = self.inner.job(population);
        let Some(flight) = job.flight.try_begin() else {
            info!(%population, "extraction already running; trigger ignored");
            return RunOutcome::AlreadyRunning;
        };
        job.relaunch_pending.store(false, Ordering::SeqCst);

        let run_id = Uuid::new_v4();
        let span = info_span!("extraction_run", %run_id, %population);
        match self.execute(population, run_id).instrument(span).await {
            Ok(report) => {
                if !report.circuit_broken && !report.timed_out {
                    job.relaunch_attempts.store(0, Ordering::SeqCst);
                }
                if let Some(dir) = &self.inner.reports_dir {
                    if let Err(err) = write_run_report(dir, &report).await {
                        warn!(%run_id, error = %format!("{err:#}"), "could not write run report");
                    }
                }
                // the relaunched run must find the slot free
                drop(flight);
                if report.relaunch_scheduled {
                    self.spawn_relaunch(population);
                }
                RunOutcome::Completed { run_id, report }
            }
            Err(err) => {
                error!(%run_id, %population, error = %err, "extraction run failed");
                RunOutcome::Failed {
                    run_id,
                    error: err.to_string(),
                }
            }
        }
    }

    fn spawn_relaunch(&self, population: Population) {
        let cooldown = self.inner.settings.relaunch_cooldown;
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let outcome = scheduler.run(population).await;
            info!(%population, status = ?outcome.status(), run_id = ?outcome.run_id(), "relaunched extraction finished");
        });
    }

    async fn execute(&self, population: Population, run_id: Uuid) -> SyncResult<RunReport> {
        let settings = &self.inner.settings;
        let credentials = self
            .inner
            .credentials
            .load()
            .await
            .map_err(|err| SyncError::Config(format!("{err:#}")))?;
        let pool = CredentialPool::for_run(credentials, CredentialUse::Extraction)?;

        let today = today();
        let candidates = select_candidates(
            self.inner.store.find_subjects_in(population).await?,
            today,
            settings.quota(population),
        );
        let chunks = partition(candidates, settings.chunk_size(population));

        let mut report = RunReport::new(run_id, population);
        report.candidates = chunks.iter().map(Vec::len).sum();
        report.chunks = chunks.len();
        info!(
            candidates = report.candidates,
            chunks = report.chunks,
            workers = settings.worker_count,
            credentials = pool.len(),
            "extraction run started"
        );

        let cancel = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            run_id,
            population,
            today,
            limiter: Arc::new(RateLimiter::per_second(settings.rate_per_second)),
            engine: Arc::clone(&self.inner.engine),
            sessions: Arc::clone(&self.inner.sessions),
            relaunch: Arc::new(self.clone()),
            settings: settings.clone(),
            cancel: cancel.clone(),
            halt: CancellationToken::new(),
        });

        // chunks beyond the worker count wait for a free slot
        let slots = Arc::new(Semaphore::new(settings.worker_count.max(1)));
        let mut workers = JoinSet::new();
        for (index, subjects) in chunks.into_iter().enumerate() {
            let assignment = WorkerAssignment {
                slot: index,
                credential: pool.credentials_for_worker(index).clone(),
                subjects,
            };
            let ctx = Arc::clone(&ctx);
            let slots = Arc::clone(&slots);
            workers.spawn(async move {
                let Ok(_slot) = slots.acquire_owned().await else {
                    return WorkerReport::default();
                };
                ExtractionWorker::new(ctx, assignment).run().await
            });
        }

        let timed_out = await_workers(
            &mut workers,
            &cancel,
            settings.run_timeout,
            settings.cancel_grace,
            |worker| report.absorb(worker),
        )
        .await;
        report.timed_out = timed_out;
        report.workers.sort_by_key(|w| w.slot);
        report.finished_at = Utc::now();

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            circuit_broken = report.circuit_broken,
            chunks_halted = report.chunks_halted,
            timed_out = report.timed_out,
            "extraction run finished"
        );
        Ok(report)
    }
}

impl RelaunchSignal for JobScheduler {
    fn request_relaunch(&self, population: Population, run_id: Uuid) -> bool {
        let job = self.inner.job(population);
        if job
            .relaunch_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let attempt = job.relaunch_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.inner.settings.relaunch_ceiling {
            warn!(%run_id, %population, attempt, "relaunch ceiling reached; not relaunching");
            return false;
        }

        let cooldown = self.inner.settings.relaunch_cooldown;
        warn!(%run_id, %population, attempt, ?cooldown, "circuit broken; relaunch scheduled");
        true
    }
}

async fn write_run_report(reports_dir: &Path, report: &RunReport) -> anyhow::Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("run_report.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use margem_core::{Credential, HistoryEntry, Relationship, SourceRecord};
    use margem_portal::{FixtureRecord, FixtureRelationship, PortalFixture, ScriptedPortal};
    use margem_storage::MemoryStore;
    use tempfile::tempdir;

    use crate::credentials::StaticCredentials;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn subject_last_seen(id: &str, date: Option<NaiveDate>) -> Subject {
        let mut subject = Subject::new(id);
        if let Some(date) = date {
            let mut relationship = Relationship::new(Some("A"), "1");
            relationship.record_history(HistoryEntry::on(date));
            subject.relationships.push(relationship);
        }
        subject
    }

    #[test]
    fn candidates_skip_today_and_put_never_queried_first() {
        let today = day(10);
        let subjects = vec![
            subject_last_seen("a", Some(day(5))),
            subject_last_seen("b", Some(today)),
            subject_last_seen("c", None),
            subject_last_seen("d", Some(day(2))),
        ];
        let ids: Vec<_> = select_candidates(subjects.clone(), today, None)
            .into_iter()
            .map(|s| s.taxpayer_id)
            .collect();
        assert_eq!(ids, ["c", "d", "a"]);

        let capped = select_candidates(subjects, today, Some(2));
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn partition_is_complete_and_ordered() {
        for (n, c) in [(0, 3), (1, 3), (7, 3), (9, 3), (250, 120)] {
            let items: Vec<usize> = (0..n).collect();
            let chunks = partition(items.clone(), c);
            assert!(chunks.iter().all(|chunk| chunk.len() <= c && !chunk.is_empty()));
            assert_eq!(chunks.len(), n.div_ceil(c));
            assert_eq!(chunks.concat(), items);
        }
    }

    struct Harness {
        portal: ScriptedPortal,
        store: Arc<MemoryStore>,
        scheduler: JobScheduler,
    }

    async fn harness(count: usize, settings: ExtractionSettings) -> Harness {
        harness_with_reports(count, settings, None).await
    }

    async fn harness_with_reports(
        count: usize,
        settings: ExtractionSettings,
        reports_dir: Option<PathBuf>,
    ) -> Harness {
        let ids: Vec<String> = (1..=count).map(|i| format!("{i:03}")).collect();
        let portal = ScriptedPortal::new(PortalFixture {
            records: ids
                .iter()
                .map(|id| FixtureRecord {
                    taxpayer_id: id.clone(),
                    relationships: vec![FixtureRelationship {
                        issuer: Some("INSS".into()),
                        registration: id.clone(),
                        benefit_margin: "50,00".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(ReconciliationEngine::new(store.clone()));
        for id in &ids {
            let mut record = SourceRecord::new(id);
            record.priority = Some(false);
            engine.upsert_subject(record).await.unwrap();
        }
        let scheduler = JobScheduler::new(
            engine,
            Arc::new(portal.clone()),
            Arc::new(StaticCredentials(vec![
                Credential::new("op1", "pw"),
                Credential::new("op2", "pw"),
            ])),
            settings,
            reports_dir,
        );
        Harness {
            portal,
            store,
            scheduler,
        }
    }

    fn fast_settings() -> ExtractionSettings {
        ExtractionSettings {
            rate_per_second: 0.0,
            worker_count: 3,
            general_chunk_size: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_extracts_every_candidate_across_chunks() {
        let h = harness(10, fast_settings()).await;
        let outcome = h.scheduler.run(Population::General).await;
        let report = outcome.report().expect("completed").clone();

        assert_eq!(report.candidates, 10);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.succeeded, 10);
        assert_eq!(h.portal.stats().opened(), 3);
        assert_eq!(h.portal.stats().closed(), 3);
        for subject in h.store.all_subjects().await.unwrap() {
            assert!(subject.queried_on(today()));
        }

        let second = h.scheduler.run(Population::General).await;
        assert_eq!(second.report().unwrap().candidates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_trigger_is_a_no_op() {
        let h = harness(2, fast_settings()).await;
        h.portal.set_step_delay(Duration::from_millis(100)).await;

        let first = {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.run(Population::General).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.scheduler.is_running(Population::General));

        let second = h.scheduler.run(Population::General).await;
        assert!(matches!(second, RunOutcome::AlreadyRunning));
        let other = h.scheduler.run(Population::Priority).await;
        assert!(matches!(other, RunOutcome::Completed { .. }));

        let first = first.await.unwrap();
        assert_eq!(first.report().unwrap().succeeded, 2);
        assert_eq!(h.portal.stats().opened(), 1);
        assert!(!h.scheduler.is_running(Population::General));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_workers_and_closes_sessions() {
        let settings = ExtractionSettings {
            run_timeout: Duration::from_secs(60),
            cancel_grace: Duration::from_secs(5),
            ..fast_settings()
        };
        let h = harness(6, settings).await;
        h.portal.set_step_delay(Duration::from_secs(20)).await;

        let outcome = h.scheduler.run(Population::General).await;
        let report = outcome.report().unwrap();
        assert!(report.timed_out);
        assert!(report.workers.iter().all(|w| w.cancelled));
        assert_eq!(h.portal.stats().opened(), h.portal.stats().closed());
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_break_relaunches_after_cooldown_up_to_ceiling() {
        let settings = ExtractionSettings {
            worker_count: 1,
            general_chunk_size: 100,
            attempts_per_subject: 1,
            failure_threshold: 3,
            relaunch_ceiling: 2,
            relaunch_cooldown: Duration::from_secs(300),
            ..fast_settings()
        };
        let h = harness(5, settings).await;
        h.portal.fail_all_extractions().await;

        let outcome = h.scheduler.run(Population::General).await;
        let report = outcome.report().unwrap();
        assert!(report.circuit_broken);
        assert!(report.relaunch_scheduled);
        assert_eq!(report.processed, 3);
        assert_eq!(h.portal.stats().opened(), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(h.portal.stats().opened(), 2);
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(h.portal.stats().opened(), 3);
        assert_eq!(h.scheduler.relaunch_attempts(Population::General), 3);

        // ceiling of two relaunches reached
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(h.portal.stats().opened(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_break_stops_queued_chunks() {
        let settings = ExtractionSettings {
            worker_count: 1,
            general_chunk_size: 3,
            attempts_per_subject: 1,
            failure_threshold: 3,
            relaunch_ceiling: 0,
            ..fast_settings()
        };
        let h = harness(9, settings).await;
        h.portal.fail_all_extractions().await;

        let outcome = h.scheduler.run(Population::General).await;
        let report = outcome.report().unwrap();
        assert!(report.circuit_broken);
        assert!(!report.relaunch_scheduled);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.processed, 3);
        assert_eq!(report.chunks_halted, 2);
        assert_eq!(h.portal.stats().opened(), 1);
        assert_eq!(h.portal.stats().closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relaunch_is_not_lost_while_siblings_finish() {
        let settings = ExtractionSettings {
            worker_count: 2,
            general_chunk_size: 2,
            attempts_per_subject: 1,
            failure_threshold: 1,
            relaunch_ceiling: 1,
            relaunch_cooldown: Duration::from_secs(1),
            ..fast_settings()
        };
        let h = harness(4, settings).await;
        h.portal.fail_extraction("001", usize::MAX).await;
        h.portal.set_step_delay(Duration::from_secs(5)).await;

        let outcome = h.scheduler.run(Population::General).await;
        let report = outcome.report().unwrap();
        assert!(report.circuit_broken);
        assert!(report.relaunch_scheduled);
        assert!(!h.scheduler.is_running(Population::General));

        // the relaunched run trips again and uses up the ceiling
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.scheduler.relaunch_attempts(Population::General), 2);
        assert!(!h.scheduler.is_running(Population::General));
        assert_eq!(h.portal.stats().opened(), h.portal.stats().closed());
    }

    #[tokio::test]
    async fn missing_credentials_fail_the_run() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = JobScheduler::new(
            Arc::new(ReconciliationEngine::new(store)),
            Arc::new(ScriptedPortal::new(PortalFixture::default())),
            Arc::new(StaticCredentials::default()),
            fast_settings(),
            None,
        );
        let outcome = scheduler.run(Population::Priority).await;
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert!(outcome.run_id().is_some());
        assert!(!scheduler.is_running(Population::Priority));
    }

    #[tokio::test]
    async fn run_reports_are_written_per_run() {
        let dir = tempdir().expect("tempdir");
        let h = harness_with_reports(1, fast_settings(), Some(dir.path().to_path_buf())).await;

        let outcome = h.scheduler.run(Population::General).await;
        let run_id = outcome.run_id().unwrap();
        let path = dir.path().join(run_id.to_string()).join("run_report.json");
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(json["population"], "general");
        assert_eq!(json["succeeded"], 1);
    }
}
