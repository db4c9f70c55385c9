use std::sync::Arc;

use chrono::NaiveDate;
use margem_core::{Credential, Population, SourceRecord, Subject};
use margem_portal::{
    Action, AutomationSession, Condition, Element, Extracted, Extraction, Navigation, Screen,
    SessionError, SessionFactory,
};
use margem_storage::RateLimiter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ExtractionSettings;
use crate::reconcile::ReconciliationEngine;
use crate::{SyncError, SyncResult};

/// Receives circuit-break signals from workers.
pub trait RelaunchSignal: Send + Sync {
    /// Records a request for a delayed re-run of `population`; returns
    /// whether this call earned one. The re-run starts once the current run
    /// has released its slot.
    fn request_relaunch(&self, population: Population, run_id: Uuid) -> bool;
}

/// Everything a run's workers share. `cancel` fires on the run timeout and
/// interrupts work in flight; `halt` fires when any worker trips the circuit
/// breaker and stops the others before their next subject.
pub struct WorkerContext {
    pub run_id: Uuid,
    pub population: Population,
    pub today: NaiveDate,
    pub limiter: Arc<RateLimiter>,
    pub engine: Arc<ReconciliationEngine>,
    pub sessions: Arc<dyn SessionFactory>,
    pub relaunch: Arc<dyn RelaunchSignal>,
    pub settings: ExtractionSettings,
    pub cancel: CancellationToken,
    pub halt: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct WorkerAssignment {
    pub slot: usize,
    pub credential: Credential,
    pub subjects: Vec<Subject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    pub slot: usize,
    pub assigned: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub login_failed: bool,
    pub circuit_broken: bool,
    pub relaunch_requested: bool,
    pub cancelled: bool,
    pub halted: bool,
}

pub struct ExtractionWorker {
    ctx: Arc<WorkerContext>,
    assignment: WorkerAssignment,
    consecutive_failures: usize,
}

impl ExtractionWorker {
    pub fn new(ctx: Arc<WorkerContext>, assignment: WorkerAssignment) -> Self {
        Self {
            ctx,
            assignment,
            consecutive_failures: 0,
        }
    }

    /// Processes the assignment; the session is closed on every exit path
    /// that still owns it, including cancellation.
    pub async fn run(mut self) -> WorkerReport {
        let span = info_span!(
            "extraction_worker",
            run_id = %self.ctx.run_id,
            population = %self.ctx.population,
            slot = self.assignment.slot,
        );
        async move {
            let mut report = WorkerReport {
                slot: self.assignment.slot,
                assigned: self.assignment.subjects.len(),
                ..Default::default()
            };
            if self.ctx.cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }
            if self.ctx.halt.is_cancelled() {
                info!("run halted by circuit breaker; chunk not started");
                report.halted = true;
                return report;
            }

            let mut session = match self
                .ctx
                .sessions
                .open_session(&self.assignment.credential)
                .await
            {
                Ok(session) => session,
                Err(err) => {
                    error!(username = %self.assignment.credential.username, error = %err, "could not open session");
                    report.login_failed = true;
                    return report;
                }
            };

            let cancel = self.ctx.cancel.clone();
            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = self.process_all(session.as_mut(), &mut report) => false,
            };
            if cancelled {
                warn!("worker cancelled; closing session");
                report.cancelled = true;
            }
            if let Err(err) = session.close().await {
                warn!(error = %err, "closing session failed");
            }

            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                circuit_broken = report.circuit_broken,
                "worker finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn process_all(&mut self, session: &mut dyn AutomationSession, report: &mut WorkerReport) {
        let subjects = std::mem::take(&mut self.assignment.subjects);
        for subject in subjects {
            if self.ctx.halt.is_cancelled() {
                info!(remaining = report.assigned - report.processed - report.skipped, "run halted; stopping worker");
                report.halted = true;
                return;
            }
            if subject.queried_on(self.ctx.today) {
                report.skipped += 1;
                continue;
            }

            report.processed += 1;
            match self.extract_subject(session, &subject.taxpayer_id).await {
                Ok(()) => report.succeeded += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(taxpayer_id = %subject.taxpayer_id, error = %err, "subject skipped after failed extraction");
                }
            }

            if self.consecutive_failures >= self.ctx.settings.failure_threshold {
                warn!(
                    consecutive_failures = self.consecutive_failures,
                    "failure threshold reached; stopping worker"
                );
                report.circuit_broken = true;
                self.ctx.halt.cancel();
                report.relaunch_requested = self
                    .ctx
                    .relaunch
                    .request_relaunch(self.ctx.population, self.ctx.run_id);
                return;
            }
        }
    }

    async fn extract_subject(
        &mut self,
        session: &mut dyn AutomationSession,
        taxpayer_id: &str,
    ) -> SyncResult<()> {
        let attempts = self.ctx.settings.attempts_per_subject.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            self.ctx.limiter.acquire().await;
            match self.query_margin(session, taxpayer_id).await {
                Ok(record) => {
                    self.consecutive_failures = 0;
                    self.ctx.engine.upsert_subject(record).await?;
                    return Ok(());
                }
                Err(err) => {
                    self.consecutive_failures += 1;
                    debug!(%taxpayer_id, attempt, error = %err, "extraction attempt failed");
                    recover(session).await;
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .map(SyncError::from)
            .unwrap_or_else(|| SyncError::Session(SessionError::Unexpected("no attempt made".into()))))
    }

    async fn query_margin(
        &self,
        session: &mut dyn AutomationSession,
        taxpayer_id: &str,
    ) -> Result<SourceRecord, SessionError> {
        session.navigate(Navigation::To(Screen::MarginQuery)).await?;
        session
            .act(Action::EnterTaxpayerId(taxpayer_id.to_string()))
            .await?;
        session.act(Action::SubmitMarginQuery).await?;
        session
            .wait_until(
                Condition::Visible(Element::MarginResult),
                self.ctx.settings.result_timeout,
            )
            .await?;
        let extracted = session.extract(Extraction::MarginRecord).await?;
        session.act(Action::CloseResultPanel).await?;
        match extracted {
            Extracted::Record(record) => Ok(record),
            other => Err(SessionError::unexpected("margin record", &other)),
        }
    }
}

/// Back, refresh and re-enter the query screen after a failed attempt.
async fn recover(session: &mut dyn AutomationSession) {
    for step in [
        Navigation::Back,
        Navigation::Refresh,
        Navigation::To(Screen::MarginQuery),
    ] {
        if let Err(err) = session.navigate(step).await {
            debug!(?step, error = %err, "recovery navigation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use margem_core::{today, HistoryEntry, Relationship};
    use margem_portal::{FixtureRecord, FixtureRelationship, PortalFixture, ScriptedPortal};
    use margem_storage::{MemoryStore, SubjectStore};

    #[derive(Default)]
    struct CountingSignal {
        requests: AtomicUsize,
    }

    impl RelaunchSignal for CountingSignal {
        fn request_relaunch(&self, _population: Population, _run_id: Uuid) -> bool {
            self.requests.fetch_add(1, Ordering::SeqCst) == 0
        }
    }

    fn portal_with(ids: &[&str]) -> ScriptedPortal {
        ScriptedPortal::new(PortalFixture {
            records: ids
                .iter()
                .map(|id| FixtureRecord {
                    taxpayer_id: id.to_string(),
                    name: Some(format!("Subject {id}")),
                    relationships: vec![FixtureRelationship {
                        issuer: Some("INSS".into()),
                        registration: format!("9{id}"),
                        benefit_margin: "120,00".into(),
                        benefit_status: "Autorizado".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
    }

    fn context(
        portal: &ScriptedPortal,
        store: Arc<MemoryStore>,
        signal: Arc<CountingSignal>,
        settings: ExtractionSettings,
    ) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            run_id: Uuid::new_v4(),
            population: Population::General,
            today: today(),
            limiter: Arc::new(RateLimiter::per_second(0.0)),
            engine: Arc::new(ReconciliationEngine::new(store)),
            sessions: Arc::new(portal.clone()),
            relaunch: signal,
            settings,
            cancel: CancellationToken::new(),
            halt: CancellationToken::new(),
        })
    }

    fn assignment(ids: &[&str]) -> WorkerAssignment {
        WorkerAssignment {
            slot: 0,
            credential: Credential::new("op", "pw"),
            subjects: ids.iter().map(|id| Subject::new(id)).collect(),
        }
    }

    #[tokio::test]
    async fn extracts_retries_and_skips_subjects_already_queried_today() {
        let portal = portal_with(&["1", "2", "3"]);
        portal.fail_extraction("2", 2).await;
        let store = Arc::new(MemoryStore::new());
        let signal = Arc::new(CountingSignal::default());
        let ctx = context(&portal, store.clone(), signal.clone(), ExtractionSettings::default());

        let mut done_today = Subject::new("3");
        let mut relationship = Relationship::new(Some("INSS"), "93");
        relationship.record_history(HistoryEntry::on(today()));
        done_today.relationships.push(relationship);

        let mut work = assignment(&["1", "2"]);
        work.subjects.push(done_today);
        let report = ExtractionWorker::new(ctx, work).run().await;

        assert_eq!(report.processed, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(portal.stats().extraction_attempts(), 4);
        assert_eq!(portal.stats().closed(), 1);

        let stored = store.find_subject_by_key("2").await.unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Subject 2"));
        assert!(stored.queried_on(today()));
        assert_eq!(signal.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_subject_is_skipped_without_stopping_the_worker() {
        let portal = portal_with(&["1", "2"]);
        portal.fail_extraction("1", usize::MAX).await;
        let store = Arc::new(MemoryStore::new());
        let ctx = context(
            &portal,
            store.clone(),
            Arc::new(CountingSignal::default()),
            ExtractionSettings::default(),
        );

        let report = ExtractionWorker::new(ctx, assignment(&["1", "2"])).run().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(portal.stats().extraction_attempts(), 6);
        assert!(store.find_subject_by_key("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sustained_failure_trips_the_circuit_once() {
        let ids: Vec<String> = (1..=40).map(|i| i.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let portal = portal_with(&id_refs);
        portal.fail_all_extractions().await;
        let signal = Arc::new(CountingSignal::default());
        let ctx = context(
            &portal,
            Arc::new(MemoryStore::new()),
            signal.clone(),
            ExtractionSettings::default(),
        );

        let report = ExtractionWorker::new(ctx, assignment(&id_refs)).run().await;

        // 5 attempts per subject: the 100th consecutive failure lands on subject 20
        assert!(report.circuit_broken);
        assert!(report.relaunch_requested);
        assert_eq!(report.processed, 20);
        assert_eq!(portal.stats().extraction_attempts(), 100);
        assert_eq!(signal.requests.load(Ordering::SeqCst), 1);
        assert_eq!(portal.stats().closed(), 1);
    }

    #[tokio::test]
    async fn halted_run_starts_no_new_session() {
        let portal = portal_with(&["1", "2"]);
        let ctx = context(
            &portal,
            Arc::new(MemoryStore::new()),
            Arc::new(CountingSignal::default()),
            ExtractionSettings::default(),
        );
        ctx.halt.cancel();

        let report = ExtractionWorker::new(ctx, assignment(&["1", "2"])).run().await;
        assert!(report.halted);
        assert_eq!(report.processed, 0);
        assert_eq!(portal.stats().opened(), 0);
    }

    #[tokio::test]
    async fn tripping_the_breaker_halts_the_whole_run() {
        let portal = portal_with(&["1", "2", "3"]);
        portal.fail_all_extractions().await;
        let settings = ExtractionSettings {
            attempts_per_subject: 1,
            failure_threshold: 2,
            ..Default::default()
        };
        let ctx = context(
            &portal,
            Arc::new(MemoryStore::new()),
            Arc::new(CountingSignal::default()),
            settings,
        );
        let halt = ctx.halt.clone();

        let report = ExtractionWorker::new(ctx, assignment(&["1", "2", "3"])).run().await;
        assert!(report.circuit_broken);
        assert_eq!(report.processed, 2);
        assert!(halt.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_still_closes_the_session() {
        let portal = portal_with(&["1", "2", "3"]);
        portal.set_step_delay(Duration::from_secs(60)).await;
        let ctx = context(
            &portal,
            Arc::new(MemoryStore::new()),
            Arc::new(CountingSignal::default()),
            ExtractionSettings::default(),
        );
        let cancel = ctx.cancel.clone();

        let handle = tokio::spawn(ExtractionWorker::new(ctx, assignment(&["1", "2", "3"])).run());
        tokio::time::sleep(Duration::from_secs(90)).await;
        cancel.cancel();
        let report = handle.await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.succeeded, 0);
        assert_eq!(portal.stats().opened(), 1);
        assert_eq!(portal.stats().closed(), 1);
    }
}
