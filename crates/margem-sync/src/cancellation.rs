//! Proposal cancellation through the portal's cancellation form.
//!
//! A proposal row is deleted only after the form for its number was
//! submitted, so a failed submission leaves the proposal in place for the
//! next request.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use margem_core::Proposal;
use margem_portal::{
    Action, AutomationSession, CancellationRequest, Condition, Navigation, Screen, SessionError,
    SessionFactory,
};
use margem_storage::SubjectStore;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::CancellationSettings;
use crate::credentials::{CredentialPool, CredentialSource, CredentialUse};
use crate::reconcile::ReconciliationEngine;
use crate::single_flight::SingleFlight;
use crate::{RunOutcome, SyncError, SyncResult};

#[derive(Debug, Clone, Serialize)]
pub struct CancellationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested: usize,
    pub cancelled: Vec<String>,
    pub not_found: Vec<String>,
    pub failed: Vec<String>,
}

impl CancellationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.not_found.is_empty()
    }
}

struct CancellationInner {
    store: Arc<dyn SubjectStore>,
    sessions: Arc<dyn SessionFactory>,
    credentials: Arc<dyn CredentialSource>,
    settings: RwLock<CancellationSettings>,
    flight: SingleFlight,
}

/// Single-flight cancellation run over one portal session.
#[derive(Clone)]
pub struct CancellationJob {
    inner: Arc<CancellationInner>,
}

/// Trimmed, de-duplicated, in request order.
fn unique_numbers(numbers: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    numbers
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(n.clone()))
        .collect()
}

impl CancellationJob {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        sessions: Arc<dyn SessionFactory>,
        credentials: Arc<dyn CredentialSource>,
        settings: CancellationSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CancellationInner {
                store: Arc::clone(engine.store()),
                sessions,
                credentials,
                settings: RwLock::new(settings),
                flight: SingleFlight::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.flight.is_running()
    }

    pub async fn settings(&self) -> CancellationSettings {
        self.inner.settings.read().await.clone()
    }

    /// Replaces the form values used by later runs.
    pub async fn update_settings(&self, settings: CancellationSettings) -> SyncResult<()> {
        settings.validate()?;
        let mut current = self.inner.settings.write().await;
        *current = CancellationSettings {
            form_timeout: current.form_timeout,
            ..settings
        };
        info!("cancellation form settings updated");
        Ok(())
    }

    pub async fn run(&self, numbers: Vec<String>) -> RunOutcome<CancellationReport> {
        let Some(_flight) = self.inner.flight.try_begin() else {
            info!("cancellation already running; request ignored");
            return RunOutcome::AlreadyRunning;
        };
        let run_id = Uuid::new_v4();
        match self
            .execute(run_id, unique_numbers(numbers))
            .instrument(info_span!("cancellation_run", %run_id))
            .await
        {
            Ok(report) => RunOutcome::Completed { run_id, report },
            Err(err) => {
                error!(%run_id, error = %err, "cancellation run failed");
                RunOutcome::Failed {
                    run_id,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn execute(&self, run_id: Uuid, numbers: Vec<String>) -> SyncResult<CancellationReport> {
        let settings = self.settings().await;
        settings.validate()?;

        let started_at = Utc::now();
        let mut report = CancellationReport {
            run_id,
            started_at,
            finished_at: started_at,
            requested: numbers.len(),
            cancelled: Vec::new(),
            not_found: Vec::new(),
            failed: Vec::new(),
        };

        let mut requests = Vec::new();
        for number in numbers {
            match self.inner.store.find_proposal_by_number(&number).await? {
                Some(proposal) => requests.push(self.request_for(proposal, &settings).await?),
                None => {
                    warn!(%number, "no stored proposal with this number");
                    report.not_found.push(number);
                }
            }
        }

        if !requests.is_empty() {
            let credentials = self
                .inner
                .credentials
                .load()
                .await
                .map_err(|err| SyncError::Config(format!("{err:#}")))?;
            let pool = CredentialPool::for_run(credentials, CredentialUse::Proposals)?;
            let mut session = self
                .inner
                .sessions
                .open_session(pool.credentials_for_worker(0))
                .await?;

            let outcome = self
                .submit_all(session.as_mut(), requests, &settings, &mut report)
                .await;
            if let Err(err) = session.close().await {
                warn!(error = %err, "closing session failed");
            }
            outcome?;
        }

        report.finished_at = Utc::now();
        info!(
            requested = report.requested,
            cancelled = report.cancelled.len(),
            not_found = report.not_found.len(),
            failed = report.failed.len(),
            "cancellation run finished"
        );
        Ok(report)
    }

    async fn request_for(
        &self,
        proposal: Proposal,
        settings: &CancellationSettings,
    ) -> SyncResult<CancellationRequest> {
        let subject_name = self
            .inner
            .store
            .find_subject_by_key(&proposal.taxpayer_id)
            .await?
            .and_then(|s| s.name)
            .unwrap_or_default();
        Ok(CancellationRequest {
            proposal_number: proposal.number.unwrap_or_default(),
            subject_name,
            taxpayer_id: proposal.taxpayer_id,
            reason: settings.reason.clone(),
            promoter: settings.promoter.clone(),
            contact_email: settings.contact_email.clone(),
        })
    }

    /// Store failures end the run; form failures only skip the number.
    async fn submit_all(
        &self,
        session: &mut dyn AutomationSession,
        requests: Vec<CancellationRequest>,
        settings: &CancellationSettings,
        report: &mut CancellationReport,
    ) -> SyncResult<()> {
        for request in requests {
            let number = request.proposal_number.clone();
            match submit_form(session, request, settings).await {
                Ok(()) => {
                    self.inner.store.delete_proposal(&number).await?;
                    info!(%number, "proposal cancelled");
                    report.cancelled.push(number);
                }
                Err(err) => {
                    warn!(%number, error = %err, "cancellation form failed; proposal kept");
                    report.failed.push(number);
                }
            }
        }
        Ok(())
    }
}

async fn submit_form(
    session: &mut dyn AutomationSession,
    request: CancellationRequest,
    settings: &CancellationSettings,
) -> Result<(), SessionError> {
    session
        .navigate(Navigation::To(Screen::CancellationForm))
        .await?;
    session
        .wait_until(
            Condition::OnScreen(Screen::CancellationForm),
            settings.form_timeout,
        )
        .await?;
    session.act(Action::SubmitCancellation(request)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use margem_core::{Credential, Subject};
    use margem_portal::{PortalFixture, ScriptedPortal};
    use margem_storage::MemoryStore;

    use crate::credentials::StaticCredentials;

    fn settings() -> CancellationSettings {
        CancellationSettings {
            contact_email: "ops@example.com".into(),
            reason: "desistência do cliente".into(),
            promoter: "Promotora X".into(),
            ..Default::default()
        }
    }

    fn proposer() -> Credential {
        Credential::new("op", "pw")
    }

    async fn seeded(numbers: &[&str]) -> (Arc<MemoryStore>, Arc<ReconciliationEngine>) {
        let store = Arc::new(MemoryStore::new());
        let mut subject = Subject::new("01234567890");
        subject.name = Some("Ana".into());
        store.save(subject).await.unwrap();
        for number in numbers {
            let mut proposal =
                Proposal::partial("01234567890", NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
            proposal.number = Some(number.to_string());
            store.save_proposal(proposal).await.unwrap();
        }
        let engine = Arc::new(ReconciliationEngine::new(store.clone()));
        (store, engine)
    }

    fn job(engine: Arc<ReconciliationEngine>, portal: &ScriptedPortal) -> CancellationJob {
        CancellationJob::new(
            engine,
            Arc::new(portal.clone()),
            Arc::new(StaticCredentials(vec![proposer()])),
            settings(),
        )
    }

    #[test]
    fn numbers_are_trimmed_and_deduplicated() {
        let numbers = unique_numbers(vec![" 1 ".into(), "2".into(), "1".into(), "".into()]);
        assert_eq!(numbers, ["1", "2"]);
    }

    #[tokio::test]
    async fn submitted_forms_delete_their_proposals() {
        let (store, engine) = seeded(&["00000001", "00000002"]).await;
        let portal = ScriptedPortal::new(PortalFixture::default());
        let job = job(engine, &portal);

        let outcome = job
            .run(vec!["00000001".into(), "00000002".into(), "99".into()])
            .await;
        let report = outcome.report().expect("completed");

        assert_eq!(report.cancelled, ["00000001", "00000002"]);
        assert_eq!(report.not_found, ["99"]);
        assert!(!report.is_complete());
        assert_eq!(portal.stats().cancellations_submitted(), 2);
        assert_eq!(portal.stats().opened(), 1);
        assert_eq!(portal.stats().closed(), 1);
        assert!(store.find_proposal_by_number("00000001").await.unwrap().is_none());
        assert!(store.find_proposal_by_number("00000002").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_submission_keeps_the_proposal() {
        let (store, engine) = seeded(&["00000001", "00000002"]).await;
        let portal = ScriptedPortal::new(PortalFixture::default());
        portal.fail_action("submit_cancellation", 1).await;
        let job = job(engine, &portal);

        let outcome = job.run(vec!["00000001".into(), "00000002".into()]).await;
        let report = outcome.report().expect("completed");

        assert_eq!(report.failed, ["00000001"]);
        assert_eq!(report.cancelled, ["00000002"]);
        assert!(store.find_proposal_by_number("00000001").await.unwrap().is_some());
        assert!(store.find_proposal_by_number("00000002").await.unwrap().is_none());
        assert_eq!(portal.stats().closed(), 1);
    }

    #[tokio::test]
    async fn unknown_numbers_open_no_session() {
        let (_store, engine) = seeded(&[]).await;
        let portal = ScriptedPortal::new(PortalFixture::default());
        let job = job(engine, &portal);

        let outcome = job.run(vec!["42".into()]).await;
        assert_eq!(outcome.report().unwrap().not_found, ["42"]);
        assert_eq!(portal.stats().opened(), 0);
    }

    #[tokio::test]
    async fn incomplete_form_settings_fail_the_run() {
        let (store, engine) = seeded(&["00000001"]).await;
        let portal = ScriptedPortal::new(PortalFixture::default());
        let job = CancellationJob::new(
            engine,
            Arc::new(portal.clone()),
            Arc::new(StaticCredentials(vec![proposer()])),
            CancellationSettings::default(),
        );

        let outcome = job.run(vec!["00000001".into()]).await;
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert!(store.find_proposal_by_number("00000001").await.unwrap().is_some());

        assert!(job.update_settings(CancellationSettings::default()).await.is_err());
        job.update_settings(settings()).await.unwrap();
        let outcome = job.run(vec!["00000001".into()]).await;
        assert_eq!(outcome.report().unwrap().cancelled, ["00000001"]);
    }
}
