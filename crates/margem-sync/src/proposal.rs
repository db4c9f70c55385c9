use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use margem_core::{parse_brl_cents, today, Credential, Proposal, ProposalPatch, Subject};
use margem_portal::{
    Action, AutomationSession, Condition, Element, Extracted, Extraction, Navigation, Screen,
    SessionError, SessionFactory,
};
use margem_storage::SubjectStore;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ProposalSettings;
use crate::credentials::{CredentialPool, CredentialSource, CredentialUse};
use crate::pool::{await_workers, split_evenly};
use crate::reconcile::ReconciliationEngine;
use crate::single_flight::SingleFlight;
use crate::{RunOutcome, SyncError, SyncResult};

/// States of one proposal chain for a (subject, relationship) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Start,
    FormOpened,
    EmployerSelected,
    SubjectIdentified,
    RelationshipSelected,
    MarginEntered,
    SimulationCalculated,
    TableOptionChosen,
    InsuranceWaived,
    AttemptSucceeded,
    AttemptFailed,
}

impl WorkflowState {
    /// The state reached when the step out of `self` succeeds.
    pub fn next(self) -> WorkflowState {
        use WorkflowState::*;
        match self {
            Start => FormOpened,
            FormOpened => EmployerSelected,
            EmployerSelected => SubjectIdentified,
            SubjectIdentified => RelationshipSelected,
            RelationshipSelected => MarginEntered,
            MarginEntered => SimulationCalculated,
            SimulationCalculated => TableOptionChosen,
            TableOptionChosen => InsuranceWaived,
            InsuranceWaived | AttemptSucceeded => AttemptSucceeded,
            AttemptFailed => AttemptFailed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::AttemptSucceeded | WorkflowState::AttemptFailed)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One relationship of an eligible subject, with the margin to offer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalTarget {
    pub taxpayer_id: String,
    pub registration: String,
    pub margin: String,
}

impl ProposalTarget {
    /// Relationships of `subject` whose latest snapshot has a usable margin.
    pub fn for_subject(subject: &Subject) -> Vec<ProposalTarget> {
        subject
            .relationships
            .iter()
            .filter(|r| r.eligible_margin().is_some())
            .filter_map(|r| {
                r.latest_history().map(|h| ProposalTarget {
                    taxpayer_id: subject.taxpayer_id.clone(),
                    registration: r.registration.clone(),
                    margin: h.benefit_margin.trim().to_string(),
                })
            })
            .collect()
    }
}

#[derive(Debug)]
struct StepFailure {
    state: WorkflowState,
    error: SessionError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetOutcome {
    /// Chain and finalisation both completed.
    Finalized(String),
    /// Chain succeeded; finalisation stopped early. Partial state is kept.
    Incomplete(Option<String>),
    /// Every chain attempt failed.
    Exhausted,
}

/// Drives proposal chains through one session.
pub struct ProposalWorkflow {
    engine: Arc<ReconciliationEngine>,
    settings: ProposalSettings,
}

impl ProposalWorkflow {
    pub fn new(engine: Arc<ReconciliationEngine>, settings: ProposalSettings) -> Self {
        Self { engine, settings }
    }

    fn store(&self) -> &Arc<dyn SubjectStore> {
        self.engine.store()
    }

    /// Performs the single action leaving `state`.
    async fn advance(
        &self,
        state: WorkflowState,
        session: &mut dyn AutomationSession,
        target: &ProposalTarget,
    ) -> Result<WorkflowState, SessionError> {
        use WorkflowState::*;
        match state {
            Start => {
                session.navigate(Navigation::To(Screen::ProposalForm)).await?;
                session
                    .wait_until(Condition::OnScreen(Screen::ProposalForm), self.settings.step_timeout)
                    .await?;
            }
            FormOpened => {
                session
                    .act(Action::SelectEmployer(self.settings.employer_code.clone()))
                    .await?
            }
            EmployerSelected => {
                session
                    .act(Action::SubmitTaxpayerId(target.taxpayer_id.clone()))
                    .await?
            }
            SubjectIdentified => {
                session
                    .act(Action::SelectRelationship {
                        registration: target.registration.clone(),
                    })
                    .await?
            }
            RelationshipSelected => session.act(Action::EnterMargin(target.margin.clone())).await?,
            MarginEntered => {
                session.act(Action::CalculateSimulation).await?;
                session
                    .wait_until(
                        Condition::Visible(Element::SimulationResult),
                        self.settings.step_timeout,
                    )
                    .await?;
            }
            SimulationCalculated => session.act(Action::ChooseFirstTableOption).await?,
            TableOptionChosen => session.act(Action::WaiveInsurance).await?,
            InsuranceWaived | AttemptSucceeded | AttemptFailed => {}
        }
        Ok(state.next())
    }

    /// Runs the chain from `Start` to `InsuranceWaived` once.
    async fn run_chain(
        &self,
        session: &mut dyn AutomationSession,
        target: &ProposalTarget,
    ) -> Result<(), StepFailure> {
        let mut state = WorkflowState::Start;
        while state != WorkflowState::InsuranceWaived {
            state = self
                .advance(state, session, target)
                .await
                .map_err(|error| StepFailure { state, error })?;
            if state == WorkflowState::RelationshipSelected {
                self.capture_phone(session, &target.taxpayer_id).await;
            }
        }
        Ok(())
    }

    async fn capture_phone(&self, session: &mut dyn AutomationSession, taxpayer_id: &str) {
        let phone = match session.extract(Extraction::ContactPhone).await {
            Ok(Extracted::Phone(Some(phone))) => phone,
            Ok(Extracted::Phone(None)) => return,
            Ok(other) => {
                debug!(%taxpayer_id, got = ?other, "unexpected phone extraction");
                return;
            }
            Err(err) => {
                debug!(%taxpayer_id, error = %err, "phone not readable");
                return;
            }
        };
        if let Err(err) = self.engine.update_phone(taxpayer_id, &phone).await {
            warn!(%taxpayer_id, error = %err, "could not store phone");
        }
    }

    /// Chain with bounded retries, then the one-shot finalisation.
    async fn run_target(
        &self,
        session: &mut dyn AutomationSession,
        target: &ProposalTarget,
    ) -> TargetOutcome {
        let attempts = self.settings.chain_attempts.max(1);
        for attempt in 1..=attempts {
            match self.run_chain(session, target).await {
                Ok(()) => {
                    info!(
                        taxpayer_id = %target.taxpayer_id,
                        registration = %target.registration,
                        attempt,
                        "proposal chain completed"
                    );
                    return self.finalize(session, target).await;
                }
                Err(StepFailure { state, error }) => {
                    warn!(
                        taxpayer_id = %target.taxpayer_id,
                        registration = %target.registration,
                        attempt,
                        %state,
                        error = %error,
                        "proposal chain attempt failed"
                    );
                    if let Err(err) = session.navigate(Navigation::To(Screen::Main)).await {
                        debug!(error = %err, "reset navigation failed");
                    }
                    tokio::time::sleep(self.settings.retry_pause).await;
                }
            }
        }
        error!(
            taxpayer_id = %target.taxpayer_id,
            registration = %target.registration,
            attempts,
            "proposal chain exhausted; skipping relationship"
        );
        TargetOutcome::Exhausted
    }

    async fn finalize(
        &self,
        session: &mut dyn AutomationSession,
        target: &ProposalTarget,
    ) -> TargetOutcome {
        let mut proposal = match self.ensure_partial(&target.taxpayer_id, today()).await {
            Ok(proposal) => proposal,
            Err(err) => {
                error!(taxpayer_id = %target.taxpayer_id, error = %err, "could not record partial proposal");
                return TargetOutcome::Incomplete(None);
            }
        };
        match self.finalize_steps(session, &mut proposal).await {
            Ok(number) => {
                info!(taxpayer_id = %target.taxpayer_id, %number, "proposal finalised");
                TargetOutcome::Finalized(number)
            }
            Err(err) => {
                warn!(
                    taxpayer_id = %target.taxpayer_id,
                    number = ?proposal.number,
                    error = %err,
                    "proposal finalisation stopped; partial state kept"
                );
                TargetOutcome::Incomplete(proposal.number.clone())
            }
        }
    }

    /// Today's unnumbered proposal for the subject, or a new one.
    async fn ensure_partial(&self, taxpayer_id: &str, date: NaiveDate) -> SyncResult<Proposal> {
        if let Some(existing) = self
            .store()
            .find_proposal_by_subject_and_date(taxpayer_id, date)
            .await?
            .filter(|p| p.number.is_none())
        {
            return Ok(existing);
        }
        Ok(self
            .store()
            .save_proposal(Proposal::partial(taxpayer_id, date))
            .await?)
    }

    async fn patch(&self, proposal: &mut Proposal, patch: ProposalPatch) -> SyncResult<()> {
        if patch.apply(proposal) {
            *proposal = self.store().save_proposal(proposal.clone()).await?;
        }
        Ok(())
    }

    async fn finalize_steps(
        &self,
        session: &mut dyn AutomationSession,
        proposal: &mut Proposal,
    ) -> SyncResult<String> {
        let timeout = self.settings.step_timeout;

        session.act(Action::SubmitProposal).await?;
        let number = match session.extract(Extraction::ProposalNumber).await? {
            Extracted::ProposalNumber(number) => number.trim().to_string(),
            other => return Err(SessionError::unexpected("proposal number", &other).into()),
        };
        self.patch(proposal, ProposalPatch::number(number.clone())).await?;

        session
            .act(Action::AttachDocument(self.settings.document_path.clone()))
            .await?;
        session.act(Action::Approve).await?;
        session.act(Action::ReturnToMain).await?;
        session.navigate(Navigation::To(Screen::ProposalQueue)).await?;
        session.act(Action::SearchProposal(number.clone())).await?;
        session
            .wait_until(Condition::Visible(Element::ProposalRow(number.clone())), timeout)
            .await?;

        match session.extract(Extraction::ProposalAmounts).await? {
            Extracted::Amounts {
                disbursed,
                installment,
            } => {
                let patch = ProposalPatch::amounts(parse_brl_cents(&disbursed), parse_brl_cents(&installment));
                self.patch(proposal, patch).await?;
            }
            other => return Err(SessionError::unexpected("proposal amounts", &other).into()),
        }

        match session.extract(Extraction::SignatureLink).await? {
            Extracted::SignatureLink(link) => {
                self.patch(proposal, ProposalPatch::signature_link(link)).await?;
            }
            other => return Err(SessionError::unexpected("signature link", &other).into()),
        }

        if let Err(err) = session.navigate(Navigation::To(Screen::Main)).await {
            debug!(error = %err, "returning to main screen failed");
        }
        Ok(number)
    }

    /// Whether `taxpayer_id` already received a numbered proposal on `date`.
    async fn proposed_on(&self, taxpayer_id: &str, date: NaiveDate) -> SyncResult<bool> {
        Ok(self
            .store()
            .proposals_for_subject(taxpayer_id)
            .await?
            .iter()
            .any(|p| p.created_on == date && p.number.is_some()))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProposalWorkerReport {
    pub slot: usize,
    pub subjects: usize,
    pub targets: usize,
    pub finalized: usize,
    pub incomplete: usize,
    pub failed: usize,
    pub skipped: usize,
    pub login_failed: bool,
    pub cancelled: bool,
    /// Portal numbers of every proposal submitted by this worker.
    pub numbers: Vec<String>,
}

impl ProposalWorkerReport {
    fn record(&mut self, outcome: TargetOutcome) {
        match outcome {
            TargetOutcome::Finalized(number) => {
                self.finalized += 1;
                self.numbers.push(number);
            }
            TargetOutcome::Incomplete(number) => {
                self.incomplete += 1;
                self.numbers.extend(number);
            }
            TargetOutcome::Exhausted => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalRunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub eligible: usize,
    pub targets: usize,
    pub finalized: usize,
    pub incomplete: usize,
    pub failed: usize,
    pub skipped: usize,
    pub sessions_failed: usize,
    pub timed_out: bool,
    pub workers: Vec<ProposalWorkerReport>,
}

struct RunnerInner {
    workflow: Arc<ProposalWorkflow>,
    sessions: Arc<dyn SessionFactory>,
    credentials: Arc<dyn CredentialSource>,
    flight: SingleFlight,
}

/// Single-flight proposal run across a fixed pool of sessions.
#[derive(Clone)]
pub struct ProposalRunner {
    inner: Arc<RunnerInner>,
}

impl ProposalRunner {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        sessions: Arc<dyn SessionFactory>,
        credentials: Arc<dyn CredentialSource>,
        settings: ProposalSettings,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                workflow: Arc::new(ProposalWorkflow::new(engine, settings)),
                sessions,
                credentials,
                flight: SingleFlight::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.flight.is_running()
    }

    pub async fn run(&self) -> RunOutcome<ProposalRunReport> {
        let Some(_flight) = self.inner.flight.try_begin() else {
            info!("proposal run already in progress; trigger ignored");
            return RunOutcome::AlreadyRunning;
        };
        let run_id = Uuid::new_v4();
        match self
            .execute(run_id)
            .instrument(info_span!("proposal_run", %run_id))
            .await
        {
            Ok(report) => RunOutcome::Completed { run_id, report },
            Err(err) => {
                error!(%run_id, error = %err, "proposal run failed");
                RunOutcome::Failed {
                    run_id,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn execute(&self, run_id: Uuid) -> SyncResult<ProposalRunReport> {
        let workflow = &self.inner.workflow;
        let settings = &workflow.settings;
        let credentials = self
            .inner
            .credentials
            .load()
            .await
            .map_err(|err| SyncError::Config(format!("{err:#}")))?;
        let pool = CredentialPool::for_run(credentials, CredentialUse::Proposals)?;
        let eligible = workflow.engine.eligible_for_proposal().await?;

        let started_at = Utc::now();
        let mut report = ProposalRunReport {
            run_id,
            started_at,
            finished_at: started_at,
            eligible: eligible.len(),
            targets: 0,
            finalized: 0,
            incomplete: 0,
            failed: 0,
            skipped: 0,
            sessions_failed: 0,
            timed_out: false,
            workers: Vec::new(),
        };
        info!(eligible = report.eligible, credentials = pool.len(), "proposal run started");

        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();
        for (slot, subjects) in split_evenly(eligible, settings.worker_count)
            .into_iter()
            .enumerate()
        {
            let worker = ProposalWorker {
                slot,
                credential: pool.credentials_for_worker(slot).clone(),
                subjects,
                workflow: Arc::clone(workflow),
                sessions: Arc::clone(&self.inner.sessions),
                cancel: cancel.clone(),
            };
            workers.spawn(worker.run().instrument(info_span!("proposal_worker", %run_id, slot)));
        }

        let timed_out = await_workers(
            &mut workers,
            &cancel,
            settings.run_timeout,
            settings.cancel_grace,
            |worker: ProposalWorkerReport| {
                report.targets += worker.targets;
                report.finalized += worker.finalized;
                report.incomplete += worker.incomplete;
                report.failed += worker.failed;
                report.skipped += worker.skipped;
                report.sessions_failed += usize::from(worker.login_failed);
                report.workers.push(worker);
            },
        )
        .await;
        report.timed_out = timed_out;
        report.workers.sort_by_key(|w| w.slot);
        report.finished_at = Utc::now();
        info!(
            targets = report.targets,
            finalized = report.finalized,
            incomplete = report.incomplete,
            failed = report.failed,
            timed_out = report.timed_out,
            "proposal run finished"
        );
        Ok(report)
    }
}

struct ProposalWorker {
    slot: usize,
    credential: Credential,
    subjects: Vec<Subject>,
    workflow: Arc<ProposalWorkflow>,
    sessions: Arc<dyn SessionFactory>,
    cancel: CancellationToken,
}

impl ProposalWorker {
    async fn run(self) -> ProposalWorkerReport {
        let mut report = ProposalWorkerReport {
            slot: self.slot,
            subjects: self.subjects.len(),
            ..Default::default()
        };
        if self.cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }
        let mut session = match self.sessions.open_session(&self.credential).await {
            Ok(session) => session,
            Err(err) => {
                error!(username = %self.credential.username, error = %err, "could not open session");
                report.login_failed = true;
                return report;
            }
        };

        let cancelled = tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = self.process_all(session.as_mut(), &mut report) => false,
        };
        if cancelled {
            warn!("proposal worker cancelled; closing session");
            report.cancelled = true;
        }
        if let Err(err) = session.close().await {
            warn!(error = %err, "closing session failed");
        }
        report
    }

    async fn process_all(&self, session: &mut dyn AutomationSession, report: &mut ProposalWorkerReport) {
        let today = today();
        for subject in &self.subjects {
            match self.workflow.proposed_on(&subject.taxpayer_id, today).await {
                Ok(true) => {
                    report.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(taxpayer_id = %subject.taxpayer_id, error = %err, "could not check earlier proposals");
                    continue;
                }
            }
            for target in ProposalTarget::for_subject(subject) {
                report.targets += 1;
                let outcome = self.workflow.run_target(session, &target).await;
                report.record(outcome);
            }
        }
    }
}
