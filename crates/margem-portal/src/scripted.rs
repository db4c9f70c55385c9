use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use margem_core::{
    normalize_registration, normalize_taxpayer_id, today, Credential, HistoryEntry, Relationship,
    SourceRecord,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    Action, AutomationSession, Condition, Element, Extracted, Extraction, Navigation, Screen,
    SessionError, SessionFactory,
};

/// Canned portal contents: what each taxpayer's margin query returns and how
/// the proposal queue answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortalFixture {
    #[serde(default)]
    pub records: Vec<FixtureRecord>,
    #[serde(default)]
    pub rejected_usernames: Vec<String>,
    #[serde(default)]
    pub amounts: FixtureAmounts,
    #[serde(default = "default_signature_base_url")]
    pub signature_base_url: String,
}

fn default_signature_base_url() -> String {
    "https://assinatura.portal.local/p".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureAmounts {
    pub disbursed: String,
    pub installment: String,
}

impl Default for FixtureAmounts {
    fn default() -> Self {
        Self {
            disbursed: "1.234,56".to_string(),
            installment: "98,70".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureRecord {
    pub taxpayer_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub relationships: Vec<FixtureRelationship>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureRelationship {
    pub kind: Option<String>,
    pub issuer: Option<String>,
    pub registration: String,
    pub holder_registration: Option<String>,
    pub credit_margin: String,
    pub credit_authorization: String,
    pub credit_status: String,
    pub benefit_margin: String,
    pub benefit_authorization: String,
    pub benefit_status: String,
}

impl FixtureRecord {
    /// Margin query result as the portal would show it on `query_date`.
    pub fn to_source_record(&self, query_date: NaiveDate) -> SourceRecord {
        let mut record = SourceRecord::new(&self.taxpayer_id);
        record.name = self.name.clone();
        record.relationships = self
            .relationships
            .iter()
            .map(|r| {
                let mut relationship = Relationship::new(r.issuer.as_deref(), &r.registration);
                relationship.kind = r.kind.clone();
                relationship.holder_registration = r.holder_registration.clone();
                relationship.history.push(HistoryEntry {
                    query_date,
                    credit_margin: r.credit_margin.clone(),
                    credit_authorization: r.credit_authorization.clone(),
                    credit_status: r.credit_status.clone(),
                    benefit_margin: r.benefit_margin.clone(),
                    benefit_authorization: r.benefit_authorization.clone(),
                    benefit_status: r.benefit_status.clone(),
                });
                relationship
            })
            .collect();
        record
    }
}

pub fn load_portal_fixture(path: impl AsRef<Path>) -> Result<PortalFixture> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Default)]
pub struct ScriptedStats {
    pub sessions_opened: AtomicUsize,
    pub sessions_closed: AtomicUsize,
    pub extraction_attempts: AtomicUsize,
    pub proposals_submitted: AtomicUsize,
    pub cancellations_submitted: AtomicUsize,
}

impl ScriptedStats {
    pub fn opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn extraction_attempts(&self) -> usize {
        self.extraction_attempts.load(Ordering::SeqCst)
    }

    pub fn proposals_submitted(&self) -> usize {
        self.proposals_submitted.load(Ordering::SeqCst)
    }

    pub fn cancellations_submitted(&self) -> usize {
        self.cancellations_submitted.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Control {
    query_date: NaiveDate,
    step_delay: Duration,
    fail_all_extractions: bool,
    extraction_failures: HashMap<String, usize>,
    action_failures: HashMap<&'static str, usize>,
    chain_failures: HashMap<String, usize>,
}

fn take_failure<K, Q>(failures: &mut HashMap<K, usize>, key: &Q) -> bool
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    match failures.get_mut(key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

#[derive(Debug)]
struct PortalState {
    records: HashMap<String, FixtureRecord>,
    rejected_usernames: HashSet<String>,
    amounts: FixtureAmounts,
    signature_base_url: String,
    control: Mutex<Control>,
    log: Mutex<Vec<String>>,
    issued: Mutex<HashSet<String>>,
    next_number: AtomicU64,
    stats: ScriptedStats,
}

/// In-process portal driven by a [`PortalFixture`]. Clones share state, so a
/// test can keep a handle for failure injection and counters.
#[derive(Debug, Clone)]
pub struct ScriptedPortal {
    state: Arc<PortalState>,
}

impl ScriptedPortal {
    pub fn new(fixture: PortalFixture) -> Self {
        let records = fixture
            .records
            .into_iter()
            .map(|r| (normalize_taxpayer_id(&r.taxpayer_id), r))
            .collect();
        Self {
            state: Arc::new(PortalState {
                records,
                rejected_usernames: fixture.rejected_usernames.into_iter().collect(),
                amounts: fixture.amounts,
                signature_base_url: fixture.signature_base_url,
                control: Mutex::new(Control {
                    query_date: today(),
                    step_delay: Duration::ZERO,
                    fail_all_extractions: false,
                    extraction_failures: HashMap::new(),
                    action_failures: HashMap::new(),
                    chain_failures: HashMap::new(),
                }),
                log: Mutex::new(Vec::new()),
                issued: Mutex::new(HashSet::new()),
                next_number: AtomicU64::new(1),
                stats: ScriptedStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> &ScriptedStats {
        &self.state.stats
    }

    pub async fn action_log(&self) -> Vec<String> {
        self.state.log.lock().await.clone()
    }

    pub async fn set_query_date(&self, date: NaiveDate) {
        self.state.control.lock().await.query_date = date;
    }

    /// Every step sleeps this long before acting.
    pub async fn set_step_delay(&self, delay: Duration) {
        self.state.control.lock().await.step_delay = delay;
    }

    pub async fn fail_all_extractions(&self) {
        self.state.control.lock().await.fail_all_extractions = true;
    }

    pub async fn fail_extraction(&self, taxpayer_id: &str, times: usize) {
        self.state
            .control
            .lock()
            .await
            .extraction_failures
            .insert(normalize_taxpayer_id(taxpayer_id), times);
    }

    pub async fn fail_action(&self, action: &'static str, times: usize) {
        self.state
            .control
            .lock()
            .await
            .action_failures
            .insert(action, times);
    }

    /// Makes the insurance waiver fail for `registration`, ending the
    /// proposal chain after all earlier steps ran.
    pub async fn fail_chain(&self, registration: &str, times: usize) {
        self.state
            .control
            .lock()
            .await
            .chain_failures
            .insert(normalize_registration(registration), times);
    }
}

#[async_trait]
impl SessionFactory for ScriptedPortal {
    async fn open_session(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn AutomationSession>, SessionError> {
        self.state
            .log
            .lock()
            .await
            .push(format!("login:{}", credential.username));
        if self.state.rejected_usernames.contains(&credential.username) {
            return Err(SessionError::Login {
                username: credential.username.clone(),
            });
        }
        self.state.stats.sessions_opened.fetch_add(1, Ordering::SeqCst);
        debug!(username = %credential.username, "scripted session opened");
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
            screen: Screen::Main,
            taxpayer: None,
            registration: None,
            submitted: None,
            searched: None,
            closed: false,
        }))
    }
}

struct ScriptedSession {
    state: Arc<PortalState>,
    screen: Screen,
    taxpayer: Option<String>,
    registration: Option<String>,
    submitted: Option<String>,
    searched: Option<String>,
    closed: bool,
}

impl ScriptedSession {
    async fn step(&mut self, label: &str) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let delay = self.state.control.lock().await.step_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.log.lock().await.push(label.to_string());
        Ok(())
    }

    fn require_screen(&self, screen: Screen) -> Result<(), SessionError> {
        if self.screen == screen {
            Ok(())
        } else {
            Err(SessionError::Navigation(format!(
                "expected {screen:?}, on {:?}",
                self.screen
            )))
        }
    }

    fn record(&self) -> Result<&FixtureRecord, SessionError> {
        self.taxpayer
            .as_ref()
            .and_then(|id| self.state.records.get(id))
            .ok_or_else(|| SessionError::ElementMissing("subject record".to_string()))
    }

    fn require_registration(&self) -> Result<&str, SessionError> {
        self.registration
            .as_deref()
            .ok_or_else(|| SessionError::Navigation("no relationship selected".to_string()))
    }

    fn require_submitted(&self) -> Result<&str, SessionError> {
        self.submitted
            .as_deref()
            .ok_or_else(|| SessionError::Navigation("no proposal submitted".to_string()))
    }

    async fn searched_issued(&self) -> Option<String> {
        let number = self.searched.clone()?;
        self.state
            .issued
            .lock()
            .await
            .contains(&number)
            .then_some(number)
    }

    async fn holds(&self, condition: &Condition) -> bool {
        match condition {
            Condition::OnScreen(screen) => self.screen == *screen,
            Condition::Visible(Element::MarginResult) => self.record().is_ok(),
            Condition::Visible(Element::SimulationResult) => self.registration.is_some(),
            Condition::Visible(Element::ProposalRow(number)) => {
                self.searched_issued().await.as_deref() == Some(number.as_str())
            }
        }
    }
}

#[async_trait]
impl AutomationSession for ScriptedSession {
    async fn navigate(&mut self, to: Navigation) -> Result<(), SessionError> {
        self.step(&format!("navigate:{to:?}")).await?;
        match to {
            Navigation::Back => self.screen = Screen::Main,
            Navigation::Refresh => {}
            Navigation::To(screen) => self.screen = screen,
        }
        Ok(())
    }

    async fn act(&mut self, action: Action) -> Result<(), SessionError> {
        let name = action.name();
        self.step(name).await?;
        if take_failure(&mut self.state.control.lock().await.action_failures, name) {
            return Err(SessionError::ElementMissing(format!("{name} control")));
        }

        match action {
            Action::EnterTaxpayerId(id) => {
                self.require_screen(Screen::MarginQuery)?;
                self.taxpayer = Some(normalize_taxpayer_id(&id));
            }
            Action::SubmitMarginQuery => {
                if self.taxpayer.is_none() {
                    return Err(SessionError::Navigation("no taxpayer entered".to_string()));
                }
            }
            Action::CloseResultPanel => {}
            Action::SelectEmployer(_) => self.require_screen(Screen::ProposalForm)?,
            Action::SubmitTaxpayerId(id) => {
                self.require_screen(Screen::ProposalForm)?;
                let id = normalize_taxpayer_id(&id);
                if !self.state.records.contains_key(&id) {
                    return Err(SessionError::ElementMissing(format!("subject {id}")));
                }
                self.taxpayer = Some(id);
                self.registration = None;
                self.submitted = None;
            }
            Action::SelectRelationship { registration } => {
                let registration = normalize_registration(&registration);
                let known = self
                    .record()?
                    .relationships
                    .iter()
                    .any(|r| normalize_registration(&r.registration) == registration);
                if !known {
                    return Err(SessionError::ElementMissing(format!(
                        "relationship {registration}"
                    )));
                }
                self.registration = Some(registration);
            }
            Action::EnterMargin(_) | Action::CalculateSimulation | Action::ChooseFirstTableOption => {
                self.require_registration()?;
            }
            Action::WaiveInsurance => {
                let registration = self.require_registration()?.to_string();
                if take_failure(
                    &mut self.state.control.lock().await.chain_failures,
                    registration.as_str(),
                ) {
                    return Err(SessionError::ElementMissing("insurance waiver".to_string()));
                }
            }
            Action::SubmitProposal => {
                self.require_registration()?;
                let number = format!(
                    "{:08}",
                    self.state.next_number.fetch_add(1, Ordering::SeqCst)
                );
                self.state.issued.lock().await.insert(number.clone());
                self.state
                    .stats
                    .proposals_submitted
                    .fetch_add(1, Ordering::SeqCst);
                self.submitted = Some(number);
            }
            Action::AttachDocument(_) | Action::Approve => {
                self.require_submitted()?;
            }
            Action::ReturnToMain => self.screen = Screen::Main,
            Action::SearchProposal(number) => {
                self.require_screen(Screen::ProposalQueue)?;
                self.searched = Some(number);
            }
            Action::SubmitCancellation(request) => {
                self.require_screen(Screen::CancellationForm)?;
                if request.contact_email.is_empty() || request.reason.is_empty() {
                    return Err(SessionError::ElementMissing(
                        "required cancellation field".to_string(),
                    ));
                }
                self.state.issued.lock().await.remove(&request.proposal_number);
                self.state
                    .stats
                    .cancellations_submitted
                    .fetch_add(1, Ordering::SeqCst);
                // the form resets after each submission
                self.screen = Screen::Main;
            }
        }
        Ok(())
    }

    async fn find(&mut self, element: &Element) -> Result<bool, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        Ok(self.holds(&Condition::Visible(element.clone())).await)
    }

    async fn extract(&mut self, what: Extraction) -> Result<Extracted, SessionError> {
        self.step(&format!("extract:{what:?}")).await?;
        match what {
            Extraction::MarginRecord => {
                self.state
                    .stats
                    .extraction_attempts
                    .fetch_add(1, Ordering::SeqCst);
                let (failing, query_date) = {
                    let mut control = self.state.control.lock().await;
                    let forced = self
                        .taxpayer
                        .as_deref()
                        .map(|id| take_failure(&mut control.extraction_failures, id))
                        .unwrap_or(false);
                    (control.fail_all_extractions || forced, control.query_date)
                };
                if failing {
                    return Err(SessionError::ElementMissing("margin table".to_string()));
                }
                Ok(Extracted::Record(self.record()?.to_source_record(query_date)))
            }
            Extraction::ContactPhone => Ok(Extracted::Phone(self.record()?.phone.clone())),
            Extraction::ProposalNumber => {
                Ok(Extracted::ProposalNumber(self.require_submitted()?.to_string()))
            }
            Extraction::ProposalAmounts => {
                self.searched_issued()
                    .await
                    .ok_or_else(|| SessionError::ElementMissing("proposal amounts".to_string()))?;
                Ok(Extracted::Amounts {
                    disbursed: self.state.amounts.disbursed.clone(),
                    installment: self.state.amounts.installment.clone(),
                })
            }
            Extraction::SignatureLink => {
                let number = self
                    .searched_issued()
                    .await
                    .ok_or_else(|| SessionError::ElementMissing("signature link".to_string()))?;
                Ok(Extracted::SignatureLink(format!(
                    "{}/{number}",
                    self.state.signature_base_url.trim_end_matches('/')
                )))
            }
        }
    }

    async fn wait_until(&mut self, condition: Condition, timeout: Duration) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if self.holds(&condition).await {
            Ok(())
        } else {
            Err(SessionError::Timeout {
                timeout,
                condition: condition.to_string(),
            })
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if !self.closed {
            self.closed = true;
            self.state.stats.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
