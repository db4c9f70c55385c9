//! Capability interface for driving the external portal, plus a
//! fixture-first scripted implementation.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use margem_core::{Credential, SourceRecord};
use thiserror::Error;

mod scripted;

pub use scripted::{
    load_portal_fixture, FixtureAmounts, FixtureRecord, FixtureRelationship, PortalFixture,
    ScriptedPortal, ScriptedStats,
};

pub const CRATE_NAME: &str = "margem-portal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Screen {
    Main,
    MarginQuery,
    ProposalForm,
    ProposalQueue,
    CancellationForm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Back,
    Refresh,
    To(Screen),
}

/// Everything the cancellation form asks for one proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationRequest {
    pub proposal_number: String,
    pub subject_name: String,
    pub taxpayer_id: String,
    pub reason: String,
    pub promoter: String,
    pub contact_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    EnterTaxpayerId(String),
    SubmitMarginQuery,
    CloseResultPanel,
    SelectEmployer(String),
    SubmitTaxpayerId(String),
    SelectRelationship { registration: String },
    EnterMargin(String),
    CalculateSimulation,
    ChooseFirstTableOption,
    WaiveInsurance,
    SubmitProposal,
    AttachDocument(PathBuf),
    Approve,
    ReturnToMain,
    SearchProposal(String),
    SubmitCancellation(CancellationRequest),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::EnterTaxpayerId(_) => "enter_taxpayer_id",
            Action::SubmitMarginQuery => "submit_margin_query",
            Action::CloseResultPanel => "close_result_panel",
            Action::SelectEmployer(_) => "select_employer",
            Action::SubmitTaxpayerId(_) => "submit_taxpayer_id",
            Action::SelectRelationship { .. } => "select_relationship",
            Action::EnterMargin(_) => "enter_margin",
            Action::CalculateSimulation => "calculate_simulation",
            Action::ChooseFirstTableOption => "choose_first_table_option",
            Action::WaiveInsurance => "waive_insurance",
            Action::SubmitProposal => "submit_proposal",
            Action::AttachDocument(_) => "attach_document",
            Action::Approve => "approve",
            Action::ReturnToMain => "return_to_main",
            Action::SearchProposal(_) => "search_proposal",
            Action::SubmitCancellation(_) => "submit_cancellation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    MarginResult,
    SimulationResult,
    ProposalRow(String),
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::MarginResult => f.write_str("margin result"),
            Element::SimulationResult => f.write_str("simulation result"),
            Element::ProposalRow(number) => write!(f, "proposal row {number}"),
        }
    }
}

/// Suspension points of a workflow; `wait_until` resolves when one holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    OnScreen(Screen),
    Visible(Element),
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::OnScreen(screen) => write!(f, "screen {screen:?}"),
            Condition::Visible(element) => write!(f, "{element} visible"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    MarginRecord,
    ContactPhone,
    ProposalNumber,
    ProposalAmounts,
    SignatureLink,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Record(SourceRecord),
    Phone(Option<String>),
    ProposalNumber(String),
    Amounts { disbursed: String, installment: String },
    SignatureLink(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("login rejected for {username}")]
    Login { username: String },
    #[error("element missing: {0}")]
    ElementMissing(String),
    #[error("timed out after {timeout:?} waiting for {condition}")]
    Timeout { timeout: Duration, condition: String },
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("session already closed")]
    Closed,
    #[error("unexpected portal response: {0}")]
    Unexpected(String),
}

impl SessionError {
    pub fn unexpected(expected: &str, got: &Extracted) -> Self {
        SessionError::Unexpected(format!("expected {expected}, got {got:?}"))
    }
}

/// One logged-in browser session. Implementations are driven by a single
/// worker and never shared.
#[async_trait]
pub trait AutomationSession: Send {
    async fn navigate(&mut self, to: Navigation) -> Result<(), SessionError>;

    async fn act(&mut self, action: Action) -> Result<(), SessionError>;

    async fn find(&mut self, element: &Element) -> Result<bool, SessionError>;

    async fn extract(&mut self, what: Extraction) -> Result<Extracted, SessionError>;

    async fn wait_until(&mut self, condition: Condition, timeout: Duration) -> Result<(), SessionError>;

    /// Releases the underlying browser. Must be safe to call more than once.
    async fn close(&mut self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Opens a session and logs in with `credential`.
    async fn open_session(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn AutomationSession>, SessionError>;
}
