//! Core domain model for margin harvesting and proposal automation.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "margem-core";

/// Number of dated margin snapshots kept per relationship.
pub const MAX_HISTORY_ENTRIES: usize = 2;

/// Status text the portal shows for a benefit card that may not be used.
pub const UNAUTHORIZED_STATUS: &str = "Não Autorizado";

/// Partition of subjects processed by one scheduled extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Population {
    Priority,
    General,
}

impl Population {
    pub const ALL: [Population; 2] = [Population::Priority, Population::General];

    pub fn as_str(&self) -> &'static str {
        match self {
            Population::Priority => "priority",
            Population::General => "general",
        }
    }

    pub fn is_priority(&self) -> bool {
        matches!(self, Population::Priority)
    }
}

impl fmt::Display for Population {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown population {0:?}")]
pub struct UnknownPopulation(pub String);

impl FromStr for Population {
    type Err = UnknownPopulation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "priority" => Ok(Population::Priority),
            "general" => Ok(Population::General),
            other => Err(UnknownPopulation(other.to_string())),
        }
    }
}

/// Login identity for the external portal.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Known-bad accounts stay in the file but are never handed out.
    #[serde(default)]
    pub excluded: bool,
    #[serde(default = "default_true")]
    pub allow_proposals: bool,
}

fn default_true() -> bool {
    true
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            excluded: false,
            allow_proposals: true,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("excluded", &self.excluded)
            .field("allow_proposals", &self.allow_proposals)
            .finish()
    }
}

/// One dated margin snapshot of a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub query_date: NaiveDate,
    pub credit_margin: String,
    pub credit_authorization: String,
    pub credit_status: String,
    pub benefit_margin: String,
    pub benefit_authorization: String,
    pub benefit_status: String,
}

impl HistoryEntry {
    pub fn on(query_date: NaiveDate) -> Self {
        Self {
            query_date,
            ..Default::default()
        }
    }

    pub fn with_benefit(mut self, margin: impl Into<String>, status: impl Into<String>) -> Self {
        self.benefit_margin = margin.into();
        self.benefit_status = status.into();
        self
    }

    /// Benefit margin usable for a proposal: parseable, positive and authorized.
    pub fn eligible_benefit_margin(&self) -> Option<f64> {
        if is_unauthorized_status(&self.benefit_status) {
            return None;
        }
        parse_margin(&self.benefit_margin).filter(|margin| *margin > 0.0)
    }
}

/// A benefit/credit linkage a subject holds with an issuing body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: Option<String>,
    pub issuer: Option<String>,
    pub registration: String,
    pub holder_registration: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Relationship {
    pub fn new(issuer: Option<&str>, registration: &str) -> Self {
        Self {
            issuer: normalize_issuer(issuer),
            registration: normalize_registration(registration),
            ..Default::default()
        }
    }

    pub fn matches_key(&self, issuer: Option<&str>, registration: &str) -> bool {
        self.registration == registration && self.issuer.as_deref() == issuer
    }

    /// Appends a snapshot unless one with the same date exists, then keeps
    /// only the most recent [`MAX_HISTORY_ENTRIES`] sorted by date.
    pub fn record_history(&mut self, entry: HistoryEntry) -> bool {
        if self
            .history
            .iter()
            .any(|existing| existing.query_date == entry.query_date)
        {
            return false;
        }
        self.history.push(entry);
        self.history.sort_by_key(|h| h.query_date);
        if self.history.len() > MAX_HISTORY_ENTRIES {
            let excess = self.history.len() - MAX_HISTORY_ENTRIES;
            self.history.drain(..excess);
        }
        true
    }

    pub fn latest_history(&self) -> Option<&HistoryEntry> {
        self.history.iter().max_by_key(|h| h.query_date)
    }

    pub fn eligible_margin(&self) -> Option<f64> {
        self.latest_history()
            .and_then(HistoryEntry::eligible_benefit_margin)
    }
}

/// A tracked person. Identity is the taxpayer id alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subject {
    pub taxpayer_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub priority: bool,
    pub excluded: bool,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    /// Optimistic-concurrency stamp; 0 means never persisted.
    #[serde(default)]
    pub version: i64,
}

impl PartialEq for Subject {
    fn eq(&self, other: &Self) -> bool {
        self.taxpayer_id == other.taxpayer_id
    }
}

impl Eq for Subject {}

impl Hash for Subject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.taxpayer_id.hash(state);
    }
}

impl Subject {
    pub fn new(taxpayer_id: &str) -> Self {
        Self {
            taxpayer_id: normalize_taxpayer_id(taxpayer_id),
            ..Default::default()
        }
    }

    pub fn latest_query_date(&self) -> Option<NaiveDate> {
        self.relationships
            .iter()
            .flat_map(|r| r.history.iter())
            .map(|h| h.query_date)
            .max()
    }

    pub fn queried_on(&self, date: NaiveDate) -> bool {
        self.relationships
            .iter()
            .flat_map(|r| r.history.iter())
            .any(|h| h.query_date == date)
    }

    pub fn find_relationship(&self, registration: &str) -> Option<&Relationship> {
        self.relationships
            .iter()
            .find(|r| r.registration == registration)
    }

    /// Tightest usable benefit margin across relationships, if any.
    pub fn tightest_eligible_margin(&self) -> Option<f64> {
        self.relationships
            .iter()
            .filter_map(Relationship::eligible_margin)
            .min_by(|a, b| a.total_cmp(b))
    }

    pub fn is_eligible_for_proposal(&self) -> bool {
        !self.excluded && self.tightest_eligible_margin().is_some()
    }
}

/// Raw extraction/import row before reconciliation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceRecord {
    pub taxpayer_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// `None` when the source does not assert population membership.
    #[serde(default)]
    pub priority: Option<bool>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl SourceRecord {
    pub fn new(taxpayer_id: &str) -> Self {
        Self {
            taxpayer_id: normalize_taxpayer_id(taxpayer_id),
            ..Default::default()
        }
    }

    /// Candidate subject carrying only what this record asserts.
    pub fn into_candidate(self) -> Subject {
        let mut subject = Subject::new(&self.taxpayer_id);
        subject.name = self.name;
        subject.priority = self.priority.unwrap_or(false);
        for mut relationship in self.relationships {
            relationship.registration = normalize_registration(&relationship.registration);
            relationship.issuer = normalize_issuer(relationship.issuer.as_deref());
            let history = std::mem::take(&mut relationship.history);
            for entry in history {
                relationship.record_history(entry);
            }
            match subject
                .relationships
                .iter_mut()
                .find(|r| r.matches_key(relationship.issuer.as_deref(), &relationship.registration))
            {
                Some(existing) => {
                    for entry in relationship.history {
                        existing.record_history(entry);
                    }
                }
                None => subject.relationships.push(relationship),
            }
        }
        subject
    }
}

/// A credit offer created against a subject's relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub taxpayer_id: String,
    pub number: Option<String>,
    pub disbursed_cents: Option<i64>,
    pub installment_cents: Option<i64>,
    pub signature_link: Option<String>,
    pub created_on: NaiveDate,
}

impl Proposal {
    /// Proposal known only by subject and date, before the portal assigns a number.
    pub fn partial(taxpayer_id: &str, created_on: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            taxpayer_id: taxpayer_id.to_string(),
            number: None,
            disbursed_cents: None,
            installment_cents: None,
            signature_link: None,
            created_on,
        }
    }
}

/// Field-level update; absent fields never clear known values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalPatch {
    pub number: Option<String>,
    pub disbursed_cents: Option<i64>,
    pub installment_cents: Option<i64>,
    pub signature_link: Option<String>,
}

impl ProposalPatch {
    pub fn number(number: impl Into<String>) -> Self {
        Self {
            number: Some(number.into()),
            ..Default::default()
        }
    }

    pub fn amounts(disbursed_cents: Option<i64>, installment_cents: Option<i64>) -> Self {
        Self {
            disbursed_cents,
            installment_cents,
            ..Default::default()
        }
    }

    pub fn signature_link(link: impl Into<String>) -> Self {
        Self {
            signature_link: Some(link.into()),
            ..Default::default()
        }
    }

    pub fn apply(&self, proposal: &mut Proposal) -> bool {
        let mut changed = false;
        changed |= overwrite(&mut proposal.number, &self.number);
        changed |= overwrite(&mut proposal.disbursed_cents, &self.disbursed_cents);
        changed |= overwrite(&mut proposal.installment_cents, &self.installment_cents);
        changed |= overwrite(&mut proposal.signature_link, &self.signature_link);
        changed
    }
}

impl From<&Proposal> for ProposalPatch {
    fn from(proposal: &Proposal) -> Self {
        Self {
            number: proposal.number.clone(),
            disbursed_cents: proposal.disbursed_cents,
            installment_cents: proposal.installment_cents,
            signature_link: proposal.signature_link.clone(),
        }
    }
}

fn overwrite<T: Clone + PartialEq>(target: &mut Option<T>, value: &Option<T>) -> bool {
    match value {
        Some(v) if target.as_ref() != Some(v) => {
            *target = Some(v.clone());
            true
        }
        _ => false,
    }
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Blank issuers mean "unknown" and compare equal to `None`.
fn normalize_issuer(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Trims and restores the leading zero spreadsheets drop from 11-digit ids.
pub fn normalize_taxpayer_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() == 10 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("0{trimmed}")
    } else {
        trimmed.to_string()
    }
}

pub fn normalize_registration(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed.trim_start_matches('0');
    if stripped.is_empty() && !trimmed.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    }
}

/// Parses a margin that may use a comma decimal mark ("1.234,56").
pub fn parse_margin(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_brl_cents(raw: &str) -> Option<i64> {
    parse_margin(raw).map(|value| (value * 100.0).round() as i64)
}

pub fn is_unauthorized_status(status: &str) -> bool {
    let folded: String = status
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == 'ã' { 'a' } else { c })
        .collect();
    folded == "nao autorizado" || folded == "unauthorized"
}
