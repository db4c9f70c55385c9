//! Persistence boundary, store backends and outbound throttling for margem.

use async_trait::async_trait;
use chrono::NaiveDate;
use margem_core::{Population, Proposal, Subject};
use thiserror::Error;

mod http;
mod memory;
mod postgres;
mod throttle;

pub use http::{
    classify_status, BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
    RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use throttle::RateLimiter;

pub const CRATE_NAME: &str = "margem-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("subject {taxpayer_id} was modified concurrently")]
    Conflict { taxpayer_id: String },
    #[error("subject {0} not found")]
    SubjectNotFound(String),
    #[error("proposal number {0} already belongs to another proposal")]
    DuplicateProposalNumber(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Repository-style access to the subject graph and proposals.
///
/// Subjects are saved whole (relationships and history included) under an
/// optimistic version check: `save` fails with [`StoreError::Conflict`] when
/// the stored version differs from `subject.version`, and a subject with
/// version 0 must not exist yet. Saved subjects come back with the new
/// version. Deleting a subject cascades to its relationships, history and
/// proposals.
#[async_trait]
pub trait SubjectStore: Send + Sync {
    async fn find_subject_by_key(&self, taxpayer_id: &str) -> StoreResult<Option<Subject>>;

    async fn find_subjects_by_keys(&self, taxpayer_ids: &[String]) -> StoreResult<Vec<Subject>>;

    async fn find_subject_by_registration(&self, registration: &str) -> StoreResult<Option<Subject>>;

    async fn find_subjects_in(&self, population: Population) -> StoreResult<Vec<Subject>>;

    async fn all_subjects(&self) -> StoreResult<Vec<Subject>>;

    async fn save(&self, subject: Subject) -> StoreResult<Subject>;

    /// All-or-nothing bulk save with the same version rule as [`Self::save`].
    async fn save_all(&self, subjects: Vec<Subject>) -> StoreResult<Vec<Subject>>;

    async fn delete_subject(&self, taxpayer_id: &str) -> StoreResult<bool>;

    async fn find_proposal_by_number(&self, number: &str) -> StoreResult<Option<Proposal>>;

    async fn find_proposal_by_subject_and_date(
        &self,
        taxpayer_id: &str,
        created_on: NaiveDate,
    ) -> StoreResult<Option<Proposal>>;

    async fn proposals_for_subject(&self, taxpayer_id: &str) -> StoreResult<Vec<Proposal>>;

    async fn list_proposals(&self, offset: usize, limit: usize) -> StoreResult<Vec<Proposal>>;

    /// Inserts the proposal, or merges it into the stored one with the same
    /// id; empty fields keep the stored value.
    async fn save_proposal(&self, proposal: Proposal) -> StoreResult<Proposal>;

    async fn delete_proposal(&self, number: &str) -> StoreResult<bool>;
}
