//! Extraction scheduling, reconciliation, imports and the proposal workflow.

use margem_portal::SessionError;
use margem_storage::StoreError;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub mod cancellation;
pub mod config;
pub mod credentials;
pub mod cron;
pub mod export;
pub mod import;
mod pool;
pub mod proposal;
pub mod reconcile;
pub mod scheduler;
mod single_flight;
pub mod worker;

pub use cancellation::{CancellationJob, CancellationReport};
pub use config::{CancellationSettings, ExtractionSettings, ProposalSettings, SyncConfig};
pub use credentials::{CredentialPool, CredentialSource, CredentialUse, StaticCredentials, YamlCredentialFile};
pub use cron::build_cron_scheduler;
pub use export::{collect_export_rows, export_proposals_parquet, ProposalExport, ProposalExportRow};
pub use import::{ImportJob, ImportSummary};
pub use proposal::{ProposalRunReport, ProposalRunner, ProposalTarget, ProposalWorkflow, WorkflowState};
pub use reconcile::{BatchSummary, ReconciliationEngine, SubjectQuery, Upserted};
pub use scheduler::{partition, select_candidates, JobScheduler, RunReport};
pub use single_flight::{FlightGuard, SingleFlight};
pub use worker::{ExtractionWorker, RelaunchSignal, WorkerAssignment, WorkerContext, WorkerReport};

pub const CRATE_NAME: &str = "margem-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no credentials available for {0}")]
    NoCredentialsAvailable(CredentialUse),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("import failed: {0}")]
    Import(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Completed,
    AlreadyRunning,
    Failed,
}

/// Result of one trigger of a single-flight job. Failures carry only the
/// run id operators can grep the logs for.
#[derive(Debug, Clone)]
pub enum RunOutcome<R> {
    Completed { run_id: Uuid, report: R },
    AlreadyRunning,
    Failed { run_id: Uuid, error: String },
}

impl<R> RunOutcome<R> {
    pub fn status(&self) -> TriggerStatus {
        match self {
            RunOutcome::Completed { .. } => TriggerStatus::Completed,
            RunOutcome::AlreadyRunning => TriggerStatus::AlreadyRunning,
            RunOutcome::Failed { .. } => TriggerStatus::Failed,
        }
    }

    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            RunOutcome::Completed { run_id, .. } | RunOutcome::Failed { run_id, .. } => {
                Some(*run_id)
            }
            RunOutcome::AlreadyRunning => None,
        }
    }

    pub fn report(&self) -> Option<&R> {
        match self {
            RunOutcome::Completed { report, .. } => Some(report),
            _ => None,
        }
    }
}
