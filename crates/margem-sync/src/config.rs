use std::path::PathBuf;
use std::time::Duration;

use margem_core::Population;
use serde::{Deserialize, Serialize};

use crate::{SyncError, SyncResult};

/// Knobs for the extraction jobs.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub rate_per_second: f64,
    pub worker_count: usize,
    pub priority_chunk_size: usize,
    pub general_chunk_size: usize,
    pub priority_quota: Option<usize>,
    pub general_quota: Option<usize>,
    pub attempts_per_subject: usize,
    /// Consecutive failed attempts after which a worker stops and asks for a relaunch.
    pub failure_threshold: usize,
    pub relaunch_ceiling: usize,
    pub relaunch_cooldown: Duration,
    pub run_timeout: Duration,
    pub cancel_grace: Duration,
    pub result_timeout: Duration,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            rate_per_second: 4.0,
            worker_count: 9,
            priority_chunk_size: 120,
            general_chunk_size: 1000,
            priority_quota: None,
            general_quota: Some(10_000),
            attempts_per_subject: 5,
            failure_threshold: 100,
            relaunch_ceiling: 5,
            relaunch_cooldown: Duration::from_secs(5 * 60),
            run_timeout: Duration::from_secs(3 * 60 * 60),
            cancel_grace: Duration::from_secs(30),
            result_timeout: Duration::from_secs(10),
        }
    }
}

impl ExtractionSettings {
    pub fn chunk_size(&self, population: Population) -> usize {
        match population {
            Population::Priority => self.priority_chunk_size,
            Population::General => self.general_chunk_size,
        }
    }

    pub fn quota(&self, population: Population) -> Option<usize> {
        match population {
            Population::Priority => self.priority_quota,
            Population::General => self.general_quota,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProposalSettings {
    pub worker_count: usize,
    pub chain_attempts: usize,
    pub run_timeout: Duration,
    pub cancel_grace: Duration,
    pub employer_code: String,
    pub document_path: PathBuf,
    pub step_timeout: Duration,
    /// Pause after resetting navigation before the next chain attempt.
    pub retry_pause: Duration,
}

impl Default for ProposalSettings {
    fn default() -> Self {
        Self {
            worker_count: 8,
            chain_attempts: 3,
            run_timeout: Duration::from_secs(3 * 60 * 60),
            cancel_grace: Duration::from_secs(30),
            employer_code: "000501".to_string(),
            document_path: PathBuf::from("./documents/supporting.pdf"),
            step_timeout: Duration::from_secs(30),
            retry_pause: Duration::from_secs(2),
        }
    }
}

/// What the cancellation form is filled with, besides the proposal itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationSettings {
    pub contact_email: String,
    pub reason: String,
    pub promoter: String,
    #[serde(skip, default = "default_form_timeout")]
    pub form_timeout: Duration,
}

fn default_form_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for CancellationSettings {
    fn default() -> Self {
        Self {
            contact_email: String::new(),
            reason: String::new(),
            promoter: String::new(),
            form_timeout: default_form_timeout(),
        }
    }
}

impl CancellationSettings {
    pub fn validate(&self) -> SyncResult<()> {
        for (field, value) in [
            ("contact_email", &self.contact_email),
            ("reason", &self.reason),
            ("promoter", &self.promoter),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::Config(format!("cancellation {field} is not set")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub import_dir: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub credentials_file: PathBuf,
    pub sheets_file: PathBuf,
    pub portal_fixture: PathBuf,
    pub scheduler_enabled: bool,
    pub cron_priority: String,
    pub cron_general: String,
    pub cron_proposals: String,
    pub cron_import: String,
    pub proposals_enabled: bool,
    pub http_timeout_secs: u64,
    pub bind_addr: String,
    pub extraction: ExtractionSettings,
    pub proposals: ProposalSettings,
    pub cancellation: CancellationSettings,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("MARGEM_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let mut extraction = ExtractionSettings::default();
        if let Some(rate) = std::env::var("MARGEM_RATE_PER_SECOND")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            extraction.rate_per_second = rate;
        }

        let mut proposals = ProposalSettings::default();
        if let Ok(code) = std::env::var("MARGEM_EMPLOYER_CODE") {
            proposals.employer_code = code;
        }
        proposals.document_path = std::env::var("MARGEM_DOCUMENT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_root.join("documents").join("supporting.pdf"));

        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            import_dir: std::env::var("MARGEM_IMPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("imports")),
            reports_dir: Some(
                std::env::var("MARGEM_REPORTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| workspace_root.join("reports")),
            ),
            credentials_file: std::env::var("MARGEM_CREDENTIALS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("credentials.yaml")),
            sheets_file: std::env::var("MARGEM_SHEETS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("sheets.yaml")),
            portal_fixture: std::env::var("MARGEM_PORTAL_FIXTURE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("fixtures").join("portal.json")),
            scheduler_enabled: env_flag("MARGEM_SCHEDULER_ENABLED", false),
            cron_priority: env_or("MARGEM_CRON_PRIORITY", "0 0 0,3,6,9,21 * * Mon-Fri"),
            cron_general: env_or("MARGEM_CRON_GENERAL", "0 0 2,6,10,14,18,22 * * Sat,Sun"),
            cron_proposals: env_or("MARGEM_CRON_PROPOSALS", "0 0 13,15,17,19 * * Mon-Fri"),
            cron_import: env_or("MARGEM_CRON_IMPORT", "0 0 11,13,15 * * Sat"),
            proposals_enabled: env_flag("MARGEM_PROPOSALS_ENABLED", true),
            http_timeout_secs: std::env::var("MARGEM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            bind_addr: env_or("MARGEM_BIND_ADDR", "127.0.0.1:8080"),
            workspace_root,
            extraction,
            proposals,
            cancellation: CancellationSettings {
                contact_email: env_or("MARGEM_CANCEL_EMAIL", ""),
                reason: env_or("MARGEM_CANCEL_REASON", ""),
                promoter: env_or("MARGEM_CANCEL_PROMOTER", ""),
                ..Default::default()
            },
        }
    }

    pub fn cron_for(&self, population: Population) -> &str {
        match population {
            Population::Priority => &self.cron_priority,
            Population::General => &self.cron_general,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_operational_constants() {
        let settings = ExtractionSettings::default();
        assert_eq!(settings.worker_count, 9);
        assert_eq!(settings.chunk_size(Population::Priority), 120);
        assert_eq!(settings.chunk_size(Population::General), 1000);
        assert_eq!(settings.quota(Population::Priority), None);
        assert_eq!(settings.quota(Population::General), Some(10_000));
        assert_eq!(settings.run_timeout, Duration::from_secs(10_800));

        let proposals = ProposalSettings::default();
        assert_eq!(proposals.worker_count, 8);
        assert_eq!(proposals.chain_attempts, 3);
    }

    #[test]
    fn cancellation_settings_need_every_form_field() {
        let mut settings = CancellationSettings {
            contact_email: "ops@example.com".into(),
            reason: "desistência".into(),
            promoter: " ".into(),
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(SyncError::Config(_))));
        settings.promoter = "Promotora X".into();
        assert!(settings.validate().is_ok());
    }
}
