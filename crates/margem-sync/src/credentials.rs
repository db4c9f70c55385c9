use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use margem_core::Credential;
use serde::Deserialize;
use tokio::fs;

use crate::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialUse {
    Extraction,
    Proposals,
}

impl fmt::Display for CredentialUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialUse::Extraction => f.write_str("extraction"),
            CredentialUse::Proposals => f.write_str("proposals"),
        }
    }
}

/// Where login identities come from. Read once per run.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Credential>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Vec<Credential>);

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn load(&self) -> Result<Vec<Credential>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    credentials: Vec<Credential>,
}

/// YAML file with a top-level `credentials:` list.
#[derive(Debug, Clone)]
pub struct YamlCredentialFile {
    path: PathBuf,
}

impl YamlCredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for YamlCredentialFile {
    async fn load(&self) -> Result<Vec<Credential>> {
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let file: CredentialsFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(file.credentials)
    }
}

/// Identities usable for one run, handed to worker slots round-robin.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
}

impl CredentialPool {
    pub fn for_run(all: Vec<Credential>, usage: CredentialUse) -> SyncResult<Self> {
        let credentials: Vec<_> = all
            .into_iter()
            .filter(|c| !c.excluded)
            .filter(|c| usage != CredentialUse::Proposals || c.allow_proposals)
            .collect();
        if credentials.is_empty() {
            return Err(SyncError::NoCredentialsAvailable(usage));
        }
        Ok(Self { credentials })
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn credentials_for_worker(&self, slot: usize) -> &Credential {
        &self.credentials[slot % self.credentials.len()]
    }
}
