use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use margem_core::{Population, Proposal, ProposalPatch, Subject};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{StoreError, StoreResult, SubjectStore};

/// Process-local store. Every write takes the single lock, so the version
/// check and the write are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    subjects: BTreeMap<String, Subject>,
    proposals: BTreeMap<Uuid, Proposal>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn check_version(&self, subject: &Subject) -> StoreResult<()> {
        let stored = self.subjects.get(&subject.taxpayer_id).map(|s| s.version);
        match (stored, subject.version) {
            (None, 0) => Ok(()),
            (Some(current), expected) if current == expected => Ok(()),
            _ => Err(StoreError::Conflict {
                taxpayer_id: subject.taxpayer_id.clone(),
            }),
        }
    }

    fn write(&mut self, mut subject: Subject) -> Subject {
        subject.version += 1;
        self.subjects
            .insert(subject.taxpayer_id.clone(), subject.clone());
        subject
    }
}

#[async_trait]
impl SubjectStore for MemoryStore {
    async fn find_subject_by_key(&self, taxpayer_id: &str) -> StoreResult<Option<Subject>> {
        Ok(self.state.read().await.subjects.get(taxpayer_id).cloned())
    }

    async fn find_subjects_by_keys(&self, taxpayer_ids: &[String]) -> StoreResult<Vec<Subject>> {
        let state = self.state.read().await;
        Ok(taxpayer_ids
            .iter()
            .filter_map(|id| state.subjects.get(id).cloned())
            .collect())
    }

    async fn find_subject_by_registration(&self, registration: &str) -> StoreResult<Option<Subject>> {
        let state = self.state.read().await;
        Ok(state
            .subjects
            .values()
            .find(|s| s.find_relationship(registration).is_some())
            .cloned())
    }

    async fn find_subjects_in(&self, population: Population) -> StoreResult<Vec<Subject>> {
        let state = self.state.read().await;
        Ok(state
            .subjects
            .values()
            .filter(|s| s.priority == population.is_priority())
            .cloned()
            .collect())
    }

    async fn all_subjects(&self) -> StoreResult<Vec<Subject>> {
        Ok(self.state.read().await.subjects.values().cloned().collect())
    }

    async fn save(&self, subject: Subject) -> StoreResult<Subject> {
        let mut state = self.state.write().await;
        state.check_version(&subject)?;
        Ok(state.write(subject))
    }

    async fn save_all(&self, subjects: Vec<Subject>) -> StoreResult<Vec<Subject>> {
        let mut state = self.state.write().await;
        for subject in &subjects {
            state.check_version(subject)?;
        }
        Ok(subjects.into_iter().map(|s| state.write(s)).collect())
    }

    async fn delete_subject(&self, taxpayer_id: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let removed = state.subjects.remove(taxpayer_id).is_some();
        if removed {
            state.proposals.retain(|_, p| p.taxpayer_id != taxpayer_id);
        }
        Ok(removed)
    }

    async fn find_proposal_by_number(&self, number: &str) -> StoreResult<Option<Proposal>> {
        let state = self.state.read().await;
        Ok(state
            .proposals
            .values()
            .find(|p| p.number.as_deref() == Some(number))
            .cloned())
    }

    async fn find_proposal_by_subject_and_date(
        &self,
        taxpayer_id: &str,
        created_on: NaiveDate,
    ) -> StoreResult<Option<Proposal>> {
        let state = self.state.read().await;
        // unnumbered proposals first, matching the Postgres ordering
        Ok(state
            .proposals
            .values()
            .filter(|p| p.taxpayer_id == taxpayer_id && p.created_on == created_on)
            .min_by_key(|p| p.number.is_some())
            .cloned())
    }

    async fn proposals_for_subject(&self, taxpayer_id: &str) -> StoreResult<Vec<Proposal>> {
        let state = self.state.read().await;
        let mut proposals: Vec<_> = state
            .proposals
            .values()
            .filter(|p| p.taxpayer_id == taxpayer_id)
            .cloned()
            .collect();
        proposals.sort_by_key(|p| p.created_on);
        Ok(proposals)
    }

    async fn list_proposals(&self, offset: usize, limit: usize) -> StoreResult<Vec<Proposal>> {
        let state = self.state.read().await;
        let mut proposals: Vec<_> = state.proposals.values().cloned().collect();
        proposals.sort_by(|a, b| {
            b.created_on
                .cmp(&a.created_on)
                .then_with(|| a.number.cmp(&b.number))
        });
        Ok(proposals.into_iter().skip(offset).take(limit).collect())
    }

    async fn save_proposal(&self, proposal: Proposal) -> StoreResult<Proposal> {
        let mut state = self.state.write().await;
        if !state.subjects.contains_key(&proposal.taxpayer_id) {
            return Err(StoreError::SubjectNotFound(proposal.taxpayer_id));
        }
        let merged = match state.proposals.get(&proposal.id) {
            Some(stored) => {
                let mut merged = stored.clone();
                ProposalPatch::from(&proposal).apply(&mut merged);
                merged
            }
            None => proposal,
        };
        if let Some(number) = &merged.number {
            let taken = state
                .proposals
                .values()
                .any(|p| p.id != merged.id && p.number.as_ref() == Some(number));
            if taken {
                return Err(StoreError::DuplicateProposalNumber(number.clone()));
            }
        }
        state.proposals.insert(merged.id, merged.clone());
        Ok(merged)
    }

    async fn delete_proposal(&self, number: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let before = state.proposals.len();
        state
            .proposals
            .retain(|_, p| p.number.as_deref() != Some(number));
        Ok(state.proposals.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use margem_core::{HistoryEntry, Relationship};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[tokio::test]
    async fn save_bumps_version_and_rejects_stale_writes() {
        let store = MemoryStore::new();
        let saved = store.save(Subject::new("123")).await.unwrap();
        assert_eq!(saved.version, 1);

        let err = store.save(Subject::new("123")).await.unwrap_err();
        assert!(err.is_conflict());

        let mut renamed = saved.clone();
        renamed.name = Some("Ana".into());
        let renamed = store.save(renamed).await.unwrap();
        assert_eq!(renamed.version, 2);

        let err = store.save(saved).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn save_all_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.save(Subject::new("1")).await.unwrap();

        let err = store
            .save_all(vec![Subject::new("2"), Subject::new("1")])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store.find_subject_by_key("2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_a_subject_cascades_to_proposals() {
        let store = MemoryStore::new();
        store.save(Subject::new("1")).await.unwrap();
        let mut proposal = Proposal::partial("1", day(5));
        proposal.number = Some("P-9".into());
        store.save_proposal(proposal).await.unwrap();

        assert!(store.delete_subject("1").await.unwrap());
        assert!(store.find_proposal_by_number("P-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn proposals_require_an_owner_and_unique_numbers() {
        let store = MemoryStore::new();
        let err = store
            .save_proposal(Proposal::partial("missing", day(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SubjectNotFound(_)));

        store.save(Subject::new("1")).await.unwrap();
        let mut a = Proposal::partial("1", day(1));
        a.number = Some("P-1".into());
        store.save_proposal(a.clone()).await.unwrap();
        let mut b = Proposal::partial("1", day(2));
        b.number = Some("P-1".into());
        let err = store.save_proposal(b).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateProposalNumber(_)));

        let found = store
            .find_proposal_by_subject_and_date("1", day(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, a.id);
    }

    #[tokio::test]
    async fn saving_a_sparse_proposal_keeps_known_fields() {
        let store = MemoryStore::new();
        store.save(Subject::new("1")).await.unwrap();
        let mut full = Proposal::partial("1", day(3));
        full.number = Some("P-1".into());
        full.disbursed_cents = Some(100);
        store.save_proposal(full.clone()).await.unwrap();

        let mut sparse = Proposal {
            number: None,
            disbursed_cents: None,
            ..full.clone()
        };
        sparse.signature_link = Some("https://sign/1".into());
        let saved = store.save_proposal(sparse).await.unwrap();

        assert_eq!(saved.number.as_deref(), Some("P-1"));
        let stored = store.find_proposal_by_number("P-1").await.unwrap().unwrap();
        assert_eq!(stored.disbursed_cents, Some(100));
        assert_eq!(stored.signature_link.as_deref(), Some("https://sign/1"));
    }

    #[tokio::test]
    async fn lookups_by_population_and_registration() {
        let store = MemoryStore::new();
        let mut priority = Subject::new("1");
        priority.priority = true;
        let mut rel = Relationship::new(Some("A"), "77");
        rel.record_history(HistoryEntry::on(day(1)));
        priority.relationships.push(rel);
        store.save(priority).await.unwrap();
        store.save(Subject::new("2")).await.unwrap();

        let found = store.find_subjects_in(Population::Priority).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].taxpayer_id, "1");
        let general = store.find_subjects_in(Population::General).await.unwrap();
        assert_eq!(general[0].taxpayer_id, "2");

        let by_reg = store.find_subject_by_registration("77").await.unwrap();
        assert_eq!(by_reg.map(|s| s.taxpayer_id), Some("1".to_string()));
    }
}
