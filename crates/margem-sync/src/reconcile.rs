//! Merges extracted and imported records into the stored subject graph.
//!
//! Every write goes through the store's version check. A conflicting
//! concurrent write makes the engine reload the subject and merge again, so
//! concurrent upserts of the same subject never lose history entries.

use std::collections::HashMap;
use std::sync::Arc;

use margem_core::{normalize_registration, normalize_taxpayer_id, Relationship, SourceRecord, Subject};
use margem_storage::{StoreError, SubjectStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{SyncError, SyncResult};

const MAX_CONFLICT_RETRIES: usize = 5;

#[derive(Debug, Clone)]
pub enum Upserted {
    Created(Subject),
    Updated(Subject),
    Unchanged(Subject),
}

impl Upserted {
    pub fn subject(&self) -> &Subject {
        match self {
            Upserted::Created(s) | Upserted::Updated(s) | Upserted::Unchanged(s) => s,
        }
    }

    pub fn into_subject(self) -> Subject {
        match self {
            Upserted::Created(s) | Upserted::Updated(s) | Upserted::Unchanged(s) => s,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub records: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Lookup by either natural key; the taxpayer id wins when both are given.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubjectQuery {
    pub taxpayer_id: Option<String>,
    pub registration: Option<String>,
}

/// Applies `candidate` onto `existing` and reports whether anything changed.
///
/// Population membership only moves when the source asserts it. Relationships
/// match on (issuer, registration); a relationship recorded without an issuer
/// (bulk imports) is adopted by the first extraction that names one.
pub fn merge_candidate(existing: &mut Subject, candidate: Subject, priority: Option<bool>) -> bool {
    let mut changed = false;

    if let Some(priority) = priority {
        if existing.priority != priority {
            existing.priority = priority;
            changed = true;
        }
    }
    if candidate.name.is_some() && existing.name != candidate.name {
        existing.name = candidate.name;
        changed = true;
    }

    for incoming in candidate.relationships {
        changed |= merge_relationship(existing, incoming);
    }
    changed
}

fn merge_relationship(subject: &mut Subject, incoming: Relationship) -> bool {
    let issuer = incoming.issuer.as_deref();
    let position = subject
        .relationships
        .iter()
        .position(|r| r.matches_key(issuer, &incoming.registration))
        .or_else(|| {
            issuer.and(
                subject
                    .relationships
                    .iter()
                    .position(|r| r.issuer.is_none() && r.registration == incoming.registration),
            )
        })
        .or_else(|| {
            if issuer.is_none() {
                subject
                    .relationships
                    .iter()
                    .position(|r| r.registration == incoming.registration)
            } else {
                None
            }
        });

    let Some(position) = position else {
        subject.relationships.push(incoming);
        return true;
    };

    let existing = &mut subject.relationships[position];
    let mut changed = false;
    if existing.issuer.is_none() && incoming.issuer.is_some() {
        existing.issuer = incoming.issuer;
        changed = true;
    }
    if incoming.kind.is_some() && existing.kind != incoming.kind {
        existing.kind = incoming.kind;
        changed = true;
    }
    if incoming.holder_registration.is_some()
        && existing.holder_registration != incoming.holder_registration
    {
        existing.holder_registration = incoming.holder_registration;
        changed = true;
    }
    for entry in incoming.history {
        changed |= existing.record_history(entry);
    }
    changed
}

/// Folds records for the same taxpayer into one; the first record that
/// asserts population membership decides it.
fn fold_records(records: Vec<SourceRecord>) -> Vec<(Subject, Option<bool>)> {
    let mut order: Vec<String> = Vec::new();
    let mut folded: HashMap<String, (Subject, Option<bool>)> = HashMap::new();
    for record in records {
        let priority = record.priority;
        let candidate = record.into_candidate();
        if candidate.taxpayer_id.is_empty() {
            continue;
        }
        match folded.get_mut(&candidate.taxpayer_id) {
            Some((subject, seen_priority)) => {
                merge_candidate(subject, candidate, None);
                if seen_priority.is_none() {
                    *seen_priority = priority;
                }
            }
            None => {
                order.push(candidate.taxpayer_id.clone());
                folded.insert(candidate.taxpayer_id.clone(), (candidate, priority));
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| folded.remove(&key))
        .collect()
}

fn new_subject(mut candidate: Subject, priority: Option<bool>) -> Subject {
    candidate.priority = priority.unwrap_or(false);
    candidate.version = 0;
    candidate
}

pub struct ReconciliationEngine {
    store: Arc<dyn SubjectStore>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn SubjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SubjectStore> {
        &self.store
    }

    /// Idempotent upsert by taxpayer id.
    pub async fn upsert_subject(&self, record: SourceRecord) -> SyncResult<Upserted> {
        let priority = record.priority;
        let candidate = record.into_candidate();
        let taxpayer_id = candidate.taxpayer_id.clone();

        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let result = match self.store.find_subject_by_key(&taxpayer_id).await? {
                None => self
                    .store
                    .save(new_subject(candidate.clone(), priority))
                    .await
                    .map(Upserted::Created),
                Some(mut existing) => {
                    if !merge_candidate(&mut existing, candidate.clone(), priority) {
                        return Ok(Upserted::Unchanged(existing));
                    }
                    self.store.save(existing).await.map(Upserted::Updated)
                }
            };
            match result {
                Ok(upserted) => return Ok(upserted),
                Err(err) if err.is_conflict() => {
                    debug!(%taxpayer_id, attempt, "concurrent update; merging again");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Conflict { taxpayer_id }.into())
    }

    /// Bulk upsert: one lookup for all keys, then inserts and updates saved
    /// as two sets. A set that hits a version conflict falls back to
    /// per-subject upserts.
    pub async fn upsert_many(&self, records: Vec<SourceRecord>) -> SyncResult<BatchSummary> {
        let mut summary = BatchSummary {
            records: records.len(),
            ..Default::default()
        };
        let folded = fold_records(records);
        let keys: Vec<String> = folded.iter().map(|(s, _)| s.taxpayer_id.clone()).collect();
        let mut existing: HashMap<String, Subject> = self
            .store
            .find_subjects_by_keys(&keys)
            .await?
            .into_iter()
            .map(|s| (s.taxpayer_id.clone(), s))
            .collect();

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut sources = HashMap::new();
        for (candidate, priority) in folded {
            let key = candidate.taxpayer_id.clone();
            sources.insert(key.clone(), (candidate.clone(), priority));
            match existing.remove(&key) {
                None => inserts.push(new_subject(candidate, priority)),
                Some(mut stored) => {
                    if merge_candidate(&mut stored, candidate, priority) {
                        updates.push(stored);
                    } else {
                        summary.unchanged += 1;
                    }
                }
            }
        }

        for (set, is_insert) in [(inserts, true), (updates, false)] {
            if set.is_empty() {
                continue;
            }
            let size = set.len();
            let keys: Vec<String> = set.iter().map(|s| s.taxpayer_id.clone()).collect();
            match self.store.save_all(set).await {
                Ok(_) if is_insert => summary.created += size,
                Ok(_) => summary.updated += size,
                Err(err) if err.is_conflict() => {
                    warn!(size, "bulk save conflicted; retrying subjects one by one");
                    for key in keys {
                        let Some((candidate, priority)) = sources.remove(&key) else {
                            continue;
                        };
                        let record = SourceRecord {
                            taxpayer_id: candidate.taxpayer_id,
                            name: candidate.name,
                            priority,
                            relationships: candidate.relationships,
                        };
                        match self.upsert_subject(record).await? {
                            Upserted::Created(_) => summary.created += 1,
                            Upserted::Updated(_) => summary.updated += 1,
                            Upserted::Unchanged(_) => summary.unchanged += 1,
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!(
            records = summary.records,
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            "bulk upsert finished"
        );
        Ok(summary)
    }

    /// Subjects ready for a proposal, tightest usable margin first.
    pub async fn eligible_for_proposal(&self) -> SyncResult<Vec<Subject>> {
        let mut eligible: Vec<(f64, Subject)> = self
            .store
            .all_subjects()
            .await?
            .into_iter()
            .filter(|s| !s.excluded)
            .filter_map(|s| s.tightest_eligible_margin().map(|m| (m, s)))
            .collect();
        eligible.sort_by(|(a, _), (b, _)| a.total_cmp(b));
        Ok(eligible.into_iter().map(|(_, s)| s).collect())
    }

    async fn modify<F>(&self, taxpayer_id: &str, mutate: F) -> SyncResult<Subject>
    where
        F: Fn(&mut Subject) -> bool + Send + Sync,
    {
        let taxpayer_id = normalize_taxpayer_id(taxpayer_id);
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut subject = self
                .store
                .find_subject_by_key(&taxpayer_id)
                .await?
                .ok_or_else(|| StoreError::SubjectNotFound(taxpayer_id.clone()))?;
            if !mutate(&mut subject) {
                return Ok(subject);
            }
            match self.store.save(subject).await {
                Ok(saved) => return Ok(saved),
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(SyncError::Store(StoreError::Conflict { taxpayer_id }))
    }

    /// Stores the phone read from the portal when it differs.
    pub async fn update_phone(&self, taxpayer_id: &str, phone: &str) -> SyncResult<Subject> {
        let phone = phone.trim().to_string();
        self.modify(taxpayer_id, |subject| {
            if phone.is_empty() || subject.phone.as_deref() == Some(phone.as_str()) {
                return false;
            }
            subject.phone = Some(phone.clone());
            true
        })
        .await
    }

    pub async fn toggle_excluded(&self, taxpayer_id: &str) -> SyncResult<Subject> {
        let subject = self
            .modify(taxpayer_id, |subject| {
                subject.excluded = !subject.excluded;
                true
            })
            .await?;
        info!(taxpayer_id = %subject.taxpayer_id, excluded = subject.excluded, "blacklist toggled");
        Ok(subject)
    }

    pub async fn search(&self, query: &SubjectQuery) -> SyncResult<Option<Subject>> {
        if let Some(taxpayer_id) = query.taxpayer_id.as_deref().filter(|v| !v.trim().is_empty()) {
            return Ok(self
                .store
                .find_subject_by_key(&normalize_taxpayer_id(taxpayer_id))
                .await?);
        }
        if let Some(registration) = query.registration.as_deref().filter(|v| !v.trim().is_empty()) {
            return Ok(self
                .store
                .find_subject_by_registration(&normalize_registration(registration))
                .await?);
        }
        Ok(None)
    }
}
