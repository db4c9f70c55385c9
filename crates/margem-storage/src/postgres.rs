use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use margem_core::{HistoryEntry, Population, Proposal, Relationship, Subject};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use tracing::info;

use crate::{StoreError, StoreResult, SubjectStore};

const SUBJECT_COLUMNS: &str = "taxpayer_id, name, phone, priority, excluded, version";
const PROPOSAL_COLUMNS: &str =
    "id, taxpayer_id, number, disbursed_cents, installment_cents, signature_link, created_on";

/// Postgres-backed store. Relationships and history are rewritten with the
/// owning subject row inside one transaction guarded by the version column.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!().run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn hydrate(&self, rows: Vec<PgRow>) -> StoreResult<Vec<Subject>> {
        let mut subjects = rows
            .iter()
            .map(subject_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if subjects.is_empty() {
            return Ok(subjects);
        }
        let keys: Vec<String> = subjects.iter().map(|s| s.taxpayer_id.clone()).collect();

        let history_rows = sqlx::query(
            "SELECT h.relationship_id, h.query_date, h.credit_margin, h.credit_authorization, \
             h.credit_status, h.benefit_margin, h.benefit_authorization, h.benefit_status \
             FROM history_entries h JOIN relationships r ON r.id = h.relationship_id \
             WHERE r.taxpayer_id = ANY($1) ORDER BY h.query_date",
        )
        .bind(&keys[..])
        .fetch_all(&self.pool)
        .await?;

        let mut history: HashMap<i64, Vec<HistoryEntry>> = HashMap::new();
        for row in &history_rows {
            history
                .entry(row.try_get("relationship_id")?)
                .or_default()
                .push(HistoryEntry {
                    query_date: row.try_get("query_date")?,
                    credit_margin: row.try_get("credit_margin")?,
                    credit_authorization: row.try_get("credit_authorization")?,
                    credit_status: row.try_get("credit_status")?,
                    benefit_margin: row.try_get("benefit_margin")?,
                    benefit_authorization: row.try_get("benefit_authorization")?,
                    benefit_status: row.try_get("benefit_status")?,
                });
        }

        let relationship_rows = sqlx::query(
            "SELECT id, taxpayer_id, kind, issuer, registration, holder_registration \
             FROM relationships WHERE taxpayer_id = ANY($1) ORDER BY taxpayer_id, position",
        )
        .bind(&keys[..])
        .fetch_all(&self.pool)
        .await?;

        let mut relationships: HashMap<String, Vec<Relationship>> = HashMap::new();
        for row in &relationship_rows {
            let id: i64 = row.try_get("id")?;
            let issuer: String = row.try_get("issuer")?;
            relationships
                .entry(row.try_get("taxpayer_id")?)
                .or_default()
                .push(Relationship {
                    kind: row.try_get("kind")?,
                    issuer: (!issuer.is_empty()).then_some(issuer),
                    registration: row.try_get("registration")?,
                    holder_registration: row.try_get("holder_registration")?,
                    history: history.remove(&id).unwrap_or_default(),
                });
        }

        for subject in &mut subjects {
            subject.relationships = relationships
                .remove(&subject.taxpayer_id)
                .unwrap_or_default();
        }
        Ok(subjects)
    }
}

fn subject_from_row(row: &PgRow) -> Result<Subject, sqlx::Error> {
    Ok(Subject {
        taxpayer_id: row.try_get("taxpayer_id")?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        priority: row.try_get("priority")?,
        excluded: row.try_get("excluded")?,
        relationships: Vec::new(),
        version: row.try_get("version")?,
    })
}

fn proposal_from_row(row: &PgRow) -> Result<Proposal, sqlx::Error> {
    Ok(Proposal {
        id: row.try_get("id")?,
        taxpayer_id: row.try_get("taxpayer_id")?,
        number: row.try_get("number")?,
        disbursed_cents: row.try_get("disbursed_cents")?,
        installment_cents: row.try_get("installment_cents")?,
        signature_link: row.try_get("signature_link")?,
        created_on: row.try_get("created_on")?,
    })
}

async fn save_in_tx(conn: &mut PgConnection, subject: Subject) -> StoreResult<Subject> {
    let affected = if subject.version == 0 {
        sqlx::query(
            "INSERT INTO subjects (taxpayer_id, name, phone, priority, excluded, version) \
             VALUES ($1, $2, $3, $4, $5, 1) ON CONFLICT (taxpayer_id) DO NOTHING",
        )
        .bind(&subject.taxpayer_id)
        .bind(&subject.name)
        .bind(&subject.phone)
        .bind(subject.priority)
        .bind(subject.excluded)
        .execute(&mut *conn)
        .await?
        .rows_affected()
    } else {
        sqlx::query(
            "UPDATE subjects SET name = $2, phone = $3, priority = $4, excluded = $5, \
             version = version + 1 WHERE taxpayer_id = $1 AND version = $6",
        )
        .bind(&subject.taxpayer_id)
        .bind(&subject.name)
        .bind(&subject.phone)
        .bind(subject.priority)
        .bind(subject.excluded)
        .bind(subject.version)
        .execute(&mut *conn)
        .await?
        .rows_affected()
    };
    if affected == 0 {
        return Err(StoreError::Conflict {
            taxpayer_id: subject.taxpayer_id,
        });
    }

    sqlx::query("DELETE FROM relationships WHERE taxpayer_id = $1")
        .bind(&subject.taxpayer_id)
        .execute(&mut *conn)
        .await?;

    for (position, relationship) in subject.relationships.iter().enumerate() {
        let relationship_id: i64 = sqlx::query_scalar(
            "INSERT INTO relationships \
             (taxpayer_id, position, kind, issuer, registration, holder_registration) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&subject.taxpayer_id)
        .bind(position as i32)
        .bind(&relationship.kind)
        .bind(relationship.issuer.as_deref().unwrap_or(""))
        .bind(&relationship.registration)
        .bind(&relationship.holder_registration)
        .fetch_one(&mut *conn)
        .await?;

        for entry in &relationship.history {
            sqlx::query(
                "INSERT INTO history_entries (relationship_id, query_date, credit_margin, \
                 credit_authorization, credit_status, benefit_margin, benefit_authorization, \
                 benefit_status) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(relationship_id)
            .bind(entry.query_date)
            .bind(&entry.credit_margin)
            .bind(&entry.credit_authorization)
            .bind(&entry.credit_status)
            .bind(&entry.benefit_margin)
            .bind(&entry.benefit_authorization)
            .bind(&entry.benefit_status)
            .execute(&mut *conn)
            .await?;
        }
    }

    let mut saved = subject;
    saved.version += 1;
    Ok(saved)
}

#[async_trait]
impl SubjectStore for PgStore {
    async fn find_subject_by_key(&self, taxpayer_id: &str) -> StoreResult<Option<Subject>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects WHERE taxpayer_id = $1"
        ))
        .bind(taxpayer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.hydrate(rows).await?.into_iter().next())
    }

    async fn find_subjects_by_keys(&self, taxpayer_ids: &[String]) -> StoreResult<Vec<Subject>> {
        if taxpayer_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects WHERE taxpayer_id = ANY($1)"
        ))
        .bind(taxpayer_ids)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn find_subject_by_registration(&self, registration: &str) -> StoreResult<Option<Subject>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects WHERE taxpayer_id = \
             (SELECT taxpayer_id FROM relationships WHERE registration = $1 ORDER BY id LIMIT 1)"
        ))
        .bind(registration)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.hydrate(rows).await?.into_iter().next())
    }

    async fn find_subjects_in(&self, population: Population) -> StoreResult<Vec<Subject>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects WHERE priority = $1 ORDER BY taxpayer_id"
        ))
        .bind(population.is_priority())
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn all_subjects(&self) -> StoreResult<Vec<Subject>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects ORDER BY taxpayer_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn save(&self, subject: Subject) -> StoreResult<Subject> {
        let mut tx = self.pool.begin().await?;
        let saved = save_in_tx(&mut tx, subject).await?;
        tx.commit().await?;
        Ok(saved)
    }

    async fn save_all(&self, subjects: Vec<Subject>) -> StoreResult<Vec<Subject>> {
        let mut tx = self.pool.begin().await?;
        let mut saved = Vec::with_capacity(subjects.len());
        for subject in subjects {
            saved.push(save_in_tx(&mut tx, subject).await?);
        }
        tx.commit().await?;
        Ok(saved)
    }

    async fn delete_subject(&self, taxpayer_id: &str) -> StoreResult<bool> {
        let affected = sqlx::query("DELETE FROM subjects WHERE taxpayer_id = $1")
            .bind(taxpayer_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    async fn find_proposal_by_number(&self, number: &str) -> StoreResult<Option<Proposal>> {
        let row = sqlx::query(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE number = $1"
        ))
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(proposal_from_row).transpose()?)
    }

    async fn find_proposal_by_subject_and_date(
        &self,
        taxpayer_id: &str,
        created_on: NaiveDate,
    ) -> StoreResult<Option<Proposal>> {
        let row = sqlx::query(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals \
             WHERE taxpayer_id = $1 AND created_on = $2 ORDER BY number NULLS FIRST LIMIT 1"
        ))
        .bind(taxpayer_id)
        .bind(created_on)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(proposal_from_row).transpose()?)
    }

    async fn proposals_for_subject(&self, taxpayer_id: &str) -> StoreResult<Vec<Proposal>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE taxpayer_id = $1 ORDER BY created_on"
        ))
        .bind(taxpayer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(proposal_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_proposals(&self, offset: usize, limit: usize) -> StoreResult<Vec<Proposal>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals \
             ORDER BY created_on DESC, number LIMIT $1 OFFSET $2"
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(proposal_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn save_proposal(&self, proposal: Proposal) -> StoreResult<Proposal> {
        // known values survive a save that leaves them empty
        let result = sqlx::query(
            "INSERT INTO proposals \
             (id, taxpayer_id, number, disbursed_cents, installment_cents, signature_link, created_on) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET \
             number = COALESCE(EXCLUDED.number, proposals.number), \
             disbursed_cents = COALESCE(EXCLUDED.disbursed_cents, proposals.disbursed_cents), \
             installment_cents = COALESCE(EXCLUDED.installment_cents, proposals.installment_cents), \
             signature_link = COALESCE(EXCLUDED.signature_link, proposals.signature_link) \
             RETURNING id, taxpayer_id, number, disbursed_cents, installment_cents, signature_link, created_on",
        )
        .bind(proposal.id)
        .bind(&proposal.taxpayer_id)
        .bind(&proposal.number)
        .bind(proposal.disbursed_cents)
        .bind(proposal.installment_cents)
        .bind(&proposal.signature_link)
        .bind(proposal.created_on)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(proposal_from_row(&row)?),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                StoreError::DuplicateProposalNumber(proposal.number.unwrap_or_default()),
            ),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(StoreError::SubjectNotFound(proposal.taxpayer_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_proposal(&self, number: &str) -> StoreResult<bool> {
        let affected = sqlx::query("DELETE FROM proposals WHERE number = $1")
            .bind(number)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}
