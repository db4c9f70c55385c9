use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Date32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{Datelike, NaiveDate};
use margem_core::Proposal;
use margem_storage::SubjectStore;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// One proposal joined with the subject fields the export shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalExportRow {
    pub name: Option<String>,
    pub taxpayer_id: String,
    pub phone: Option<String>,
    pub number: Option<String>,
    pub signature_link: Option<String>,
    pub disbursed_cents: Option<i64>,
    pub installment_cents: Option<i64>,
    pub created_on: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct ProposalExport {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub sha256: String,
    pub rows: usize,
}

/// Joins each proposal with its subject. Proposals whose subject is gone
/// are exported without name or phone.
pub async fn collect_export_rows(
    store: &dyn SubjectStore,
    proposals: Vec<Proposal>,
) -> Result<Vec<ProposalExportRow>> {
    let keys: Vec<String> = proposals.iter().map(|p| p.taxpayer_id.clone()).collect();
    let subjects: HashMap<String, (Option<String>, Option<String>)> = store
        .find_subjects_by_keys(&keys)
        .await
        .context("loading subjects for export")?
        .into_iter()
        .map(|s| (s.taxpayer_id, (s.name, s.phone)))
        .collect();

    Ok(proposals
        .into_iter()
        .map(|p| {
            let (name, phone) = subjects.get(&p.taxpayer_id).cloned().unwrap_or_default();
            ProposalExportRow {
                name,
                phone,
                taxpayer_id: p.taxpayer_id,
                number: p.number,
                signature_link: p.signature_link,
                disbursed_cents: p.disbursed_cents,
                installment_cents: p.installment_cents,
                created_on: p.created_on,
            }
        })
        .collect())
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - NaiveDate::from_ymd_opt(1970, 1, 1).map_or(719_163, |d| d.num_days_from_ce())
}

/// Writes `rows` as a single-batch parquet table held in memory.
pub fn export_proposals_parquet(rows: &[ProposalExportRow], date: NaiveDate) -> Result<ProposalExport> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("name", DataType::Utf8, true),
        ArrowField::new("taxpayer_id", DataType::Utf8, false),
        ArrowField::new("phone", DataType::Utf8, true),
        ArrowField::new("proposal_number", DataType::Utf8, true),
        ArrowField::new("signature_link", DataType::Utf8, true),
        ArrowField::new("disbursed_cents", DataType::Int64, true),
        ArrowField::new("installment_cents", DataType::Int64, true),
        ArrowField::new("created_on", DataType::Date32, false),
    ]));

    let names = StringArray::from(rows.iter().map(|r| r.name.as_deref()).collect::<Vec<_>>());
    let taxpayer_ids = StringArray::from(
        rows.iter()
            .map(|r| Some(r.taxpayer_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let phones = StringArray::from(rows.iter().map(|r| r.phone.as_deref()).collect::<Vec<_>>());
    let numbers = StringArray::from(rows.iter().map(|r| r.number.as_deref()).collect::<Vec<_>>());
    let links = StringArray::from(
        rows.iter()
            .map(|r| r.signature_link.as_deref())
            .collect::<Vec<_>>(),
    );
    let disbursed = Int64Array::from(rows.iter().map(|r| r.disbursed_cents).collect::<Vec<_>>());
    let installments = Int64Array::from(rows.iter().map(|r| r.installment_cents).collect::<Vec<_>>());
    let created = Date32Array::from(
        rows.iter()
            .map(|r| days_since_epoch(r.created_on))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(names),
            Arc::new(taxpayer_ids),
            Arc::new(phones),
            Arc::new(numbers),
            Arc::new(links),
            Arc::new(disbursed),
            Arc::new(installments),
            Arc::new(created),
        ],
    )
    .context("building proposals record batch")?;

    let mut bytes = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut bytes, batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing proposals batch")?;
    writer.close().context("closing parquet writer")?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(ProposalExport {
        file_name: format!("proposals_{}.parquet", date.format("%d-%m-%Y")),
        sha256: hex::encode(hasher.finalize()),
        rows: rows.len(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use margem_core::{ProposalPatch, Subject};
    use margem_storage::MemoryStore;

    #[test]
    fn epoch_offset_matches_arrow_date32() {
        assert_eq!(days_since_epoch(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()), 0);
        assert_eq!(days_since_epoch(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()), 19_723);
    }

    #[tokio::test]
    async fn export_joins_subjects_and_writes_parquet() {
        let store = MemoryStore::new();
        let mut subject = Subject::new("11111111111");
        subject.name = Some("Ana".into());
        subject.phone = Some("11988887777".into());
        store.save(subject).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let mut proposal = Proposal::partial("11111111111", date);
        ProposalPatch::number("00000042").apply(&mut proposal);
        ProposalPatch::amounts(Some(123_456), Some(9_870)).apply(&mut proposal);
        let orphan = Proposal::partial("99999999999", date);

        let rows = collect_export_rows(&store, vec![proposal, orphan]).await.unwrap();
        assert_eq!(rows[0].name.as_deref(), Some("Ana"));
        assert_eq!(rows[0].number.as_deref(), Some("00000042"));
        assert_eq!(rows[1].name, None);

        let export = export_proposals_parquet(&rows, date).unwrap();
        assert_eq!(export.file_name, "proposals_05-03-2024.parquet");
        assert_eq!(export.rows, 2);
        assert_eq!(&export.bytes[..4], b"PAR1");
        assert_eq!(export.sha256.len(), 64);
    }

    #[test]
    fn empty_export_is_still_a_valid_file() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let export = export_proposals_parquet(&[], date).unwrap();
        assert_eq!(export.rows, 0);
        assert_eq!(&export.bytes[export.bytes.len() - 4..], b"PAR1");
    }
}
