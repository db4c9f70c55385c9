//! Bulk subject import from spreadsheet exports.
//!
//! Each file is a CSV with a taxpayer id column (`CPF`) and a registration
//! column (`Matricula`). Files whose name carries the priority marker are
//! read first, so the priority flag of a taxpayer is fixed by the first
//! priority sheet that mentions it.

use std::fs::File;
use std::io::Seek;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::cast::AsArray;
use arrow_array::Array;
use arrow_csv::reader::Format;
use arrow_csv::ReaderBuilder;
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use margem_core::{Relationship, SourceRecord};
use margem_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::{BatchSummary, ReconciliationEngine};
use crate::single_flight::SingleFlight;
use crate::{RunOutcome, SyncError, SyncResult};

const PRIORITY_MARKER: &str = "CASA";
const TAXPAYER_COLUMN: &str = "cpf";
const REGISTRATION_COLUMN: &str = "matricula";
const IMPORT_BATCH_SIZE: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct SheetSource {
    pub file_name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SheetRegistry {
    #[serde(default)]
    pub sheets: Vec<SheetSource>,
}

pub async fn load_sheet_registry(path: &Path) -> Result<SheetRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn is_priority_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().to_uppercase().contains(PRIORITY_MARKER))
        .unwrap_or(false)
}

/// Clears `dir` and downloads every registered sheet into it. Returns the
/// number of files written; a failed sheet is logged and skipped.
pub async fn download_sheets(
    fetcher: &HttpFetcher,
    run_id: Uuid,
    registry: &SheetRegistry,
    dir: &Path,
) -> Result<usize> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            fs::remove_file(entry.path())
                .await
                .with_context(|| format!("removing {}", entry.path().display()))?;
        }
    }

    let mut written = 0;
    for sheet in &registry.sheets {
        let Some(file_name) = Path::new(&sheet.file_name).file_name() else {
            warn!(file_name = %sheet.file_name, "sheet without a usable file name skipped");
            continue;
        };
        let destination = dir.join(file_name);
        match fetcher.fetch_to_file(run_id, &sheet.url, &destination).await {
            Ok(bytes) => {
                info!(file = %destination.display(), bytes, "sheet downloaded");
                written += 1;
            }
            Err(err) => error!(file_name = %sheet.file_name, error = %format!("{err:#}"), "sheet download failed"),
        }
    }
    Ok(written)
}

/// Lowercases and strips the accents spreadsheet headers tend to carry.
fn fold_header(name: &str) -> String {
    name.trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' => 'a',
            'é' | 'ê' => 'e',
            'í' => 'i',
            'ó' | 'ô' | 'õ' => 'o',
            'ú' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

fn find_column(schema: &Schema, wanted: &str) -> Option<usize> {
    schema
        .fields()
        .iter()
        .position(|field| fold_header(field.name()) == wanted)
}

/// Reads one import file. `Ok(None)` when the file lacks either key column.
pub fn read_import_file(path: &Path) -> Result<Option<Vec<SourceRecord>>> {
    let priority = is_priority_file(path);
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let (inferred, _) = Format::default()
        .with_header(true)
        .infer_schema(&mut file, Some(1))
        .with_context(|| format!("reading header of {}", path.display()))?;
    let (Some(taxpayer_index), Some(registration_index)) = (
        find_column(&inferred, TAXPAYER_COLUMN),
        find_column(&inferred, REGISTRATION_COLUMN),
    ) else {
        return Ok(None);
    };

    file.rewind()
        .with_context(|| format!("rewinding {}", path.display()))?;
    let schema = Arc::new(Schema::new(
        inferred
            .fields()
            .iter()
            .map(|field| ArrowField::new(field.name(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));
    let reader = ReaderBuilder::new(schema)
        .with_header(true)
        .with_batch_size(IMPORT_BATCH_SIZE)
        .build(file)
        .with_context(|| format!("opening csv reader for {}", path.display()))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("reading rows of {}", path.display()))?;
        let (Some(taxpayers), Some(registrations)) = (
            batch.column(taxpayer_index).as_string_opt::<i32>(),
            batch.column(registration_index).as_string_opt::<i32>(),
        ) else {
            bail!("key columns of {} are not text", path.display());
        };
        for row in 0..batch.num_rows() {
            if taxpayers.is_null(row) || registrations.is_null(row) {
                continue;
            }
            let taxpayer_id = taxpayers.value(row).trim();
            let registration = registrations.value(row).trim();
            if taxpayer_id.is_empty() || registration.is_empty() {
                continue;
            }
            let mut record = SourceRecord::new(taxpayer_id);
            record.priority = Some(priority);
            record.relationships.push(Relationship::new(None, registration));
            records.push(record);
        }
    }
    Ok(Some(records))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportedFiles {
    pub records: Vec<SourceRecord>,
    pub files_read: usize,
    pub files_skipped: usize,
}

/// Every `.csv` in `dir`, priority files first, then by name.
pub fn read_import_dir(dir: &Path) -> Result<ImportedFiles> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort_by_key(|path| (!is_priority_file(path), path.clone()));

    let mut imported = ImportedFiles::default();
    for path in paths {
        match read_import_file(&path) {
            Ok(Some(records)) => {
                info!(file = %path.display(), rows = records.len(), "import file read");
                imported.files_read += 1;
                imported.records.extend(records);
            }
            Ok(None) => {
                warn!(file = %path.display(), "import file lacks CPF/Matricula columns; skipped");
                imported.files_skipped += 1;
            }
            Err(err) => {
                error!(file = %path.display(), error = %format!("{err:#}"), "import file unreadable; skipped");
                imported.files_skipped += 1;
            }
        }
    }
    Ok(imported)
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub downloaded: usize,
    pub files_read: usize,
    pub files_skipped: usize,
    pub batch: BatchSummary,
}

/// Single-flight bulk import: optional sheet download, then one batch upsert
/// of every row in the import directory.
#[derive(Clone)]
pub struct ImportJob {
    engine: Arc<ReconciliationEngine>,
    import_dir: PathBuf,
    sheets: Option<(PathBuf, Arc<HttpFetcher>)>,
    flight: Arc<SingleFlight>,
}

impl ImportJob {
    pub fn new(engine: Arc<ReconciliationEngine>, import_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            import_dir: import_dir.into(),
            sheets: None,
            flight: Arc::new(SingleFlight::new()),
        }
    }

    /// Refreshes the import directory from the sheet registry before reading.
    pub fn with_sheets(mut self, registry_file: impl Into<PathBuf>, fetcher: Arc<HttpFetcher>) -> Self {
        self.sheets = Some((registry_file.into(), fetcher));
        self
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    pub async fn run(&self) -> RunOutcome<ImportSummary> {
        let Some(_flight) = self.flight.try_begin() else {
            info!("import already running; trigger ignored");
            return RunOutcome::AlreadyRunning;
        };
        let run_id = Uuid::new_v4();
        match self
            .execute(run_id)
            .instrument(info_span!("import_run", %run_id))
            .await
        {
            Ok(summary) => RunOutcome::Completed {
                run_id,
                report: summary,
            },
            Err(err) => {
                error!(%run_id, error = %err, "import failed");
                RunOutcome::Failed {
                    run_id,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn execute(&self, run_id: Uuid) -> SyncResult<ImportSummary> {
        let started_at = Utc::now();
        let downloaded = match &self.sheets {
            Some((registry_file, fetcher)) => {
                let registry = load_sheet_registry(registry_file)
                    .await
                    .map_err(|err| SyncError::Config(format!("{err:#}")))?;
                download_sheets(fetcher, run_id, &registry, &self.import_dir)
                    .await
                    .map_err(|err| SyncError::Import(format!("{err:#}")))?
            }
            None => 0,
        };

        let dir = self.import_dir.clone();
        let imported = tokio::task::spawn_blocking(move || read_import_dir(&dir))
            .await
            .map_err(|err| SyncError::Import(err.to_string()))?
            .map_err(|err| SyncError::Import(format!("{err:#}")))?;

        let batch = self.engine.upsert_many(imported.records).await?;
        let summary = ImportSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            downloaded,
            files_read: imported.files_read,
            files_skipped: imported.files_skipped,
            batch,
        };
        info!(
            files_read = summary.files_read,
            files_skipped = summary.files_skipped,
            created = summary.batch.created,
            updated = summary.batch.updated,
            "import finished"
        );
        Ok(summary)
    }
}
