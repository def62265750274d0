#![allow(clippy::missing_errors_doc)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use review_odds_core::{
    format_rfc3339, format_score_list, now_utc, parse_score_list, DecisionStatus,
    HistoricalRecord, RecordStore, ReviewOddsError,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

pub const DATASET_COLUMNS: [&str; 7] = [
    "id",
    "title",
    "year",
    "scores",
    "mean_score",
    "status",
    "raw_decision",
];

const ARCHIVE_MIGRATION_VERSION: i64 = 1;
const ARCHIVE_EXTENSIONS: [&str; 3] = ["sqlite3", "sqlite", "db"];

const SCHEMA_ARCHIVE_V1: &str = r"
CREATE TABLE IF NOT EXISTS dataset_imports (
  import_id TEXT PRIMARY KEY,
  source TEXT NOT NULL,
  record_count INTEGER NOT NULL CHECK (record_count >= 0),
  imported_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS historical_records (
  record_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  year INTEGER,
  scores_json TEXT NOT NULL,
  mean_score REAL NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('Accept', 'Reject')),
  raw_decision TEXT NOT NULL,
  import_id TEXT NOT NULL,
  FOREIGN KEY (import_id) REFERENCES dataset_imports(import_id)
);

CREATE INDEX IF NOT EXISTS idx_historical_records_mean
  ON historical_records(mean_score);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedRow {
    pub line: u64,
    pub id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub source: PathBuf,
    pub store: RecordStore,
    pub skipped_rows: Vec<SkippedRow>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetRow {
    id: String,
    title: String,
    year: Option<i32>,
    scores: String,
    mean_score: f64,
    status: String,
    raw_decision: String,
}

impl DatasetRow {
    fn from_record(record: &HistoricalRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            year: record.year,
            scores: format_score_list(&record.scores),
            mean_score: record.mean_score,
            status: record.status.as_str().to_string(),
            raw_decision: record.raw_decision.clone(),
        }
    }

    fn into_record(self) -> Result<HistoricalRecord, ReviewOddsError> {
        let scores = parse_score_list(&self.scores)?;
        let status = DecisionStatus::parse(self.status.trim()).ok_or_else(|| {
            ReviewOddsError::Parse(format!("unknown status {:?}", self.status))
        })?;

        let record = HistoricalRecord {
            id: self.id,
            title: self.title,
            year: self.year,
            scores,
            mean_score: self.mean_score,
            status,
            raw_decision: self.raw_decision,
        };
        record.validate()?;
        Ok(record)
    }
}

/// Loads a dataset CSV. Malformed rows are skipped with a warning and listed in
/// the report; an unreadable source fails the whole load.
pub fn load_csv(path: &Path) -> Result<LoadReport> {
    let file = File::open(path).map_err(|err| {
        ReviewOddsError::DataUnavailable(format!(
            "cannot read dataset {}: {err}",
            path.display()
        ))
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(file);
    let headers = reader
        .headers()
        .map_err(|err| {
            ReviewOddsError::DataUnavailable(format!(
                "cannot read dataset header from {}: {err}",
                path.display()
            ))
        })?
        .clone();

    if headers.is_empty() {
        info!(path = %path.display(), "dataset file is empty");
        return Ok(LoadReport {
            source: path.to_path_buf(),
            store: RecordStore::default(),
            skipped_rows: Vec::new(),
        });
    }

    let missing = DATASET_COLUMNS
        .iter()
        .filter(|column| !headers.iter().any(|header| header == **column))
        .copied()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(ReviewOddsError::Parse(format!(
            "dataset {} is missing columns: {}",
            path.display(),
            missing.join(", ")
        ))
        .into());
    }

    let mut records = Vec::new();
    let mut skipped_rows = Vec::new();
    let mut seen_ids = BTreeSet::new();
    let mut raw = csv::StringRecord::new();

    loop {
        match reader.read_record(&mut raw) {
            Ok(false) => break,
            Ok(true) => {}
            Err(err) if err.is_io_error() => {
                return Err(ReviewOddsError::DataUnavailable(format!(
                    "failed reading dataset {}: {err}",
                    path.display()
                ))
                .into());
            }
            Err(err) => {
                let line = err.position().map_or(0, csv::Position::line);
                skipped_rows.push(skip_row(line, None, err.to_string()));
                continue;
            }
        }

        let line = raw.position().map_or(0, csv::Position::line);
        let id = raw.get(0).map(str::to_string);
        let parsed = raw
            .deserialize::<DatasetRow>(Some(&headers))
            .map_err(|err| ReviewOddsError::Parse(err.to_string()))
            .and_then(DatasetRow::into_record);

        match parsed {
            Ok(record) if seen_ids.contains(&record.id) => {
                skipped_rows.push(skip_row(line, id, "duplicate id".to_string()));
            }
            Ok(record) => {
                seen_ids.insert(record.id.clone());
                records.push(record);
            }
            Err(err) => skipped_rows.push(skip_row(line, id, err.to_string())),
        }
    }

    info!(
        path = %path.display(),
        records = records.len(),
        skipped = skipped_rows.len(),
        "loaded dataset"
    );

    Ok(LoadReport {
        source: path.to_path_buf(),
        store: RecordStore::from_records(records),
        skipped_rows,
    })
}

fn skip_row(line: u64, id: Option<String>, reason: String) -> SkippedRow {
    warn!(line, id = id.as_deref().unwrap_or("?"), %reason, "skipping dataset row");
    SkippedRow { line, id, reason }
}

/// Writes records in the dataset CSV layout, header first.
pub fn write_csv(path: &Path, records: &[HistoricalRecord]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to create dataset file {}", path.display()))?;

    writer
        .write_record(DATASET_COLUMNS)
        .context("failed to write dataset header")?;
    for record in records {
        writer
            .serialize(DatasetRow::from_record(record))
            .with_context(|| format!("failed to write dataset row {}", record.id))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush dataset file {}", path.display()))?;

    info!(path = %path.display(), records = records.len(), "wrote dataset");
    Ok(())
}

#[must_use]
pub fn is_archive_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext))
}

/// Loads from a `SQLite` archive or a CSV file depending on the extension.
pub fn load_dataset(path: &Path) -> Result<LoadReport> {
    if !is_archive_path(path) {
        return load_csv(path);
    }

    if !path.exists() {
        return Err(ReviewOddsError::DataUnavailable(format!(
            "dataset archive {} does not exist",
            path.display()
        ))
        .into());
    }

    let archive = SqliteRecordArchive::open(path)?;
    archive.migrate()?;
    Ok(LoadReport {
        source: path.to_path_buf(),
        store: archive.load_store()?,
        skipped_rows: Vec::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceIdentity {
    len: u64,
    modified: Option<SystemTime>,
}

/// Memoizes dataset loads per source. An entry is reused while the file's
/// length and modification time are unchanged.
#[derive(Debug, Default)]
pub struct DatasetCache {
    entries: Mutex<BTreeMap<PathBuf, (SourceIdentity, Arc<LoadReport>)>>,
}

impl DatasetCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(&self, path: &Path) -> Result<Arc<LoadReport>> {
        let canonical = path.canonicalize().map_err(|err| {
            ReviewOddsError::DataUnavailable(format!(
                "cannot resolve dataset {}: {err}",
                path.display()
            ))
        })?;
        let metadata = std::fs::metadata(&canonical).map_err(|err| {
            ReviewOddsError::DataUnavailable(format!(
                "cannot stat dataset {}: {err}",
                canonical.display()
            ))
        })?;
        let identity = SourceIdentity {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        };

        // held across the load so concurrent first access loads once
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("dataset cache lock poisoned"))?;

        if let Some((cached, report)) = entries.get(&canonical) {
            if *cached == identity {
                debug!(path = %canonical.display(), "dataset cache hit");
                return Ok(Arc::clone(report));
            }
        }

        let report = Arc::new(load_dataset(&canonical)?);
        entries.insert(canonical, (identity, Arc::clone(&report)));
        Ok(report)
    }

    pub fn len(&self) -> Result<usize> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("dataset cache lock poisoned"))?;
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

pub struct SqliteRecordArchive {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub contract_version: String,
    pub import_id: String,
    pub source: String,
    pub imported_at: String,
    pub record_count: usize,
    pub inserted: usize,
    pub updated: usize,
    pub total_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportBatch {
    pub import_id: String,
    pub source: String,
    pub record_count: usize,
    pub imported_at: String,
}

struct ArchivedRow {
    id: String,
    title: String,
    year: Option<i64>,
    scores_json: String,
    mean_score: f64,
    status: String,
    raw_decision: String,
}

impl ArchivedRow {
    fn into_record(self) -> Result<HistoricalRecord> {
        let scores: Vec<f64> = serde_json::from_str(&self.scores_json)
            .with_context(|| format!("invalid stored scores for record {}", self.id))?;
        let status = DecisionStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("invalid stored status for record {}", self.id))?;
        let year = self
            .year
            .map(i32::try_from)
            .transpose()
            .with_context(|| format!("invalid stored year for record {}", self.id))?;

        let record = HistoricalRecord {
            id: self.id,
            title: self.title,
            year,
            scores,
            mean_score: self.mean_score,
            status,
            raw_decision: self.raw_decision,
        };
        record.validate()?;
        Ok(record)
    }
}

impl SqliteRecordArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_ARCHIVE_V1)
            .context("failed to apply archive schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ARCHIVE_MIGRATION_VERSION, now],
            )
            .context("failed to register archive schema migration")?;

        Ok(())
    }

    /// Upserts `records` by id in one transaction and logs the batch.
    pub fn import_records(
        &mut self,
        records: &[HistoricalRecord],
        source: &str,
    ) -> Result<ImportReport> {
        for record in records {
            record
                .validate()
                .map_err(|err| anyhow!("record validation failed: {err}"))?;
        }

        let import_id = Ulid::new().to_string();
        let imported_at = format_rfc3339(now_utc())?;
        let record_count = i64::try_from(records.len()).context("import batch too large")?;

        let tx = self
            .conn
            .transaction()
            .context("failed to begin import transaction")?;
        tx.execute(
            "INSERT INTO dataset_imports(import_id, source, record_count, imported_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![import_id, source, record_count, imported_at],
        )
        .context("failed to record import batch")?;

        let mut inserted = 0_usize;
        let mut updated = 0_usize;
        {
            let mut exists_stmt =
                tx.prepare("SELECT 1 FROM historical_records WHERE record_id = ?1")?;
            let mut upsert_stmt = tx.prepare(
                "INSERT INTO historical_records(
                   record_id, title, year, scores_json, mean_score, status, raw_decision, import_id
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(record_id) DO UPDATE SET
                   title = excluded.title,
                   year = excluded.year,
                   scores_json = excluded.scores_json,
                   mean_score = excluded.mean_score,
                   status = excluded.status,
                   raw_decision = excluded.raw_decision,
                   import_id = excluded.import_id",
            )?;

            for record in records {
                let existed = exists_stmt
                    .query_row(params![record.id], |_| Ok(()))
                    .optional()?
                    .is_some();
                let scores_json = serde_json::to_string(&record.scores)
                    .context("failed to serialize scores")?;

                upsert_stmt
                    .execute(params![
                        record.id,
                        record.title,
                        record.year.map(i64::from),
                        scores_json,
                        record.mean_score,
                        record.status.as_str(),
                        record.raw_decision,
                        import_id,
                    ])
                    .with_context(|| format!("failed to upsert record {}", record.id))?;

                if existed {
                    updated += 1;
                } else {
                    inserted += 1;
                }
            }
        }

        tx.commit().context("failed to commit import transaction")?;

        let total_records = self.count_records()?;
        info!(
            import_id = %import_id,
            source,
            inserted,
            updated,
            total_records,
            "imported dataset into archive"
        );

        Ok(ImportReport {
            contract_version: "import.v1".to_string(),
            import_id,
            source: source.to_string(),
            imported_at,
            record_count: records.len(),
            inserted,
            updated,
            total_records,
        })
    }

    pub fn count_records(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM historical_records", [], |row| {
                row.get(0)
            })
            .context("failed to count archived records")?;
        usize::try_from(count).with_context(|| format!("invalid record count: {count}"))
    }

    pub fn load_store(&self) -> Result<RecordStore> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, title, year, scores_json, mean_score, status, raw_decision
             FROM historical_records
             ORDER BY record_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ArchivedRow {
                id: row.get(0)?,
                title: row.get(1)?,
                year: row.get(2)?,
                scores_json: row.get(3)?,
                mean_score: row.get(4)?,
                status: row.get(5)?,
                raw_decision: row.get(6)?,
            })
        })?;

        let records = collect_rows(rows)?
            .into_iter()
            .map(ArchivedRow::into_record)
            .collect::<Result<Vec<_>>>()?;

        Ok(RecordStore::from_records(records))
    }

    pub fn list_imports(&self) -> Result<Vec<ImportBatch>> {
        let mut stmt = self.conn.prepare(
            "SELECT import_id, source, record_count, imported_at
             FROM dataset_imports
             ORDER BY imported_at ASC, import_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        collect_rows(rows)?
            .into_iter()
            .map(|(import_id, source, record_count, imported_at)| {
                Ok(ImportBatch {
                    record_count: usize::try_from(record_count)
                        .with_context(|| format!("invalid record_count: {record_count}"))?,
                    import_id,
                    source,
                    imported_at,
                })
            })
            .collect()
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
