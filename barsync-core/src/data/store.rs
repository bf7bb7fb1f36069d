//! Persistent table store with merge-on-write.
//!
//! Layout: `{data_root}/data/{equities|funds|indices}/{frequency}/{code}.{csv|parquet}`
//!
//! - Daily tables are CSV, intraday tables are Parquet
//! - Every write rewrites the whole table atomically (write `.tmp`, rename into place)
//! - A `{code}.meta.json` sidecar records row count, time span, content hash
//!   and the adjustment anchor of the table
//! - A table that fails to decode is reported, never overwritten

use crate::domain::{dedup_sorted_desc, AssetClass, BarRow, Frequency, StorageFormat};
use chrono::{NaiveDateTime, TimeZone, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {message}")]
    Csv { path: PathBuf, message: String },

    #[error("Parquet error in {path}: {message}")]
    Parquet { path: PathBuf, message: String },

    #[error("metadata error in {path}: {message}")]
    Meta { path: PathBuf, message: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, e: impl std::fmt::Display) -> Self {
        StoreError::Csv {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }

    fn parquet(path: &Path, e: impl std::fmt::Display) -> Self {
        StoreError::Parquet {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }
}

/// A merge-write that could not complete.
///
/// A failure before the table is renamed into place leaves the previous table
/// and sidecar as they were. A failure writing the sidecar afterwards leaves
/// the merged table next to the previous sidecar; the next successful write
/// replaces it. Either way the caller does not advance the sync state.
#[derive(Debug, Error)]
#[error("write failed for {code}@{frequency}: {source}")]
pub struct WriteFailure {
    pub code: String,
    pub frequency: Frequency,
    #[source]
    pub source: StoreError,
}

/// Metadata sidecar for a stored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub code: String,
    pub frequency: Frequency,
    pub row_count: usize,
    pub first_time: Option<NaiveDateTime>,
    pub last_time: Option<NaiveDateTime>,
    pub data_hash: String,
    /// Adjustment anchor shared by every adjusted row in the table.
    pub anchor_factor: Option<f64>,
    pub written_at: NaiveDateTime,
}

/// Result of a successful merge-write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteSummary {
    /// Rows in the incoming batch (after dedup).
    pub rows_written: usize,
    pub total_rows: usize,
    /// Newest timestamp present in the table after the write.
    pub max_time: Option<NaiveDateTime>,
}

/// The table store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `{root}/data/{class dir}/{frequency}/`
    pub fn table_dir(&self, asset_class: AssetClass, frequency: Frequency) -> PathBuf {
        self.root
            .join("data")
            .join(asset_class.data_dir())
            .join(frequency.as_str())
    }

    pub fn table_path(&self, asset_class: AssetClass, frequency: Frequency, code: &str) -> PathBuf {
        let ext = frequency.storage_format().extension();
        self.table_dir(asset_class, frequency)
            .join(format!("{code}.{ext}"))
    }

    fn meta_path(&self, asset_class: AssetClass, frequency: Frequency, code: &str) -> PathBuf {
        self.table_dir(asset_class, frequency)
            .join(format!("{code}.meta.json"))
    }

    pub fn exists(&self, asset_class: AssetClass, frequency: Frequency, code: &str) -> bool {
        self.table_path(asset_class, frequency, code).is_file()
    }

    /// Check that the data root can be created and written to.
    pub fn ensure_writable(&self) -> Result<(), StoreError> {
        let data = self.root.join("data");
        fs::create_dir_all(&data).map_err(|e| StoreError::io(&data, e))?;
        let probe = self.root.join(".barsync_write_probe");
        fs::write(&probe, b"ok").map_err(|e| StoreError::io(&probe, e))?;
        fs::remove_file(&probe).map_err(|e| StoreError::io(&probe, e))?;
        Ok(())
    }

    /// Load the stored rows for a table, newest first. A missing table is empty.
    pub fn read(
        &self,
        asset_class: AssetClass,
        frequency: Frequency,
        code: &str,
    ) -> Result<Vec<BarRow>, StoreError> {
        let path = self.table_path(asset_class, frequency, code);
        if !path.exists() {
            return Ok(Vec::new());
        }
        match frequency.storage_format() {
            StorageFormat::Csv => read_csv(&path),
            StorageFormat::Parquet => read_parquet(&path),
        }
    }

    /// Sidecar metadata, if present and readable.
    pub fn read_meta(
        &self,
        asset_class: AssetClass,
        frequency: Frequency,
        code: &str,
    ) -> Option<TableMeta> {
        let content = fs::read_to_string(self.meta_path(asset_class, frequency, code)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Codes with a stored table for this asset class and frequency, sorted.
    pub fn list_codes(
        &self,
        asset_class: AssetClass,
        frequency: Frequency,
    ) -> Result<Vec<String>, StoreError> {
        let dir = self.table_dir(asset_class, frequency);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let ext = frequency.storage_format().extension();
        let mut codes = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                codes.push(stem.to_string());
            }
        }
        codes.sort();
        Ok(codes)
    }

    /// Merge `new_rows` into the stored table and rewrite it.
    ///
    /// Duplicate keys keep the incoming row. The table is written sorted newest
    /// first. `anchor` is recorded in the sidecar only when the table has none yet.
    pub fn merge_write(
        &self,
        asset_class: AssetClass,
        frequency: Frequency,
        code: &str,
        new_rows: Vec<BarRow>,
        anchor: Option<f64>,
    ) -> Result<WriteSummary, WriteFailure> {
        self.read(asset_class, frequency, code)
            .and_then(|existing| self.write_merged(asset_class, frequency, code, existing, new_rows, anchor))
            .map_err(|source| WriteFailure {
                code: code.to_string(),
                frequency,
                source,
            })
    }

    /// [`merge_write`](Self::merge_write) for a caller that already loaded the
    /// table. `existing` must be what [`read`](Self::read) returned for it.
    pub fn merge_write_onto(
        &self,
        asset_class: AssetClass,
        frequency: Frequency,
        code: &str,
        existing: Vec<BarRow>,
        new_rows: Vec<BarRow>,
        anchor: Option<f64>,
    ) -> Result<WriteSummary, WriteFailure> {
        self.write_merged(asset_class, frequency, code, existing, new_rows, anchor)
            .map_err(|source| WriteFailure {
                code: code.to_string(),
                frequency,
                source,
            })
    }

    fn write_merged(
        &self,
        asset_class: AssetClass,
        frequency: Frequency,
        code: &str,
        existing: Vec<BarRow>,
        new_rows: Vec<BarRow>,
        anchor: Option<f64>,
    ) -> Result<WriteSummary, StoreError> {
        let rows_written = dedup_sorted_desc(new_rows.clone()).len();
        let mut combined = existing;
        combined.extend(new_rows);
        let merged = dedup_sorted_desc(combined);

        let dir = self.table_dir(asset_class, frequency);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let path = self.table_path(asset_class, frequency, code);
        write_atomic(&path, |tmp| match frequency.storage_format() {
            StorageFormat::Csv => write_csv(&merged, tmp),
            StorageFormat::Parquet => write_parquet(&merged, tmp),
        })?;

        let previous_anchor = self
            .read_meta(asset_class, frequency, code)
            .and_then(|m| m.anchor_factor);
        let meta = TableMeta {
            code: code.to_string(),
            frequency,
            row_count: merged.len(),
            first_time: merged.last().map(|r| r.time),
            last_time: merged.first().map(|r| r.time),
            data_hash: content_hash(&merged, &path)?,
            anchor_factor: previous_anchor.or(anchor),
            written_at: chrono::Local::now().naive_local(),
        };
        let meta_path = self.meta_path(asset_class, frequency, code);
        let json = serde_json::to_vec_pretty(&meta).map_err(|e| StoreError::Meta {
            path: meta_path.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&meta_path, |tmp| {
            fs::write(tmp, &json).map_err(|e| StoreError::io(tmp, e))
        })?;

        Ok(WriteSummary {
            rows_written,
            total_rows: merged.len(),
            max_time: meta.last_time,
        })
    }
}

/// Write through `{path}.tmp` and rename into place. The temp file is removed on failure.
pub(crate) fn write_atomic<F>(path: &Path, write: F) -> Result<(), StoreError>
where
    F: FnOnce(&Path) -> Result<(), StoreError>,
{
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    if let Err(e) = write(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })
}

fn content_hash(rows: &[BarRow], path: &Path) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(rows).map_err(|e| StoreError::Meta {
        path: path.to_path_buf(),
        message: format!("hash serialization: {e}"),
    })?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

// ── CSV codec ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    ts_code: String,
    trade_time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    amount: f64,
    pre_close: Option<f64>,
    change: Option<f64>,
    pct_chg: Option<f64>,
    adj_factor: Option<f64>,
    adj_open: Option<f64>,
    adj_high: Option<f64>,
    adj_low: Option<f64>,
    adj_close: Option<f64>,
}

impl From<&BarRow> for CsvRow {
    fn from(r: &BarRow) -> Self {
        CsvRow {
            ts_code: r.code.clone(),
            trade_time: r.time.format(TIME_FORMAT).to_string(),
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.volume,
            amount: r.amount,
            pre_close: r.pre_close,
            change: r.change,
            pct_chg: r.pct_chg,
            adj_factor: r.adj_factor,
            adj_open: r.adj_open,
            adj_high: r.adj_high,
            adj_low: r.adj_low,
            adj_close: r.adj_close,
        }
    }
}

fn write_csv(rows: &[BarRow], path: &Path) -> Result<(), StoreError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| StoreError::csv(path, e))?;
    for row in rows {
        writer
            .serialize(CsvRow::from(row))
            .map_err(|e| StoreError::csv(path, e))?;
    }
    writer.flush().map_err(|e| StoreError::io(path, e))
}

fn read_csv(path: &Path) -> Result<Vec<BarRow>, StoreError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| StoreError::csv(path, e))?;
    let mut rows = Vec::new();
    for (i, record) in reader.deserialize::<CsvRow>().enumerate() {
        let r = record.map_err(|e| StoreError::csv(path, e))?;
        let time = NaiveDateTime::parse_from_str(&r.trade_time, TIME_FORMAT)
            .map_err(|e| StoreError::csv(path, format!("row {i}: bad trade_time '{}': {e}", r.trade_time)))?;
        rows.push(BarRow {
            code: r.ts_code,
            time,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.volume,
            amount: r.amount,
            pre_close: r.pre_close,
            change: r.change,
            pct_chg: r.pct_chg,
            adj_factor: r.adj_factor,
            adj_open: r.adj_open,
            adj_high: r.adj_high,
            adj_low: r.adj_low,
            adj_close: r.adj_close,
        });
    }
    Ok(rows)
}

// ── Parquet codec ───────────────────────────────────────────────────

const REQUIRED_COLUMNS: [&str; 8] = [
    "ts_code",
    "trade_time",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "amount",
];

const OPTIONAL_COLUMNS: [&str; 8] = [
    "pre_close",
    "change",
    "pct_chg",
    "adj_factor",
    "adj_open",
    "adj_high",
    "adj_low",
    "adj_close",
];

fn optional_field(r: &BarRow, name: &str) -> Option<f64> {
    match name {
        "pre_close" => r.pre_close,
        "change" => r.change,
        "pct_chg" => r.pct_chg,
        "adj_factor" => r.adj_factor,
        "adj_open" => r.adj_open,
        "adj_high" => r.adj_high,
        "adj_low" => r.adj_low,
        "adj_close" => r.adj_close,
        _ => None,
    }
}

fn rows_to_dataframe(rows: &[BarRow], path: &Path) -> Result<DataFrame, StoreError> {
    let codes: Vec<&str> = rows.iter().map(|r| r.code.as_str()).collect();
    let times: Vec<i64> = rows
        .iter()
        .map(|r| r.time.and_utc().timestamp_millis())
        .collect();
    let f = |get: fn(&BarRow) -> f64| rows.iter().map(get).collect::<Vec<f64>>();

    let mut columns = vec![
        Column::new("ts_code".into(), codes),
        Column::new("trade_time".into(), times)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .map_err(|e| StoreError::parquet(path, format!("trade_time cast: {e}")))?,
        Column::new("open".into(), f(|r| r.open)),
        Column::new("high".into(), f(|r| r.high)),
        Column::new("low".into(), f(|r| r.low)),
        Column::new("close".into(), f(|r| r.close)),
        Column::new("volume".into(), f(|r| r.volume)),
        Column::new("amount".into(), f(|r| r.amount)),
    ];
    for name in OPTIONAL_COLUMNS {
        let values: Vec<Option<f64>> = rows.iter().map(|r| optional_field(r, name)).collect();
        columns.push(Column::new(name.into(), values));
    }

    DataFrame::new(columns).map_err(|e| StoreError::parquet(path, format!("dataframe creation: {e}")))
}

fn write_parquet(rows: &[BarRow], path: &Path) -> Result<(), StoreError> {
    let mut df = rows_to_dataframe(rows, path)?;
    let file = fs::File::create(path).map_err(|e| StoreError::io(path, e))?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(|e| StoreError::parquet(path, format!("write: {e}")))?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<Vec<BarRow>, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::io(path, e))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::parquet(path, format!("read: {e}")))?;

    for name in REQUIRED_COLUMNS.iter().chain(OPTIONAL_COLUMNS.iter()) {
        if df.column(name).is_err() {
            return Err(StoreError::parquet(path, format!("missing column '{name}'")));
        }
    }

    let err = |e: PolarsError| StoreError::parquet(path, format!("column read: {e}"));
    let codes = df.column("ts_code").map_err(err)?.str().map_err(err)?.clone();
    let times = df
        .column("trade_time")
        .map_err(err)?
        .cast(&DataType::Int64)
        .map_err(err)?;
    let times = times.i64().map_err(err)?;
    let float = |name: &str| -> Result<Float64Chunked, StoreError> {
        Ok(df.column(name).map_err(err)?.f64().map_err(err)?.clone())
    };
    let open = float("open")?;
    let high = float("high")?;
    let low = float("low")?;
    let close = float("close")?;
    let volume = float("volume")?;
    let amount = float("amount")?;
    let optional: Vec<Float64Chunked> = OPTIONAL_COLUMNS
        .iter()
        .map(|name| float(name))
        .collect::<Result<_, _>>()?;

    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let code = codes
            .get(i)
            .ok_or_else(|| StoreError::parquet(path, format!("null ts_code at row {i}")))?;
        let millis = times
            .get(i)
            .ok_or_else(|| StoreError::parquet(path, format!("null trade_time at row {i}")))?;
        let time = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| StoreError::parquet(path, format!("bad trade_time at row {i}")))?
            .naive_utc();
        rows.push(BarRow {
            code: code.to_string(),
            time,
            open: open.get(i).unwrap_or(f64::NAN),
            high: high.get(i).unwrap_or(f64::NAN),
            low: low.get(i).unwrap_or(f64::NAN),
            close: close.get(i).unwrap_or(f64::NAN),
            volume: volume.get(i).unwrap_or(0.0),
            amount: amount.get(i).unwrap_or(0.0),
            pre_close: optional[0].get(i),
            change: optional[1].get(i),
            pct_chg: optional[2].get(i),
            adj_factor: optional[3].get(i),
            adj_open: optional[4].get(i),
            adj_high: optional[5].get(i),
            adj_low: optional[6].get(i),
            adj_close: optional[7].get(i),
        });
    }
    Ok(rows)
}
