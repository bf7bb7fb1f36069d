//! Instrument catalog backed by normalized reference CSVs.
//!
//! Layout: `{data_root}/reference/{equity|fund|index}.csv` with columns
//! `ts_code,name,asset_class,exchange,market,list_date,delist_date,management,category`.
//! Dates are `YYYYMMDD`; empty means unknown / not delisted.

use super::pacing::{CallFailure, RateLimiter};
use super::provider::ReferenceProvider;
use super::store::{write_atomic, StoreError};
use crate::domain::{AssetClass, Instrument};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Headline SSE/SZSE indices offered as a preset selection.
pub const MAJOR_INDICES: [&str; 18] = [
    "000001.SH", // SSE Composite
    "000002.SH",
    "000003.SH",
    "000016.SH", // SSE 50
    "000300.SH", // CSI 300
    "000905.SH", // CSI 500
    "000852.SH", // CSI 1000
    "399001.SZ", // SZSE Component
    "399006.SZ", // ChiNext
    "399106.SZ",
    "399107.SZ",
    "399300.SZ",
    "399905.SZ",
    "000688.SH", // STAR 50
    "399812.SZ",
    "399813.SZ",
    "399814.SZ",
    "399815.SZ",
];

const DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("reference file {path}: {message}")]
    Format { path: PathBuf, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Catalog predicates. Empty lists and `None` mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogFilter {
    pub exchanges: Vec<String>,
    pub markets: Vec<String>,
    /// Keep only instruments listed on or before this date.
    pub listed_on_or_before: Option<NaiveDate>,
    /// Drop instruments delisted before this date.
    pub delisted_on_or_after: Option<NaiveDate>,
    pub exclude_special_treatment: bool,
    pub exclude_delisted: bool,
    pub managements: Vec<String>,
    pub categories: Vec<String>,
    /// Case-insensitive name keywords (`ETF`, `LOF`); any match keeps the instrument.
    pub name_keywords: Vec<String>,
    pub limit: Option<usize>,
}

impl CatalogFilter {
    pub fn matches(&self, inst: &Instrument) -> bool {
        if !self.exchanges.is_empty() && !self.exchanges.iter().any(|e| e == &inst.exchange) {
            return false;
        }
        if !self.markets.is_empty() && !self.markets.iter().any(|m| m == &inst.market) {
            return false;
        }
        if let Some(cutoff) = self.listed_on_or_before {
            // Unknown listing dates cannot satisfy an upper bound.
            if !inst.list_date.is_some_and(|d| d <= cutoff) {
                return false;
            }
        }
        if let (Some(cutoff), Some(delisted)) = (self.delisted_on_or_after, inst.delist_date) {
            if delisted < cutoff {
                return false;
            }
        }
        if self.exclude_special_treatment && inst.is_special_treatment() {
            return false;
        }
        if self.exclude_delisted && !inst.active {
            return false;
        }
        if !self.managements.is_empty() && !self.managements.iter().any(|m| m == &inst.management) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.iter().any(|c| c == &inst.category) {
            return false;
        }
        if !self.name_keywords.is_empty() {
            let name = inst.name.to_ascii_uppercase();
            if !self
                .name_keywords
                .iter()
                .any(|k| name.contains(&k.to_ascii_uppercase()))
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ReferenceRecord {
    ts_code: String,
    name: String,
    asset_class: AssetClass,
    exchange: String,
    market: String,
    list_date: String,
    delist_date: String,
    management: String,
    category: String,
}

impl From<&Instrument> for ReferenceRecord {
    fn from(i: &Instrument) -> Self {
        let fmt = |d: Option<NaiveDate>| d.map(|d| d.format(DATE_FORMAT).to_string()).unwrap_or_default();
        ReferenceRecord {
            ts_code: i.code.clone(),
            name: i.name.clone(),
            asset_class: i.asset_class,
            exchange: i.exchange.clone(),
            market: i.market.clone(),
            list_date: fmt(i.list_date),
            delist_date: fmt(i.delist_date),
            management: i.management.clone(),
            category: i.category.clone(),
        }
    }
}

/// Parse a `YYYYMMDD` (or `YYYY-MM-DD`) date; empty means `None`.
pub fn parse_compact_date(s: &str) -> Result<Option<NaiveDate>, chrono::ParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let format = if s.contains('-') { "%Y-%m-%d" } else { DATE_FORMAT };
    NaiveDate::parse_from_str(s, format).map(Some)
}

/// In-memory instrument catalog, grouped by asset class in file order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    by_class: BTreeMap<AssetClass, Vec<Instrument>>,
}

impl Catalog {
    pub fn from_instruments(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        let mut by_class: BTreeMap<AssetClass, Vec<Instrument>> = BTreeMap::new();
        for inst in instruments {
            by_class.entry(inst.asset_class).or_default().push(inst);
        }
        Self { by_class }
    }

    pub fn reference_path(data_root: &Path, asset_class: AssetClass) -> PathBuf {
        data_root
            .join("reference")
            .join(format!("{}.csv", asset_class.as_str()))
    }

    /// Load every reference file under `data_root`. Missing files yield empty classes.
    pub fn load(data_root: &Path) -> Result<Self, CatalogError> {
        let mut by_class = BTreeMap::new();
        for class in AssetClass::ALL {
            let path = Self::reference_path(data_root, class);
            if !path.exists() {
                tracing::warn!(asset_class = %class, path = %path.display(), "reference list missing, run update-ref");
                continue;
            }
            by_class.insert(class, read_reference(&path)?);
        }
        Ok(Self { by_class })
    }

    /// Persist every class to its reference file.
    pub fn save(&self, data_root: &Path) -> Result<(), CatalogError> {
        for (class, instruments) in &self.by_class {
            write_reference(&Self::reference_path(data_root, *class), instruments)?;
        }
        Ok(())
    }

    /// Instruments of `asset_class` passing `filter`, truncated to `filter.limit`.
    pub fn list_instruments(&self, asset_class: AssetClass, filter: &CatalogFilter) -> Vec<Instrument> {
        let matching = self
            .by_class
            .get(&asset_class)
            .into_iter()
            .flatten()
            .filter(|i| filter.matches(i))
            .cloned();
        match filter.limit {
            Some(n) => matching.take(n).collect(),
            None => matching.collect(),
        }
    }

    pub fn find(&self, code: &str) -> Option<&Instrument> {
        self.by_class.values().flatten().find(|i| i.code == code)
    }

    pub fn len(&self, asset_class: AssetClass) -> usize {
        self.by_class.get(&asset_class).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.by_class.values().all(Vec::is_empty)
    }
}

fn read_reference(path: &Path) -> Result<Vec<Instrument>, CatalogError> {
    let format_err = |message: String| CatalogError::Format {
        path: path.to_path_buf(),
        message,
    };
    let mut reader = csv::Reader::from_path(path).map_err(|e| format_err(e.to_string()))?;
    let mut out = Vec::new();
    for record in reader.deserialize::<ReferenceRecord>() {
        let r = record.map_err(|e| format_err(e.to_string()))?;
        let list_date = parse_compact_date(&r.list_date)
            .map_err(|e| format_err(format!("{}: list_date '{}': {e}", r.ts_code, r.list_date)))?;
        let delist_date = parse_compact_date(&r.delist_date)
            .map_err(|e| format_err(format!("{}: delist_date '{}': {e}", r.ts_code, r.delist_date)))?;
        out.push(Instrument {
            code: r.ts_code,
            name: r.name,
            asset_class: r.asset_class,
            exchange: r.exchange,
            market: r.market,
            list_date,
            delist_date,
            active: delist_date.is_none(),
            management: r.management,
            category: r.category,
        });
    }
    Ok(out)
}

fn write_reference(path: &Path, instruments: &[Instrument]) -> Result<(), CatalogError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| CatalogError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    write_atomic(path, |tmp| {
        let csv_err = |e: csv::Error| StoreError::Csv {
            path: tmp.to_path_buf(),
            message: e.to_string(),
        };
        let mut writer = csv::Writer::from_path(tmp).map_err(csv_err)?;
        for inst in instruments {
            writer.serialize(ReferenceRecord::from(inst)).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| StoreError::Io {
            path: tmp.to_path_buf(),
            source,
        })
    })?;
    Ok(())
}

/// Outcome of a reference refresh. Classes that failed keep their previous file.
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub updated: Vec<(AssetClass, usize)>,
    pub failed: Vec<(AssetClass, CallFailure)>,
}

/// Download every reference list through the pacing gate and rewrite the
/// reference files. A failed class is logged and left as it was.
pub fn refresh_reference(
    provider: &dyn ReferenceProvider,
    limiter: &RateLimiter,
    attempts: u32,
    data_root: &Path,
) -> Result<RefreshReport, CatalogError> {
    let mut report = RefreshReport::default();
    for class in AssetClass::ALL {
        let label = format!("reference:{class}");
        match limiter.call(attempts, &label, || provider.list_reference(class)) {
            Ok(instruments) => {
                write_reference(&Catalog::reference_path(data_root, class), &instruments)?;
                tracing::info!(asset_class = %class, count = instruments.len(), "reference list updated");
                report.updated.push((class, instruments.len()));
            }
            Err(failure) => {
                tracing::error!(asset_class = %class, error = %failure, "reference list update failed");
                report.failed.push((class, failure));
            }
        }
    }
    Ok(report)
}
