use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Asset class of a tradable instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    Fund,
    Index,
}

impl AssetClass {
    pub const ALL: [AssetClass; 3] = [AssetClass::Equity, AssetClass::Fund, AssetClass::Index];

    /// Stable lowercase name, used in config keys and reference file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Equity => "equity",
            AssetClass::Fund => "fund",
            AssetClass::Index => "index",
        }
    }

    /// Directory under `{data_root}/data/` holding this class's tables.
    pub fn data_dir(&self) -> &'static str {
        match self {
            AssetClass::Equity => "equities",
            AssetClass::Fund => "funds",
            AssetClass::Index => "indices",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "equity" | "equities" | "stock" | "stocks" => Ok(AssetClass::Equity),
            "fund" | "funds" | "etf" => Ok(AssetClass::Fund),
            "index" | "indices" => Ok(AssetClass::Index),
            other => Err(InstrumentError::UnknownAssetClass(other.to_string())),
        }
    }
}

/// A tradable instrument as loaded from the reference catalog.
///
/// `code` is exchange-qualified (`600000.SH`, `159915.SZ`). Instruments are
/// immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub code: String,
    pub name: String,
    pub asset_class: AssetClass,
    pub exchange: String,
    /// Board / market segment (main board, ChiNext, STAR, ...). Empty when unknown.
    pub market: String,
    pub list_date: Option<NaiveDate>,
    pub delist_date: Option<NaiveDate>,
    pub active: bool,
    /// Fund management company. Empty for non-funds.
    pub management: String,
    /// Fund or index category. Empty when unknown.
    pub category: String,
}

impl Instrument {
    /// Minimal instrument with only identity and listing date filled in.
    pub fn new(code: impl Into<String>, asset_class: AssetClass, list_date: Option<NaiveDate>) -> Self {
        let code = code.into();
        let exchange = exchange_from_code(&code).unwrap_or_default().to_string();
        Self {
            name: code.clone(),
            code,
            asset_class,
            exchange,
            market: String::new(),
            list_date,
            delist_date: None,
            active: true,
            management: String::new(),
            category: String::new(),
        }
    }

    /// Special-treatment flag: the exchange marks distressed listings with `ST` / `*ST`.
    pub fn is_special_treatment(&self) -> bool {
        self.name.contains("ST")
    }

    /// True when the instrument was listed after `date`.
    pub fn listed_after(&self, date: NaiveDate) -> bool {
        self.list_date.is_some_and(|listed| listed > date)
    }
}

/// Map the code suffix to an exchange name.
pub fn exchange_from_code(code: &str) -> Option<&'static str> {
    match code.rsplit_once('.')?.1 {
        "SH" => Some("SSE"),
        "SZ" => Some("SZSE"),
        "BJ" => Some("BSE"),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("unknown asset class '{0}' (expected equity, fund or index)")]
    UnknownAssetClass(String),
}
