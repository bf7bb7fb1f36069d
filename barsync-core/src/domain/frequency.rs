//! Bar granularity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Per-call row cap the upstream applies to intraday requests.
pub const INTRADAY_ROW_CAP: usize = 8000;

/// Bar granularity. Determines the row schema, the storage format and
/// whether date ranges must be split before calling the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    #[serde(rename = "minute_1")]
    Minute1,
    #[serde(rename = "minute_5")]
    Minute5,
    #[serde(rename = "minute_15")]
    Minute15,
    #[serde(rename = "minute_30")]
    Minute30,
    #[serde(rename = "minute_60")]
    Minute60,
}

/// On-disk encoding of a stored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    Csv,
    Parquet,
}

impl StorageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            StorageFormat::Csv => "csv",
            StorageFormat::Parquet => "parquet",
        }
    }
}

impl Frequency {
    pub const ALL: [Frequency; 6] = [
        Frequency::Daily,
        Frequency::Minute1,
        Frequency::Minute5,
        Frequency::Minute15,
        Frequency::Minute30,
        Frequency::Minute60,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Minute1 => "minute_1",
            Frequency::Minute5 => "minute_5",
            Frequency::Minute15 => "minute_15",
            Frequency::Minute30 => "minute_30",
            Frequency::Minute60 => "minute_60",
        }
    }

    pub fn is_intraday(&self) -> bool {
        !matches!(self, Frequency::Daily)
    }

    /// Provider-side interval name for intraday calls (`1min`, `5min`, ...).
    pub fn provider_interval(&self) -> Option<&'static str> {
        match self {
            Frequency::Daily => None,
            Frequency::Minute1 => Some("1min"),
            Frequency::Minute5 => Some("5min"),
            Frequency::Minute15 => Some("15min"),
            Frequency::Minute30 => Some("30min"),
            Frequency::Minute60 => Some("60min"),
        }
    }

    /// Maximum rows a single provider call returns, if capped.
    pub fn row_cap(&self) -> Option<usize> {
        self.is_intraday().then_some(INTRADAY_ROW_CAP)
    }

    /// Daily tables are small and kept as CSV; intraday tables go to Parquet.
    pub fn storage_format(&self) -> StorageFormat {
        if self.is_intraday() {
            StorageFormat::Parquet
        } else {
            StorageFormat::Csv
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = FrequencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "d" | "1d" => Ok(Frequency::Daily),
            "minute_1" | "1min" => Ok(Frequency::Minute1),
            "minute_5" | "5min" => Ok(Frequency::Minute5),
            "minute_15" | "15min" => Ok(Frequency::Minute15),
            "minute_30" | "30min" => Ok(Frequency::Minute30),
            "minute_60" | "60min" => Ok(Frequency::Minute60),
            other => Err(FrequencyError(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown frequency '{0}' (expected daily, minute_1, minute_5, minute_15, minute_30 or minute_60)")]
pub struct FrequencyError(pub String);
