//! Sync configuration, loaded from TOML.
//!
//! Everything a run needs is carried in one [`SyncConfig`] value that is passed
//! down explicitly; nothing reads global state.

use crate::data::CatalogFilter;
use crate::data::catalog::parse_compact_date;
use crate::domain::{AssetClass, DateRange, Frequency};
use chrono::{Duration as Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Token value written by `init-config`; a run refuses to start with it.
pub const PLACEHOLDER_TOKEN: &str = "your_tushare_token_here";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the planner chooses each job's start date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Always request the whole configured range.
    Full,
    /// Resume from the day after the last synced date.
    #[default]
    Incremental,
    /// Incremental, with per-asset-class catalog filters and range overrides.
    Custom,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateMode::Full => "full",
            UpdateMode::Incremental => "incremental",
            UpdateMode::Custom => "custom",
        })
    }
}

impl FromStr for UpdateMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(UpdateMode::Full),
            "incremental" => Ok(UpdateMode::Incremental),
            "custom" => Ok(UpdateMode::Custom),
            other => Err(ConfigError::Invalid(format!(
                "unknown update mode '{other}' (expected full, incremental or custom)"
            ))),
        }
    }
}

/// A configured date: a fixed day, or `"auto"` (resolved at run time).
///
/// Serialized as `"YYYYMMDD"` or `"auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DateSetting {
    Auto,
    Fixed(NaiveDate),
}

impl DateSetting {
    pub fn fixed(&self) -> Option<NaiveDate> {
        match self {
            DateSetting::Auto => None,
            DateSetting::Fixed(d) => Some(*d),
        }
    }
}

impl TryFrom<String> for DateSetting {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(DateSetting::Auto);
        }
        match parse_compact_date(&s) {
            Ok(Some(d)) => Ok(DateSetting::Fixed(d)),
            Ok(None) => Err("empty date (use \"auto\" or YYYYMMDD)".to_string()),
            Err(e) => Err(format!("bad date '{s}': {e}")),
        }
    }
}

impl From<DateSetting> for String {
    fn from(d: DateSetting) -> String {
        match d {
            DateSetting::Auto => "auto".to_string(),
            DateSetting::Fixed(d) => d.format("%Y%m%d").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub token: String,
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            token: PLACEHOLDER_TOKEN.to_string(),
            url: crate::data::tushare::DEFAULT_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Minimum delay between any two upstream calls.
    pub sleep_ms: u64,
    /// Attempts per upstream call.
    pub retry: u32,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self { sleep_ms: 120, retry: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateRangeConfig {
    pub update_mode: UpdateMode,
    pub default_start_date: DateSetting,
    pub default_end_date: DateSetting,
    /// Span used when the start date is `"auto"`.
    pub lookback_days: u32,
    /// Cap on instruments per asset class.
    pub limits: Option<usize>,
}

impl Default for DateRangeConfig {
    fn default() -> Self {
        Self {
            update_mode: UpdateMode::Incremental,
            default_start_date: DateSetting::Fixed(NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default()),
            default_end_date: DateSetting::Auto,
            lookback_days: 1800,
            limits: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Per-asset-class settings honoured in custom mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomAssetConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub exchanges: Vec<String>,
    #[serde(default)]
    pub markets: Vec<String>,
    /// Only instruments listed on or before this date.
    #[serde(default)]
    pub min_list_date: Option<DateSetting>,
    /// Drop instruments delisted before this date.
    #[serde(default)]
    pub delist_date: Option<DateSetting>,
    #[serde(default = "default_true")]
    pub exclude_st: bool,
    #[serde(default = "default_true")]
    pub exclude_delisted: bool,
    #[serde(default)]
    pub managements: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub name_keywords: Vec<String>,
    #[serde(default)]
    pub limits: Option<usize>,
    #[serde(default)]
    pub start_date: Option<DateSetting>,
    #[serde(default)]
    pub end_date: Option<DateSetting>,
    #[serde(default)]
    pub frequencies: Vec<Frequency>,
}

impl Default for CustomAssetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exchanges: Vec::new(),
            markets: Vec::new(),
            min_list_date: None,
            delist_date: None,
            exclude_st: true,
            exclude_delisted: true,
            managements: Vec::new(),
            categories: Vec::new(),
            name_keywords: Vec::new(),
            limits: None,
            start_date: None,
            end_date: None,
            frequencies: Vec::new(),
        }
    }
}

/// Top-level configuration for a sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub data_root: PathBuf,
    pub log_level: String,
    /// Worker pool size.
    pub threads: usize,
    pub frequencies: Vec<Frequency>,
    pub provider: ProviderConfig,
    pub pacing: PacingConfig,
    pub date_ranges: DateRangeConfig,
    /// Keyed by asset class name (`equity`, `fund`, `index`, or an alias such as `stocks`).
    pub custom: BTreeMap<String, CustomAssetConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            log_level: "info".to_string(),
            threads: 4,
            frequencies: vec![Frequency::Daily],
            provider: ProviderConfig::default(),
            pacing: PacingConfig::default(),
            date_ranges: DateRangeConfig::default(),
            custom: BTreeMap::new(),
        }
    }
}

impl SyncConfig {
    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Template written by `init-config`: defaults plus one example custom block per class.
    pub fn template() -> Self {
        let mut config = Self::default();
        for class in AssetClass::ALL {
            config.custom.insert(class.as_str().to_string(), CustomAssetConfig::default());
        }
        if let Some(funds) = config.custom.get_mut(AssetClass::Fund.as_str()) {
            funds.name_keywords = vec!["ETF".to_string()];
        }
        config
    }

    /// Checks that must pass before any upstream call is made.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let token = self.provider.token.trim();
        if token.is_empty() || token == PLACEHOLDER_TOKEN {
            return Err(ConfigError::Invalid("provider.token is not set".into()));
        }
        if self.threads == 0 {
            return Err(ConfigError::Invalid("threads must be at least 1".into()));
        }
        if self.pacing.retry == 0 {
            return Err(ConfigError::Invalid("pacing.retry must be at least 1".into()));
        }
        if self.frequencies.is_empty() {
            return Err(ConfigError::Invalid("at least one frequency is required".into()));
        }
        if let (Some(start), Some(end)) = (
            self.date_ranges.default_start_date.fixed(),
            self.date_ranges.default_end_date.fixed(),
        ) {
            if start > end {
                return Err(ConfigError::Invalid(format!(
                    "default_start_date {start} is after default_end_date {end}"
                )));
            }
        }
        Ok(())
    }

    pub fn mode(&self) -> UpdateMode {
        self.date_ranges.update_mode
    }

    /// Minimum delay between upstream calls.
    pub fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing.sleep_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.timeout_secs)
    }

    fn custom_block(&self, asset_class: AssetClass) -> Option<&CustomAssetConfig> {
        match self.mode() {
            UpdateMode::Custom => self
                .custom
                .iter()
                .find(|(key, _)| key.parse::<AssetClass>().ok() == Some(asset_class))
                .map(|(_, block)| block),
            _ => None,
        }
    }

    /// Whether the asset class takes part in the run.
    pub fn is_enabled(&self, asset_class: AssetClass) -> bool {
        self.custom_block(asset_class).map_or(true, |c| c.enabled)
    }

    /// Frequencies to sync for an asset class.
    pub fn frequencies_for(&self, asset_class: AssetClass) -> Vec<Frequency> {
        match self.custom_block(asset_class) {
            Some(c) if !c.frequencies.is_empty() => c.frequencies.clone(),
            _ => self.frequencies.clone(),
        }
    }

    /// Catalog predicates for an asset class. Outside custom mode only the global limit applies.
    pub fn filter_for(&self, asset_class: AssetClass, today: NaiveDate) -> CatalogFilter {
        let resolve = |d: Option<DateSetting>| d.map(|d| d.fixed().unwrap_or(today));
        match self.custom_block(asset_class) {
            Some(c) => CatalogFilter {
                exchanges: c.exchanges.clone(),
                markets: c.markets.clone(),
                listed_on_or_before: resolve(c.min_list_date),
                delisted_on_or_after: resolve(c.delist_date),
                exclude_special_treatment: c.exclude_st,
                exclude_delisted: c.exclude_delisted,
                managements: c.managements.clone(),
                categories: c.categories.clone(),
                name_keywords: c.name_keywords.clone(),
                limit: c.limits.or(self.date_ranges.limits),
            },
            None => CatalogFilter {
                limit: self.date_ranges.limits,
                ..CatalogFilter::default()
            },
        }
    }

    /// The configured `[start, end]` for an asset class, with `"auto"` resolved against `today`.
    ///
    /// An `"auto"` start means `lookback_days` before the end. Custom blocks may
    /// override either bound.
    pub fn configured_range(&self, asset_class: AssetClass, today: NaiveDate) -> DateRange {
        let custom = self.custom_block(asset_class);
        let start = custom
            .and_then(|c| c.start_date)
            .unwrap_or(self.date_ranges.default_start_date);
        let end = custom
            .and_then(|c| c.end_date)
            .unwrap_or(self.date_ranges.default_end_date);

        let end = end.fixed().unwrap_or(today);
        let start = start
            .fixed()
            .unwrap_or_else(|| end - Days::days(i64::from(self.date_ranges.lookback_days)));
        DateRange::new(start, end)
    }
}
