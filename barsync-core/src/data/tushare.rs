//! Tushare Pro data provider.
//!
//! Every endpoint is a JSON POST of `{api_name, token, params, fields}` that
//! answers `{code, msg, data: {fields, items}}`. Items are positional rows
//! matching `fields`.
//!
//! One `fetch` performs exactly one logical attempt. Daily equity and fund
//! bars need a second request for adjustment factors; that request waits on
//! the shared pacing gate when one is attached.

use super::catalog::parse_compact_date;
use super::pacing::RateLimiter;
use super::provider::{BarProvider, ProviderError, ReferenceProvider};
use crate::domain::{day_start, exchange_from_code, AssetClass, BarRow, Frequency, Instrument, Window};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_URL: &str = "http://api.tushare.pro";

const TOKEN_INVALID: i64 = 40101;

const DAILY_FIELDS: &str = "ts_code,trade_date,open,high,low,close,pre_close,change,pct_chg,vol,amount";
const FACTOR_FIELDS: &str = "ts_code,trade_date,adj_factor";
const MINUTE_FIELDS: &str = "ts_code,trade_time,open,close,high,low,vol,amount";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    data: Option<ApiTable>,
}

/// Positional result table.
#[derive(Debug, Default, Deserialize)]
struct ApiTable {
    fields: Vec<String>,
    items: Vec<Vec<Value>>,
}

impl ApiTable {
    fn index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    fn require(&self, name: &str) -> Result<usize, ProviderError> {
        self.index(name)
            .ok_or_else(|| ProviderError::ResponseFormat(format!("missing field '{name}'")))
    }
}

fn cell_str(row: &[Value], idx: Option<usize>) -> Option<String> {
    match row.get(idx?)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn cell_f64(row: &[Value], idx: Option<usize>) -> Option<f64> {
    match row.get(idx?)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn cell_date(row: &[Value], idx: Option<usize>) -> Result<Option<NaiveDate>, ProviderError> {
    match cell_str(row, idx) {
        Some(s) => parse_compact_date(&s)
            .map_err(|e| ProviderError::ResponseFormat(format!("bad date '{s}': {e}"))),
        None => Ok(None),
    }
}

/// Map an API-level error code and message onto the provider error taxonomy.
fn classify_api_error(api: &str, code: i64, msg: &str) -> ProviderError {
    let lower = msg.to_lowercase();
    if code == TOKEN_INVALID || lower.contains("token") {
        ProviderError::AuthenticationRequired(msg.to_string())
    } else if msg.contains("每分钟") || msg.contains("最多访问") || lower.contains("rate limit") {
        ProviderError::RateLimited(msg.to_string())
    } else if msg.contains("权限") || lower.contains("permission") {
        ProviderError::PermissionDenied {
            api: api.to_string(),
            message: msg.to_string(),
        }
    } else {
        ProviderError::Api {
            code,
            message: msg.to_string(),
        }
    }
}

/// Blocking Tushare client.
pub struct TushareClient {
    client: reqwest::blocking::Client,
    url: String,
    token: String,
    pacer: Option<Arc<RateLimiter>>,
}

impl TushareClient {
    pub fn new(token: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NetworkUnreachable(format!("failed to build HTTP client: {e}")))?;
        let url = url.into();
        Ok(Self {
            client,
            url: if url.trim().is_empty() { DEFAULT_URL.to_string() } else { url },
            token: token.into(),
            pacer: None,
        })
    }

    /// Route follow-up requests within one fetch through `pacer`.
    pub fn with_pacer(mut self, pacer: Arc<RateLimiter>) -> Self {
        self.pacer = Some(pacer);
        self
    }

    fn query(&self, api_name: &str, params: Value, fields: &str) -> Result<ApiTable, ProviderError> {
        let body = json!({
            "api_name": api_name,
            "token": self.token,
            "params": params,
            "fields": fields,
        });

        let resp = self.client.post(&self.url).json(&body).send().map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::NetworkUnreachable(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited(format!("HTTP {status}")));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationRequired(format!("HTTP {status}")));
        }
        if status.is_server_error() {
            return Err(ProviderError::Server {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::ResponseFormat(format!("unexpected HTTP {status} from {api_name}")));
        }

        let parsed: ApiResponse = resp
            .json()
            .map_err(|e| ProviderError::ResponseFormat(format!("failed to parse {api_name} response: {e}")))?;
        decode_response(api_name, parsed)
    }

    fn daily(&self, instrument: &Instrument, window: Window) -> Result<Vec<BarRow>, ProviderError> {
        let (bars_api, factor_api) = match instrument.asset_class {
            AssetClass::Equity => ("daily", Some("adj_factor")),
            AssetClass::Fund => ("fund_daily", Some("fund_adj")),
            AssetClass::Index => ("index_daily", None),
        };
        let params = json!({
            "ts_code": instrument.code,
            "start_date": window.start.format("%Y%m%d").to_string(),
            "end_date": window.end.format("%Y%m%d").to_string(),
        });

        let table = self.query(bars_api, params.clone(), DAILY_FIELDS)?;
        if table.items.is_empty() {
            return Ok(Vec::new());
        }
        let factors = match factor_api {
            Some(api) => {
                if let Some(pacer) = &self.pacer {
                    pacer.wait_turn();
                }
                parse_factors(&self.query(api, params, FACTOR_FIELDS)?)?
            }
            None => HashMap::new(),
        };
        parse_daily(&instrument.code, &table, &factors)
    }

    fn minutes(&self, instrument: &Instrument, frequency: Frequency, window: Window) -> Result<Vec<BarRow>, ProviderError> {
        let interval = frequency
            .provider_interval()
            .ok_or_else(|| ProviderError::ResponseFormat(format!("{frequency} has no intraday interval")))?;
        let params = json!({
            "ts_code": instrument.code,
            "freq": interval,
            "start_date": format!("{} 09:00:00", window.start.format("%Y-%m-%d")),
            "end_date": format!("{} 19:00:00", window.end.format("%Y-%m-%d")),
        });
        let table = self.query("stk_mins", params, MINUTE_FIELDS)?;
        let rows = parse_minutes(&instrument.code, &table)?;
        if frequency.row_cap().is_some_and(|cap| rows.len() >= cap) {
            tracing::warn!(code = %instrument.code, %window, rows = rows.len(), "window hit the provider row cap");
        }
        Ok(rows)
    }
}

impl BarProvider for TushareClient {
    fn name(&self) -> &str {
        "tushare"
    }

    fn fetch(&self, instrument: &Instrument, frequency: Frequency, window: Window) -> Result<Vec<BarRow>, ProviderError> {
        if frequency.is_intraday() {
            self.minutes(instrument, frequency, window)
        } else {
            self.daily(instrument, window)
        }
    }
}

impl ReferenceProvider for TushareClient {
    fn list_reference(&self, asset_class: AssetClass) -> Result<Vec<Instrument>, ProviderError> {
        match asset_class {
            AssetClass::Equity => {
                let table = self.query(
                    "stock_basic",
                    json!({ "exchange": "", "list_status": "L" }),
                    "ts_code,name,market,exchange,list_date,delist_date",
                )?;
                parse_reference(AssetClass::Equity, &table)
            }
            AssetClass::Fund => {
                let table = self.query(
                    "fund_basic",
                    json!({ "market": "E" }),
                    "ts_code,name,management,fund_type,market,list_date,delist_date",
                )?;
                parse_reference(AssetClass::Fund, &table)
            }
            AssetClass::Index => {
                let mut all = Vec::new();
                for (i, market) in ["SSE", "SZSE"].into_iter().enumerate() {
                    if let (Some(pacer), true) = (&self.pacer, i > 0) {
                        pacer.wait_turn();
                    }
                    let table = self.query(
                        "index_basic",
                        json!({ "market": market }),
                        "ts_code,name,market,category,list_date",
                    )?;
                    all.extend(parse_reference(AssetClass::Index, &table)?);
                }
                Ok(all)
            }
        }
    }
}

fn decode_response(api_name: &str, resp: ApiResponse) -> Result<ApiTable, ProviderError> {
    if resp.code != 0 {
        return Err(classify_api_error(api_name, resp.code, resp.msg.as_deref().unwrap_or_default()));
    }
    Ok(resp.data.unwrap_or_default())
}

fn parse_factors(table: &ApiTable) -> Result<HashMap<NaiveDate, f64>, ProviderError> {
    let date_idx = table.require("trade_date")?;
    let factor_idx = table.require("adj_factor")?;
    let mut out = HashMap::with_capacity(table.items.len());
    for row in &table.items {
        if let (Some(date), Some(factor)) = (cell_date(row, Some(date_idx))?, cell_f64(row, Some(factor_idx))) {
            out.insert(date, factor);
        }
    }
    Ok(out)
}

fn parse_daily(code: &str, table: &ApiTable, factors: &HashMap<NaiveDate, f64>) -> Result<Vec<BarRow>, ProviderError> {
    let date_idx = table.require("trade_date")?;
    let open = table.require("open")?;
    let high = table.require("high")?;
    let low = table.require("low")?;
    let close = table.require("close")?;
    let (vol, amount) = (table.index("vol"), table.index("amount"));
    let (pre_close, change, pct_chg) = (table.index("pre_close"), table.index("change"), table.index("pct_chg"));

    let mut rows = Vec::with_capacity(table.items.len());
    for row in &table.items {
        let Some(date) = cell_date(row, Some(date_idx))? else {
            return Err(ProviderError::ResponseFormat(format!("{code}: row without trade_date")));
        };
        let mut bar = BarRow::new(
            code,
            day_start(date),
            cell_f64(row, Some(open)).unwrap_or(f64::NAN),
            cell_f64(row, Some(high)).unwrap_or(f64::NAN),
            cell_f64(row, Some(low)).unwrap_or(f64::NAN),
            cell_f64(row, Some(close)).unwrap_or(f64::NAN),
            cell_f64(row, vol).unwrap_or(0.0),
            cell_f64(row, amount).unwrap_or(0.0),
        );
        bar.pre_close = cell_f64(row, pre_close);
        bar.change = cell_f64(row, change);
        bar.pct_chg = cell_f64(row, pct_chg);
        bar.adj_factor = factors.get(&date).copied();
        rows.push(bar);
    }
    Ok(rows)
}

fn parse_minutes(code: &str, table: &ApiTable) -> Result<Vec<BarRow>, ProviderError> {
    let time_idx = table.require("trade_time")?;
    let open = table.require("open")?;
    let high = table.require("high")?;
    let low = table.require("low")?;
    let close = table.require("close")?;
    let (vol, amount) = (table.index("vol"), table.index("amount"));

    table
        .items
        .iter()
        .map(|row| {
            let raw = cell_str(row, Some(time_idx))
                .ok_or_else(|| ProviderError::ResponseFormat(format!("{code}: row without trade_time")))?;
            let time = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S")
                .map_err(|e| ProviderError::ResponseFormat(format!("bad trade_time '{raw}': {e}")))?;
            Ok(BarRow::new(
                code,
                time,
                cell_f64(row, Some(open)).unwrap_or(f64::NAN),
                cell_f64(row, Some(high)).unwrap_or(f64::NAN),
                cell_f64(row, Some(low)).unwrap_or(f64::NAN),
                cell_f64(row, Some(close)).unwrap_or(f64::NAN),
                cell_f64(row, vol).unwrap_or(0.0),
                cell_f64(row, amount).unwrap_or(0.0),
            ))
        })
        .collect()
}

fn parse_reference(asset_class: AssetClass, table: &ApiTable) -> Result<Vec<Instrument>, ProviderError> {
    let code_idx = table.require("ts_code")?;
    let name = table.index("name");
    let market = table.index("market");
    let exchange = table.index("exchange");
    let list_date = table.index("list_date");
    let delist_date = table.index("delist_date");
    let management = table.index("management");
    let category = table.index("fund_type").or_else(|| table.index("category"));

    let mut out = Vec::with_capacity(table.items.len());
    for row in &table.items {
        let Some(code) = cell_str(row, Some(code_idx)) else {
            continue;
        };
        let mut inst = Instrument::new(code, asset_class, cell_date(row, list_date)?);
        if let Some(n) = cell_str(row, name) {
            inst.name = n;
        }
        inst.market = cell_str(row, market).unwrap_or_default();
        if let Some(ex) = cell_str(row, exchange).filter(|e| !e.is_empty()) {
            inst.exchange = ex;
        } else if inst.exchange.is_empty() {
            inst.exchange = exchange_from_code(&inst.code).unwrap_or_default().to_string();
        }
        inst.delist_date = cell_date(row, delist_date)?;
        inst.active = inst.delist_date.is_none();
        inst.management = cell_str(row, management).unwrap_or_default();
        inst.category = cell_str(row, category).unwrap_or_default();
        out.push(inst);
    }
    Ok(out)
}
