//! Upstream provider traits and structured error types.
//!
//! The `BarProvider` trait abstracts over the remote bar API so the engine can
//! be driven by the Tushare client in production and by scripted mocks in tests.
//! Providers perform exactly one attempt per call; pacing and retries live in
//! [`crate::data::pacing`].

use crate::domain::{AssetClass, BarRow, Frequency, Instrument, Window};
use thiserror::Error;

/// Errors a single provider call can raise.
///
/// Every variant except a rejected token is retried by the rate limiter.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("provider server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("permission denied for '{api}': {message}")]
    PermissionDenied { api: String, message: String },

    #[error("response format changed: {0}")]
    ResponseFormat(String),

    #[error("provider error {code}: {message}")]
    Api { code: i64, message: String },
}

impl ProviderError {
    /// Whether another attempt is worth making.
    ///
    /// A missing or rejected token fails every attempt the same way; anything
    /// else (including a truncated or garbled body) may clear on the next try.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::AuthenticationRequired(_))
    }
}

/// Remote bar-data API.
///
/// `fetch` returns the rows for one window in whatever order the provider
/// produces; the fetcher normalizes ordering and duplicates. Daily rows should
/// carry the raw adjustment factor when the provider has one.
pub trait BarProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch bars for `instrument` at `frequency` over the inclusive `window`.
    fn fetch(
        &self,
        instrument: &Instrument,
        frequency: Frequency,
        window: Window,
    ) -> Result<Vec<BarRow>, ProviderError>;
}

/// Source of instrument reference lists.
pub trait ReferenceProvider: Send + Sync {
    /// All instruments of an asset class the provider knows about.
    fn list_reference(&self, asset_class: AssetClass) -> Result<Vec<Instrument>, ProviderError>;
}
