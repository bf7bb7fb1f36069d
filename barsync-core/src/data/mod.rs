//! Provider access, windowed fetching, adjustment and persistence.

pub mod adjust;
pub mod catalog;
pub mod fetcher;
pub mod pacing;
pub mod provider;
pub mod state_store;
pub mod store;
pub mod tushare;
pub mod window;

pub use adjust::{adjust, recover_anchor, Adjusted};
pub use catalog::{refresh_reference, Catalog, CatalogError, CatalogFilter, RefreshReport, MAJOR_INDICES};
pub use fetcher::{fetch_all, FetchFailure};
pub use pacing::{CallFailure, RateLimiter};
pub use provider::{BarProvider, ProviderError, ReferenceProvider};
pub use state_store::SyncStateStore;
pub use store::{StoreError, TableMeta, TableStore, WriteFailure, WriteSummary};
pub use tushare::TushareClient;
pub use window::split;
