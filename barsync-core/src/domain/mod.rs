//! Domain types for the bar archive

pub mod bar;
pub mod frequency;
pub mod instrument;
pub mod sync_state;

pub use bar::{day_start, dedup_sorted_desc, BarRow};
pub use frequency::{Frequency, FrequencyError, StorageFormat, INTRADAY_ROW_CAP};
pub use instrument::{exchange_from_code, AssetClass, Instrument, InstrumentError};
pub use sync_state::{DateRange, DownloadJob, SyncState, Window, SESSION_CLOSE_HOUR};
