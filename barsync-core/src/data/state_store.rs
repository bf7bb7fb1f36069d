//! Durable per-pair sync checkpoints.
//!
//! Layout: `{data_root}/meta/last_sync/{frequency}/{code}.json`
//!
//! Each (instrument, frequency) pair has its own file, so concurrent jobs never
//! write the same record. Records are replaced atomically.

use super::store::{write_atomic, StoreError};
use crate::domain::{Frequency, SyncState};
use chrono::NaiveDateTime;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SyncStateStore {
    dir: PathBuf,
}

impl SyncStateStore {
    pub fn new(data_root: impl AsRef<Path>) -> Self {
        Self {
            dir: data_root.as_ref().join("meta").join("last_sync"),
        }
    }

    fn path(&self, code: &str, frequency: Frequency) -> PathBuf {
        self.dir.join(frequency.as_str()).join(format!("{code}.json"))
    }

    /// The stored checkpoint, or `None` if the pair has never synced.
    ///
    /// An unreadable record is treated as absent and logged; the next run then
    /// requests the full configured range and the merge absorbs the overlap.
    pub fn load(&self, code: &str, frequency: Frequency) -> Option<SyncState> {
        let path = self.path(code, frequency);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable sync state");
                None
            }
        }
    }

    /// Record `last_synced`, the newest stored bar timestamp, for the pair.
    pub fn save(
        &self,
        code: &str,
        frequency: Frequency,
        last_synced: NaiveDateTime,
    ) -> Result<SyncState, StoreError> {
        let state = SyncState {
            code: code.to_string(),
            frequency,
            last_synced,
            updated_at: chrono::Local::now().naive_local(),
        };
        let path = self.path(code, frequency);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_vec_pretty(&state).map_err(|e| StoreError::Meta {
            path: path.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&path, |tmp| {
            fs::write(tmp, &json).map_err(|source| StoreError::Io {
                path: tmp.to_path_buf(),
                source,
            })
        })?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, day: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, day).unwrap().and_hms_opt(h, min, 0).unwrap()
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStateStore::new(dir.path());
        let date = at(2024, 6, 28, 0, 0);

        assert!(store.load("600000.SH", Frequency::Daily).is_none());
        store.save("600000.SH", Frequency::Daily, date).unwrap();

        let state = store.load("600000.SH", Frequency::Daily).unwrap();
        assert_eq!(state.last_synced, date);
        assert_eq!(state.frequency, Frequency::Daily);
        assert!(dir.path().join("meta/last_sync/daily/600000.SH.json").is_file());
        // Other frequencies are independent.
        assert!(store.load("600000.SH", Frequency::Minute1).is_none());
    }

    #[test]
    fn overwrite_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStateStore::new(dir.path());
        let d1 = at(2024, 1, 2, 15, 0);
        let d2 = at(2024, 1, 3, 10, 35);
        store.save("000001.SZ", Frequency::Minute5, d1).unwrap();
        store.save("000001.SZ", Frequency::Minute5, d2).unwrap();
        assert_eq!(store.load("000001.SZ", Frequency::Minute5).unwrap().last_synced, d2);
    }

    #[test]
    fn garbage_record_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStateStore::new(dir.path());
        let path = dir.path().join("meta/last_sync/daily");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("600000.SH.json"), b"{ not json").unwrap();
        assert!(store.load("600000.SH", Frequency::Daily).is_none());
    }
}
