//! Archive status: which instruments have tables, how far each is synced.

use crate::data::{Catalog, CatalogFilter, StoreError, SyncStateStore, TableStore};
use crate::domain::{AssetClass, Frequency};
use chrono::NaiveDateTime;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
pub struct TableStatus {
    pub code: String,
    pub rows: Option<usize>,
    pub first_time: Option<NaiveDateTime>,
    pub last_time: Option<NaiveDateTime>,
    pub last_synced: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub asset_class: AssetClass,
    pub frequency: Frequency,
    /// Instruments the catalog lists for the class.
    pub catalog_total: usize,
    /// Catalog instruments with no stored table.
    pub missing: Vec<String>,
    /// Every stored table, catalogued or not.
    pub tables: Vec<TableStatus>,
}

impl StatusReport {
    pub fn stored(&self) -> usize {
        self.tables.len()
    }

    /// Share of catalog instruments with a table, in percent.
    pub fn coverage_pct(&self) -> f64 {
        if self.catalog_total == 0 {
            return 0.0;
        }
        let covered = self.catalog_total - self.missing.len();
        covered as f64 * 100.0 / self.catalog_total as f64
    }
}

pub fn status(
    store: &TableStore,
    states: &SyncStateStore,
    catalog: &Catalog,
    asset_class: AssetClass,
    frequency: Frequency,
) -> Result<StatusReport, StoreError> {
    let codes = store.list_codes(asset_class, frequency)?;
    let stored: HashSet<&str> = codes.iter().map(String::as_str).collect();

    let listed = catalog.list_instruments(asset_class, &CatalogFilter::default());
    let missing = listed
        .iter()
        .filter(|i| !stored.contains(i.code.as_str()))
        .map(|i| i.code.clone())
        .collect();

    let tables = codes
        .iter()
        .map(|code| {
            let meta = store.read_meta(asset_class, frequency, code);
            TableStatus {
                code: code.clone(),
                rows: meta.as_ref().map(|m| m.row_count),
                first_time: meta.as_ref().and_then(|m| m.first_time),
                last_time: meta.as_ref().and_then(|m| m.last_time),
                last_synced: states.load(code, frequency).map(|s| s.last_synced),
            }
        })
        .collect();

    Ok(StatusReport {
        asset_class,
        frequency,
        catalog_total: listed.len(),
        missing,
        tables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{day_start, BarRow, Instrument};
    use chrono::NaiveDate;

    #[test]
    fn reports_missing_and_synced_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let states = SyncStateStore::new(dir.path());
        let catalog = Catalog::from_instruments(vec![
            Instrument::new("600000.SH", AssetClass::Equity, None),
            Instrument::new("600004.SH", AssetClass::Equity, None),
        ]);

        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let row = BarRow::new("600000.SH", day_start(date), 1.0, 1.0, 1.0, 1.0, 1.0, 1.0);
        store
            .merge_write(AssetClass::Equity, Frequency::Daily, "600000.SH", vec![row], None)
            .unwrap();
        states.save("600000.SH", Frequency::Daily, day_start(date)).unwrap();

        let report = status(&store, &states, &catalog, AssetClass::Equity, Frequency::Daily).unwrap();
        assert_eq!(report.catalog_total, 2);
        assert_eq!(report.stored(), 1);
        assert_eq!(report.missing, vec!["600004.SH"]);
        assert_eq!(report.tables[0].rows, Some(1));
        assert_eq!(report.tables[0].last_synced, Some(day_start(date)));
        assert_eq!(report.coverage_pct(), 50.0);
    }
}
