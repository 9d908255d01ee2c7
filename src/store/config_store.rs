//! Persisted repository of config entries.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::models::{ConfigRecord, EnabledStatus, StatusTransition};

use super::file::{ReadOutcome, RetryPolicy, TableFile};
use super::table::{RowError, Table};
use super::{LoadOutcome, StoreError};

/// Column order of a freshly created config file.
pub const CONFIG_COLUMNS: &[&str] = &[
    "id",
    "pair",
    "threshold_price",
    "threshold_type",
    "direction",
    "volume",
    "trailing_offset_percent",
    "enabled",
];

/// Parsed view of the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    /// Rows with `enabled=true`, in file order
    pub active: Vec<ConfigRecord>,

    /// Rows that are false, paused or canceled
    pub inactive: Vec<ConfigRecord>,

    /// Rows excluded because they could not be read
    pub row_errors: Vec<RowError>,
}

impl ConfigSnapshot {
    pub fn find(&self, id: &str) -> Option<&ConfigRecord> {
        self.active
            .iter()
            .chain(self.inactive.iter())
            .find(|r| r.id == id)
    }
}

/// Owns the on-disk config file and a cached snapshot of it.
pub struct ConfigStore {
    file: TableFile,
    snapshot: ConfigSnapshot,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: TableFile::new(path, CONFIG_COLUMNS),
            snapshot: ConfigSnapshot::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.file.set_retry_policy(retry);
        self
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Last known-good snapshot.
    pub fn snapshot(&self) -> &ConfigSnapshot {
        &self.snapshot
    }

    /// Refresh the snapshot if the file changed.
    ///
    /// When another writer holds the file, the cached snapshot is kept and a
    /// warning is logged. A file-level error also leaves the cache intact.
    pub fn load(&mut self) -> Result<LoadOutcome, StoreError> {
        match self.file.read_if_changed()? {
            ReadOutcome::Unchanged => Ok(LoadOutcome::Unchanged),
            ReadOutcome::Locked => {
                warn!(
                    path = %self.path().display(),
                    "Config file locked by another writer, keeping previous snapshot"
                );
                Ok(LoadOutcome::SkippedLocked)
            }
            ReadOutcome::Changed(table) => {
                let snapshot = parse_snapshot(self.path(), &table)?;
                for err in &snapshot.row_errors {
                    warn!(path = %self.path().display(), line = err.line, error = %err.message, "Config row excluded");
                }
                info!(
                    active = snapshot.active.len(),
                    inactive = snapshot.inactive.len(),
                    errors = snapshot.row_errors.len(),
                    "Config loaded"
                );
                self.snapshot = snapshot;
                Ok(LoadOutcome::Refreshed)
            }
        }
    }

    /// Parse the file as it is now, bypassing the cache and lock check.
    pub fn read_all(&self) -> Result<ConfigSnapshot, StoreError> {
        parse_snapshot(self.path(), &self.file.read()?)
    }

    /// Apply `mutation` to the full row set and atomically rewrite the file.
    pub fn write<T, F>(&mut self, op: &str, mutation: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut Table) -> Result<T, StoreError>,
    {
        self.file.write(op, mutation)
    }

    /// Set the `enabled` column of one row from its textual value.
    pub fn update_enabled(&mut self, id: &str, new_status: &str) -> Result<(), StoreError> {
        let status: EnabledStatus = new_status.parse().map_err(|_| StoreError::InvalidValue {
            field: "enabled",
            value: new_status.to_string(),
        })?;
        self.set_enabled(id, status)
    }

    /// Set the `enabled` column of the first row with `id`.
    pub fn set_enabled(&mut self, id: &str, status: EnabledStatus) -> Result<(), StoreError> {
        self.set_enabled_where(id, None, status)
    }

    /// Set the `enabled` column of the row with `id` on `line`.
    ///
    /// Targets one of several rows sharing an id. Fails with `NotFound` when
    /// the file changed so that `line` no longer holds `id`.
    pub fn set_enabled_on_line(
        &mut self,
        id: &str,
        line: usize,
        status: EnabledStatus,
    ) -> Result<(), StoreError> {
        self.set_enabled_where(id, Some(line), status)
    }

    fn set_enabled_where(
        &mut self,
        id: &str,
        line: Option<usize>,
        status: EnabledStatus,
    ) -> Result<(), StoreError> {
        let path = self.path().display().to_string();
        let previous = self.write("update_enabled", |table| {
            let id_col = required_column(&path, table, "id")?;
            let enabled_col = required_column(&path, table, "enabled")?;
            let found = match line {
                None => table.find_mut(id_col, id),
                Some(line) => table
                    .records_mut()
                    .find(|r| r.line() == line && r.get(id_col).trim() == id),
            };
            let record = found.ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
            let previous = record.get(enabled_col).parse::<EnabledStatus>().ok();
            record.set(enabled_col, status.as_str());
            Ok(previous)
        })?;

        let transition = previous
            .map(|p| p.transition_to(status))
            .unwrap_or(StatusTransition::Activate);
        info!(
            id = %id,
            from = previous.map(|p| p.as_str()).unwrap_or("invalid"),
            to = %status,
            transition = ?transition,
            "Config entry status updated"
        );
        Ok(())
    }
}

fn required_column(path: &str, table: &Table, column: &'static str) -> Result<usize, StoreError> {
    table.column(column).ok_or_else(|| StoreError::MissingColumn {
        path: path.to_string(),
        column,
    })
}

fn parse_snapshot(path: &Path, table: &Table) -> Result<ConfigSnapshot, StoreError> {
    let path_str = path.display().to_string();
    let mut cols = [0usize; 8];
    for (slot, name) in cols.iter_mut().zip(CONFIG_COLUMNS) {
        *slot = required_column(&path_str, table, *name)?;
    }
    let [id, pair, threshold_price, threshold_type, direction, volume, offset, enabled] = cols;

    let mut snapshot = ConfigSnapshot {
        row_errors: table.issues().to_vec(),
        ..Default::default()
    };

    for row in table.records() {
        let row_id = row.get(id).trim();
        if row_id.is_empty() {
            snapshot.row_errors.push(RowError {
                line: row.line(),
                message: "missing id".to_string(),
            });
            continue;
        }
        let status = match row.get(enabled).parse::<EnabledStatus>() {
            Ok(s) => s,
            Err(message) => {
                snapshot.row_errors.push(RowError {
                    line: row.line(),
                    message: format!("{}: {}", row_id, message),
                });
                continue;
            }
        };

        let record = ConfigRecord {
            line: row.line(),
            id: row_id.to_string(),
            pair: row.get(pair).trim().to_string(),
            threshold_price: row.get(threshold_price).trim().to_string(),
            threshold_type: row.get(threshold_type).trim().to_string(),
            direction: row.get(direction).trim().to_string(),
            volume: row.get(volume).trim().to_string(),
            trailing_offset_percent: row.get(offset).trim().to_string(),
            enabled: status,
        };
        if status.is_active() {
            snapshot.active.push(record);
        } else {
            snapshot.inactive.push(record);
        }
    }

    snapshot.row_errors.sort_by_key(|e| e.line);
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const CONFIG: &str = "\
# managed by trailguard
id,pair,threshold_price,threshold_type,direction,volume,trailing_offset_percent,enabled,note
btc_1,XXBTZUSD,51000,above,sell,0.01,1.0,true,keep me

eth_1,XETHZUSD,2500,below,buy,0.5,2.0,paused,
bad_row,XXBTZUSD,50000,above,sell,0.01,1.0,maybe,
sol_1,SOLUSD,180,above,sell,3,1.5,canceled,
";

    fn write_config(dir: &TempDir, text: &str) -> PathBuf {
        let path = dir.path().join("config.csv");
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_load_partitions_and_isolates_bad_rows() {
        let dir = TempDir::new().unwrap();
        let mut store = ConfigStore::new(write_config(&dir, CONFIG));

        assert_eq!(store.load().unwrap(), LoadOutcome::Refreshed);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.active.len(), 1);
        assert_eq!(snapshot.active[0].id, "btc_1");
        assert_eq!(snapshot.active[0].line, 3);
        assert_eq!(snapshot.inactive.len(), 2);
        assert_eq!(snapshot.row_errors.len(), 1);
        assert_eq!(snapshot.row_errors[0].line, 6);

        assert_eq!(store.load().unwrap(), LoadOutcome::Unchanged);
    }

    #[test]
    fn test_locked_file_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, CONFIG);
        let mut store = ConfigStore::new(&path);
        store.load().unwrap();

        fs::write(&path, CONFIG.replace("btc_1", "btc_long")).unwrap();
        let editor = fs::File::open(&path).unwrap();
        fs2::FileExt::lock_exclusive(&editor).unwrap();

        assert_eq!(store.load().unwrap(), LoadOutcome::SkippedLocked);
        assert_eq!(store.snapshot().active[0].id, "btc_1");

        fs2::FileExt::unlock(&editor).unwrap();
        assert_eq!(store.load().unwrap(), LoadOutcome::Refreshed);
        assert_eq!(store.snapshot().active[0].id, "btc_long");
    }

    #[test]
    fn test_missing_column_is_file_error_and_keeps_cache() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, CONFIG);
        let mut store = ConfigStore::new(&path);
        store.load().unwrap();

        fs::write(&path, "id,pair\nx,XBTUSD\n").unwrap();
        assert!(matches!(
            store.load(),
            Err(StoreError::MissingColumn { column: "threshold_price", .. })
        ));
        assert_eq!(store.snapshot().active.len(), 1);
    }

    #[test]
    fn test_update_enabled_preserves_other_rows() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, CONFIG);
        let mut store = ConfigStore::new(&path);

        store.update_enabled("eth_1", "true").unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, CONFIG.replace("2.0,paused,", "2.0,true,"));
        assert!(text.contains("btc_1,XXBTZUSD,51000,above,sell,0.01,1.0,true,keep me\n"));
        assert!(text.contains("bad_row,XXBTZUSD,50000,above,sell,0.01,1.0,maybe,\n"));
    }

    #[test]
    fn test_update_enabled_errors() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, CONFIG);
        let mut store = ConfigStore::new(&path);

        assert!(matches!(
            store.update_enabled("nope", "false"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.update_enabled("btc_1", "disabled"),
            Err(StoreError::InvalidValue { field: "enabled", .. })
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), CONFIG);
    }

    #[test]
    fn test_set_enabled_on_line_targets_one_duplicate() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "\
id,pair,threshold_price,threshold_type,direction,volume,trailing_offset_percent,enabled
dup,XXBTZUSD,51000,above,sell,0.01,1.0,true
dup,XXBTZUSD,52000,above,sell,0.01,1.0,true
",
        );
        let mut store = ConfigStore::new(&path);
        let lines: Vec<usize> = store.read_all().unwrap().active.iter().map(|r| r.line).collect();
        assert_eq!(lines.len(), 2);

        store.set_enabled_on_line("dup", lines[1], EnabledStatus::False).unwrap();
        store.set_enabled_on_line("dup", lines[0], EnabledStatus::False).unwrap();

        let snapshot = store.read_all().unwrap();
        assert!(snapshot.active.is_empty());
        assert_eq!(snapshot.inactive.len(), 2);
        assert!(matches!(
            store.set_enabled_on_line("other", lines[0], EnabledStatus::False),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_concurrent_writers_lose_no_rows() {
        let dir = TempDir::new().unwrap();
        let path = Arc::new(write_config(&dir, CONFIG));
        let retry = RetryPolicy {
            max_attempts: 200,
            initial_interval: Duration::from_millis(2),
            max_interval: Duration::from_millis(20),
        };

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = Arc::clone(&path);
                let retry = retry.clone();
                thread::spawn(move || {
                    let mut store = ConfigStore::new(path.as_path()).with_retry_policy(retry);
                    store
                        .write("append", |table| {
                            table.push(vec![
                                format!("new_{}", i),
                                "XBTUSD".to_string(),
                                "60000".to_string(),
                                "above".to_string(),
                                "sell".to_string(),
                                "0.01".to_string(),
                                "1".to_string(),
                                "false".to_string(),
                            ]);
                            Ok(())
                        })
                        .unwrap();
                    // every writer also flips the same contended field
                    store.update_enabled("btc_1", if i % 2 == 0 { "true" } else { "paused" }).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let store = ConfigStore::new(path.as_path());
        let snapshot = store.read_all().unwrap();
        let ids: HashSet<_> = snapshot
            .active
            .iter()
            .chain(snapshot.inactive.iter())
            .map(|r| r.id.clone())
            .collect();
        for expected in ["btc_1", "eth_1", "sol_1"] {
            assert!(ids.contains(expected), "lost {}", expected);
        }
        for i in 0..8 {
            assert!(ids.contains(&format!("new_{}", i)), "lost new_{}", i);
        }
        let text = fs::read_to_string(path.as_path()).unwrap();
        assert!(text.starts_with("# managed by trailguard\n"));
        assert!(text.contains("bad_row,"));
    }
}
