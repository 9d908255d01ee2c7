//! Persisted per-entry trigger state.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::models::{EntryPhase, TriggerState};

use super::file::{ReadOutcome, RetryPolicy, TableFile};
use super::table::{Record, RowError, Table};
use super::{LoadOutcome, StoreError};

pub const STATE_COLUMNS: &[&str] = &[
    "id",
    "triggered",
    "order_id",
    "triggered_at",
    "trigger_price",
    "last_status",
    "updated_at",
];

/// Owns the on-disk state file and a cached map of it.
pub struct StateStore {
    file: TableFile,
    states: HashMap<String, TriggerState>,
    // ids whose rows exist but could not be read
    quarantined: HashSet<String>,
    row_errors: Vec<RowError>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: TableFile::new(path, STATE_COLUMNS),
            states: HashMap::new(),
            quarantined: HashSet::new(),
            row_errors: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.file.set_retry_policy(retry);
        self
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn states(&self) -> &HashMap<String, TriggerState> {
        &self.states
    }

    /// Ids with an unreadable state row. Acting on them could repeat a trigger.
    pub fn quarantined(&self) -> &HashSet<String> {
        &self.quarantined
    }

    pub fn row_errors(&self) -> &[RowError] {
        &self.row_errors
    }

    /// Refresh the cached states if the file changed; skip while locked.
    pub fn load(&mut self) -> Result<LoadOutcome, StoreError> {
        match self.file.read_if_changed()? {
            ReadOutcome::Unchanged => Ok(LoadOutcome::Unchanged),
            ReadOutcome::Locked => {
                warn!(path = %self.path().display(), "State file locked by another writer, keeping previous states");
                Ok(LoadOutcome::SkippedLocked)
            }
            ReadOutcome::Changed(table) => {
                let parsed = parse_states(self.path(), &table)?;
                for err in &parsed.row_errors {
                    warn!(path = %self.path().display(), line = err.line, error = %err.message, "State row unreadable");
                }
                self.states = parsed.states;
                self.quarantined = parsed.quarantined;
                self.row_errors = parsed.row_errors;
                debug!(count = self.states.len(), "State loaded");
                Ok(LoadOutcome::Refreshed)
            }
        }
    }

    /// Read the file as it is now, bypassing the cache.
    pub fn read_all(&self) -> Result<HashMap<String, TriggerState>, StoreError> {
        Ok(parse_states(self.path(), &self.file.read()?)?.states)
    }

    /// Insert or update the rows for `states`, leaving every other row untouched.
    pub fn upsert<'a, I>(&mut self, states: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = &'a TriggerState>,
    {
        let states: Vec<&TriggerState> = states.into_iter().collect();
        if states.is_empty() {
            return Ok(());
        }

        self.file.write("upsert_state", |table| {
            let cols: Vec<usize> = STATE_COLUMNS
                .iter()
                .map(|name| table.ensure_column(name))
                .collect();
            for state in &states {
                let values = encode_state(state);
                match table.find_mut(cols[0], &state.id) {
                    Some(record) => {
                        for (col, value) in cols.iter().zip(values) {
                            record.set(*col, value);
                        }
                    }
                    None => {
                        let width = cols.iter().max().map(|m| m + 1).unwrap_or(0);
                        let mut fields = vec![String::new(); width];
                        for (col, value) in cols.iter().zip(values) {
                            fields[*col] = value;
                        }
                        table.push(fields);
                    }
                }
            }
            Ok(())
        })?;

        for state in states {
            self.quarantined.remove(&state.id);
            self.states.insert(state.id.clone(), state.clone());
        }
        Ok(())
    }
}

fn encode_state(state: &TriggerState) -> Vec<String> {
    vec![
        state.id.clone(),
        state.triggered.to_string(),
        state.order_id.clone().unwrap_or_default(),
        state
            .triggered_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        state
            .trigger_price
            .map(|p| p.to_string())
            .unwrap_or_default(),
        state.last_status.as_str().to_string(),
        state.updated_at.to_rfc3339(),
    ]
}

struct ParsedStates {
    states: HashMap<String, TriggerState>,
    quarantined: HashSet<String>,
    row_errors: Vec<RowError>,
}

fn parse_states(path: &Path, table: &Table) -> Result<ParsedStates, StoreError> {
    let id_col = table.column("id").ok_or_else(|| StoreError::MissingColumn {
        path: path.display().to_string(),
        column: "id",
    })?;

    let mut parsed = ParsedStates {
        states: HashMap::new(),
        quarantined: HashSet::new(),
        row_errors: table.issues().to_vec(),
    };

    for row in table.records() {
        let id = row.get(id_col).trim();
        if id.is_empty() {
            parsed.row_errors.push(RowError {
                line: row.line(),
                message: "missing id".to_string(),
            });
            continue;
        }
        match decode_state(table, row, id) {
            Ok(state) => {
                parsed.states.insert(id.to_string(), state);
            }
            Err(message) => {
                parsed.quarantined.insert(id.to_string());
                parsed.row_errors.push(RowError {
                    line: row.line(),
                    message: format!("{}: {}", id, message),
                });
            }
        }
    }

    Ok(parsed)
}

fn decode_state(table: &Table, row: &Record, id: &str) -> Result<TriggerState, String> {
    let field = |name: &str| {
        table
            .column(name)
            .map(|c| row.get(c).trim())
            .unwrap_or("")
    };

    let triggered = match field("triggered").to_ascii_lowercase().as_str() {
        "" | "false" => false,
        "true" => true,
        other => return Err(format!("invalid triggered flag '{}'", other)),
    };
    let order_id = Some(field("order_id"))
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let triggered_at = parse_optional(field("triggered_at"), parse_timestamp)?;
    let trigger_price = parse_optional(field("trigger_price"), |s| {
        Decimal::from_str(s).map_err(|e| format!("invalid trigger_price '{}': {}", s, e))
    })?;
    let last_status = EntryPhase::from_str(field("last_status"))?;
    let updated_at = parse_optional(field("updated_at"), parse_timestamp)?.unwrap_or_else(Utc::now);

    Ok(TriggerState {
        id: id.to_string(),
        triggered,
        order_id,
        triggered_at,
        trigger_price,
        last_status,
        updated_at,
    })
}

fn parse_optional<T>(
    value: &str,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<Option<T>, String> {
    if value.is_empty() {
        Ok(None)
    } else {
        parse(value).map(Some)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_upsert_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.csv");
        let mut store = StateStore::new(&path);

        let mut state = TriggerState::new("btc_1");
        state.mark_threshold_met(dec!(51000.5));
        state.mark_order_placed("OXYZ-1".to_string());
        store.upsert([&state]).unwrap();

        let mut reader = StateStore::new(&path);
        assert_eq!(reader.load().unwrap(), LoadOutcome::Refreshed);
        let loaded = &reader.states()["btc_1"];
        assert!(loaded.triggered);
        assert_eq!(loaded.order_id.as_deref(), Some("OXYZ-1"));
        assert_eq!(loaded.trigger_price, Some(dec!(51000.5)));
        assert_eq!(loaded.last_status, EntryPhase::OrderPlaced);
        assert!(loaded.triggered_at.is_some());
    }

    #[test]
    fn test_upsert_keeps_foreign_rows_and_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.csv");
        fs::write(
            &path,
            "# state\nid,triggered,order_id,triggered_at,trigger_price,last_status,updated_at,operator_note\n\
             eth_1,false,,,,idle,2026-01-01T00:00:00+00:00,watch closely\n",
        )
        .unwrap();

        let mut store = StateStore::new(&path);
        store.upsert([&TriggerState::new("btc_1")]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# state\n"));
        assert!(text.contains("eth_1,false,,,,idle,2026-01-01T00:00:00+00:00,watch closely\n"));
        assert!(text.contains("\nbtc_1,false,,,,idle,"));
    }

    #[test]
    fn test_unreadable_row_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.csv");
        fs::write(
            &path,
            "id,triggered,order_id,triggered_at,trigger_price,last_status,updated_at\n\
             btc_1,yes,OX,,,order_placed,\n\
             eth_1,false,,,,idle,\n",
        )
        .unwrap();

        let mut store = StateStore::new(&path);
        store.load().unwrap();
        assert!(store.quarantined().contains("btc_1"));
        assert!(!store.states().contains_key("btc_1"));
        assert!(store.states().contains_key("eth_1"));
        assert_eq!(store.row_errors().len(), 1);
    }
}
