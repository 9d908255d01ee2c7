//! File-backed persistence for the config and trigger state.
//!
//! Both files are CSV shared with an editor and a dashboard. Every write
//! re-reads the file under lock, applies a mutation, and atomically replaces
//! it, so rows owned by other writers survive.

mod config_store;
mod error;
mod file;
mod state_store;
mod table;

pub use config_store::{ConfigSnapshot, ConfigStore, CONFIG_COLUMNS};
pub use error::StoreError;
pub use file::RetryPolicy;
pub use state_store::{StateStore, STATE_COLUMNS};
pub use table::{Record, RowError, Table};

/// What a `load()` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Refreshed,
    Unchanged,
    /// Another writer held the file; the previous snapshot was kept.
    SkippedLocked,
}
