//! Data models for config entries, trigger state, and balances.

mod balance;
mod config_entry;
mod trigger_state;

pub use balance::{AssetBalance, BalanceView};
pub use config_entry::{
    ConfigEntry, ConfigRecord, Direction, EnabledStatus, StatusTransition, ThresholdType,
};
pub use trigger_state::{EntryPhase, TriggerState};
