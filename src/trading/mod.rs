//! Trading logic: balance aggregation, validation, trigger engine.

mod balance;
mod config;
mod engine;
mod symbols;
mod validator;

pub use balance::{aggregate, base_asset, canonical_asset};
pub use config::EngineConfig;
pub use engine::{CancelAllReport, EngineError, EngineStats, TriggerEngine};
pub use symbols::SymbolCache;
pub use validator::{balance_check, BalanceCheck, Issue, MarketContext, ValidationResult, Validator};
