//! Trailing-stop trigger engine.
//!
//! Watches prices for the entries of an operator-edited CSV file and, once an
//! entry's threshold is crossed, places exactly one trailing-stop order for
//! it, tracking the order until it fills or is canceled.

pub mod api;
pub mod bot;
pub mod models;
pub mod store;
pub mod trading;
