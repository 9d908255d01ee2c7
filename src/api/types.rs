//! Request and response types shared by exchange implementations.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::Direction;

/// A trailing-stop order to place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailingStopRequest {
    pub pair: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub trailing_offset_percent: Decimal,

    /// Caller reference echoed back on open orders; the config id
    pub client_ref: String,
}

/// Exchange-side order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    /// Fully executed
    Closed,
    Canceled,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Closed | OrderStatus::Canceled | OrderStatus::Expired
        )
    }
}

/// An order currently open on the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOrder {
    pub order_id: String,
    pub pair: String,
    pub client_ref: Option<String>,
    pub status: OrderStatus,
}

/// Tradable pair metadata from the public asset-pair listing.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetPairInfo {
    #[serde(default)]
    pub altname: String,
    #[serde(default)]
    pub wsname: Option<String>,
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub quote: String,
}

/// Envelope of every public REST response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub error: Vec<String>,
    pub result: Option<T>,
}

/// Ticker entry; `c` is `[last trade price, lot volume]`.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerInfo {
    pub c: Vec<String>,
}

pub type TickerResponse = HashMap<String, TickerInfo>;
pub type AssetPairsResponse = HashMap<String, AssetPairInfo>;
