//! Exchange capability surface and its implementations.

mod error;
mod market_client;
mod paper;
mod retry;
mod types;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use rust_decimal::Decimal;

pub use error::ExchangeError;
pub use market_client::MarketDataClient;
pub use paper::PaperExchange;
pub use retry::{CallPolicy, Idempotency};
pub use types::*;

/// Public market data.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Last trade price per requested pair, keyed by the requested name.
    async fn get_prices(&self, pairs: &[String]) -> Result<HashMap<String, Decimal>, ExchangeError>;

    /// Every accepted spelling of every tradable pair.
    async fn get_asset_pairs(&self) -> Result<HashSet<String>, ExchangeError>;
}

/// Everything the trigger engine needs from an exchange.
///
/// Implementations perform one attempt per call; timeouts and retries are
/// applied by the caller.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_prices(&self, pairs: &[String]) -> Result<HashMap<String, Decimal>, ExchangeError>;

    async fn get_asset_pairs(&self) -> Result<HashSet<String>, ExchangeError>;

    /// Raw amounts keyed by wallet key, as the exchange reports them.
    async fn get_balances(&self) -> Result<HashMap<String, String>, ExchangeError>;

    /// Returns the exchange order id.
    async fn place_trailing_stop(&self, request: &TrailingStopRequest) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    /// Status of specific orders; unknown ids are absent from the result.
    async fn query_orders(&self, order_ids: &[String]) -> Result<HashMap<String, OrderStatus>, ExchangeError>;

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError>;
}
