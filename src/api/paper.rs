//! Simulated exchange: real public prices, in-memory balances and orders.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{OpenOrder, OrderStatus, TrailingStopRequest};
use super::{Exchange, ExchangeError, MarketData};
use crate::models::Direction;
use crate::trading::{aggregate, base_asset, canonical_asset};

/// A simulated trailing-stop order.
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub order_id: String,
    pub request: TrailingStopRequest,
    /// Most favorable price seen: highest for sells, lowest for buys
    pub extreme: Decimal,
    pub status: OrderStatus,
    pub fill_price: Option<Decimal>,
}

impl PaperOrder {
    /// Price at which the order executes given the current extreme.
    pub fn stop_price(&self) -> Decimal {
        let offset = self.request.trailing_offset_percent / Decimal::ONE_HUNDRED;
        match self.request.direction {
            Direction::Sell => self.extreme * (Decimal::ONE - offset),
            Direction::Buy => self.extreme * (Decimal::ONE + offset),
        }
    }

    /// Move the extreme with `price` and close if price reverted past the stop.
    /// Returns true when this call filled the order.
    pub fn observe(&mut self, price: Decimal) -> bool {
        if self.status != OrderStatus::Open {
            return false;
        }
        let hit = match self.request.direction {
            Direction::Sell => {
                self.extreme = self.extreme.max(price);
                price <= self.stop_price()
            }
            Direction::Buy => {
                self.extreme = self.extreme.min(price);
                price >= self.stop_price()
            }
        };
        if hit {
            self.status = OrderStatus::Closed;
            self.fill_price = Some(price);
        }
        hit
    }
}

/// Paper-trading exchange backed by a public market data source.
pub struct PaperExchange<M: MarketData> {
    market: M,
    balances: Mutex<HashMap<String, Decimal>>,
    orders: Mutex<HashMap<String, PaperOrder>>,
}

impl<M: MarketData> PaperExchange<M> {
    /// Create with seeded balances keyed by wallet key (`XXBT`, `XBT.F`, ...).
    pub fn new(market: M, balances: HashMap<String, Decimal>) -> Self {
        Self {
            market,
            balances: Mutex::new(balances),
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Feed current prices to every open order and settle fills.
    async fn refresh(&self) -> Result<(), ExchangeError> {
        let pairs: Vec<String> = {
            let orders = self.lock_orders()?;
            let distinct: HashSet<&String> = orders
                .values()
                .filter(|o| o.status == OrderStatus::Open)
                .map(|o| &o.request.pair)
                .collect();
            distinct.into_iter().cloned().collect()
        };
        if pairs.is_empty() {
            return Ok(());
        }

        let prices = self.market.get_prices(&pairs).await?;

        let mut filled = Vec::new();
        {
            let mut orders = self.lock_orders()?;
            for order in orders.values_mut() {
                if let Some(price) = prices.get(&order.request.pair) {
                    if order.observe(*price) {
                        filled.push(order.clone());
                    }
                }
            }
        }

        for order in filled {
            info!(
                order_id = %order.order_id,
                pair = %order.request.pair,
                direction = %order.request.direction,
                price = %order.fill_price.unwrap_or_default(),
                "Paper order filled"
            );
            self.settle(&order)?;
        }
        Ok(())
    }

    /// Move the base asset for a filled order.
    fn settle(&self, order: &PaperOrder) -> Result<(), ExchangeError> {
        let Some(base) = base_asset(&order.request.pair) else {
            return Ok(());
        };
        let mut balances = self.lock_balances()?;

        let mut keys: Vec<String> = balances
            .keys()
            .filter(|k| canonical_asset(k) == base)
            .cloned()
            .collect();
        keys.sort();

        match order.request.direction {
            Direction::Buy => {
                let key = keys.into_iter().next().unwrap_or(base);
                *balances.entry(key).or_default() += order.request.volume;
            }
            Direction::Sell => {
                let mut remaining = order.request.volume;
                for key in keys {
                    if remaining.is_zero() {
                        break;
                    }
                    if let Some(amount) = balances.get_mut(&key) {
                        let taken = remaining.min(*amount);
                        *amount -= taken;
                        remaining -= taken;
                    }
                }
            }
        }
        Ok(())
    }

    /// Base asset volume already promised to open sell orders.
    fn committed_sells(orders: &HashMap<String, PaperOrder>, asset: &str) -> Decimal {
        orders
            .values()
            .filter(|o| o.status == OrderStatus::Open && o.request.direction == Direction::Sell)
            .filter(|o| base_asset(&o.request.pair).as_deref() == Some(asset))
            .map(|o| o.request.volume)
            .sum()
    }

    fn lock_orders(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PaperOrder>>, ExchangeError> {
        self.orders
            .lock()
            .map_err(|_| ExchangeError::Rejected("paper order book poisoned".to_string()))
    }

    fn lock_balances(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Decimal>>, ExchangeError> {
        self.balances
            .lock()
            .map_err(|_| ExchangeError::Rejected("paper balances poisoned".to_string()))
    }
}

#[async_trait]
impl<M: MarketData> Exchange for PaperExchange<M> {
    async fn get_prices(&self, pairs: &[String]) -> Result<HashMap<String, Decimal>, ExchangeError> {
        self.market.get_prices(pairs).await
    }

    async fn get_asset_pairs(&self) -> Result<HashSet<String>, ExchangeError> {
        self.market.get_asset_pairs().await
    }

    async fn get_balances(&self) -> Result<HashMap<String, String>, ExchangeError> {
        self.refresh().await?;
        let balances = self.lock_balances()?;
        Ok(balances.iter().map(|(k, v)| (k.clone(), v.to_string())).collect())
    }

    async fn place_trailing_stop(&self, request: &TrailingStopRequest) -> Result<String, ExchangeError> {
        if request.volume <= Decimal::ZERO {
            return Err(ExchangeError::Rejected("volume must be positive".to_string()));
        }
        let prices = self.market.get_prices(std::slice::from_ref(&request.pair)).await?;
        let price = *prices
            .get(&request.pair)
            .ok_or_else(|| ExchangeError::Rejected(format!("unknown pair {}", request.pair)))?;

        let mut orders = self.lock_orders()?;
        if request.direction == Direction::Sell {
            let base = base_asset(&request.pair)
                .ok_or_else(|| ExchangeError::Rejected(format!("cannot resolve base asset of {}", request.pair)))?;
            let raw: HashMap<String, String> = self
                .lock_balances()?
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect();
            let free = aggregate(&raw).total(&base) - Self::committed_sells(&orders, &base);
            if free < request.volume {
                return Err(ExchangeError::Rejected(format!(
                    "insufficient funds: {} {} free, {} requested",
                    free, base, request.volume
                )));
            }
        }

        let order_id = format!("PAPER-{}", Uuid::new_v4());
        orders.insert(
            order_id.clone(),
            PaperOrder {
                order_id: order_id.clone(),
                request: request.clone(),
                extreme: price,
                status: OrderStatus::Open,
                fill_price: None,
            },
        );
        debug!(order_id = %order_id, pair = %request.pair, price = %price, "Paper order opened");
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let mut orders = self.lock_orders()?;
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::NotFound(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(ExchangeError::Rejected(format!(
                "order {} already {:?}",
                order_id, order.status
            )));
        }
        order.status = OrderStatus::Canceled;
        Ok(())
    }

    async fn query_orders(&self, order_ids: &[String]) -> Result<HashMap<String, OrderStatus>, ExchangeError> {
        self.refresh().await?;
        let orders = self.lock_orders()?;
        Ok(order_ids
            .iter()
            .filter_map(|id| orders.get(id).map(|o| (id.clone(), o.status)))
            .collect())
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        self.refresh().await?;
        let orders = self.lock_orders()?;
        Ok(orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                pair: o.request.pair.clone(),
                client_ref: Some(o.request.client_ref.clone()),
                status: o.status,
            })
            .collect())
    }
}
