//! Trigger engine: watches prices and places one trailing stop per config entry.
//!
//! One tick runs fetch, validate (when the config changed), evaluate, act,
//! reconcile and persist, in that order. The in-memory state map is
//! authoritative; entries whose write failed stay dirty until a later tick
//! persists them, and a reload of the state file never overwrites them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::api::{
    CallPolicy, Exchange, ExchangeError, Idempotency, OpenOrder, OrderStatus, TrailingStopRequest,
};
use crate::models::{
    BalanceView, ConfigEntry, ConfigRecord, Direction, EnabledStatus, EntryPhase, TriggerState,
};
use crate::store::{ConfigStore, LoadOutcome, StateStore, StoreError};

use super::balance::{aggregate, base_asset};
use super::symbols::SymbolCache;
use super::validator::{balance_check, flag_duplicates, MarketContext, ValidationResult, Validator};
use super::EngineConfig;

/// Errors surfaced by operator operations and by a skipped tick.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("entry '{id}' has no open order to cancel")]
    NoOpenOrder { id: String },
}

/// Counters since the engine started.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub thresholds_met: u64,
    pub orders_placed: u64,
    pub orders_adopted: u64,
    pub fills: u64,
    pub external_cancels: u64,
    pub user_cancels: u64,
    pub insufficient_balance: u64,
    pub auto_disabled: u64,
    pub failed_calls: u64,
    pub failed_writes: u64,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Engine Statistics ===")?;
        writeln!(f, "Ticks:            {} (skipped: {})", self.ticks, self.skipped_ticks)?;
        writeln!(f, "Thresholds Met:   {}", self.thresholds_met)?;
        writeln!(f, "Orders Placed:    {} (adopted: {})", self.orders_placed, self.orders_adopted)?;
        writeln!(f, "Fills:            {}", self.fills)?;
        writeln!(f, "Cancellations:    {} external, {} by user", self.external_cancels, self.user_cancels)?;
        writeln!(f, "Balance Holds:    {}", self.insufficient_balance)?;
        writeln!(f, "Auto-disabled:    {}", self.auto_disabled)?;
        writeln!(f, "Failures:         {} calls, {} writes", self.failed_calls, self.failed_writes)?;
        Ok(())
    }
}

/// Outcome of cancelling every tracked order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelAllReport {
    /// `(entry id, order id)`
    pub succeeded: Vec<(String, String)>,

    /// `(entry id, order id, error)`
    pub failed: Vec<(String, String, String)>,
}

impl CancelAllReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for CancelAllReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Canceled {} of {} orders",
            self.succeeded.len(),
            self.succeeded.len() + self.failed.len()
        )?;
        for (id, order_id) in &self.succeeded {
            writeln!(f, "  ok      {} ({})", id, order_id)?;
        }
        for (id, order_id, err) in &self.failed {
            writeln!(f, "  FAILED  {} ({}): {}", id, order_id, err)?;
        }
        Ok(())
    }
}

/// The monitoring state machine over one config file and one state file.
pub struct TriggerEngine {
    exchange: Arc<dyn Exchange>,
    config_store: ConfigStore,
    state_store: StateStore,
    validator: Validator,
    config: EngineConfig,
    policy: CallPolicy,

    states: HashMap<String, TriggerState>,
    dirty: HashSet<String>,

    /// Results of the last validation pass, in file order
    validations: Vec<ValidationResult>,

    /// Entries that passed the last validation
    eligible: BTreeMap<String, ConfigEntry>,

    /// Row content each entry last passed the market checks with
    accepted: HashMap<String, ConfigRecord>,

    needs_validation: bool,
    symbols: SymbolCache,
    stats: EngineStats,
}

impl TriggerEngine {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        config_store: ConfigStore,
        state_store: StateStore,
        config: EngineConfig,
    ) -> Self {
        let policy = config.call_policy();
        let symbols = SymbolCache::new(config.symbol_cache_ttl);
        Self {
            exchange,
            config_store,
            state_store,
            validator: Validator::new(),
            config,
            policy,
            states: HashMap::new(),
            dirty: HashSet::new(),
            validations: Vec::new(),
            eligible: BTreeMap::new(),
            accepted: HashMap::new(),
            needs_validation: true,
            symbols,
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current per-entry states, including changes not yet written.
    pub fn states(&self) -> &HashMap<String, TriggerState> {
        &self.states
    }

    /// Results of the most recent validation pass.
    pub fn validation_report(&self) -> &[ValidationResult] {
        &self.validations
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Ids whose latest state has not reached the state file.
    pub fn pending_writes(&self) -> usize {
        self.dirty.len()
    }

    /// Run one fetch, evaluate, act, reconcile cycle.
    ///
    /// Returns an error only when the tick was skipped because prices could
    /// not be fetched; every other failure is logged and retried next tick.
    pub async fn tick(&mut self) -> Result<(), EngineError> {
        self.stats.ticks += 1;

        match self.config_store.load() {
            Ok(LoadOutcome::Refreshed) => self.needs_validation = true,
            Ok(_) => {}
            Err(e) => error!(error = %e, "Config load failed, keeping previous snapshot"),
        }
        self.reload_states();

        let pairs: Vec<String> = self
            .config_store
            .snapshot()
            .active
            .iter()
            .map(|r| r.pair.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let prices = match self.fetch_prices(&pairs).await {
            Ok(prices) => prices,
            Err(e) => {
                self.stats.skipped_ticks += 1;
                self.persist_dirty();
                return Err(e.into());
            }
        };

        if self.needs_validation {
            self.validate_active(&prices).await;
            self.needs_validation = false;
        }

        self.evaluate(&prices);
        self.act().await;
        self.reconcile().await;
        self.persist_dirty();

        debug!(
            pairs = pairs.len(),
            eligible = self.eligible.len(),
            tracked = self.states.len(),
            "Tick complete"
        );
        Ok(())
    }

    /// Validate every active entry against fresh market data without
    /// changing the config file.
    pub async fn validate_config(&mut self) -> Result<Vec<ValidationResult>, EngineError> {
        self.config_store.load()?;
        self.reload_states();

        let records = self.config_store.snapshot().active.clone();
        let pairs: Vec<String> = records
            .iter()
            .map(|r| r.pair.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let prices = match self.fetch_prices(&pairs).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Prices unavailable, market checks skipped");
                HashMap::new()
            }
        };
        let balances = if records.iter().any(is_sell) {
            self.fetch_balances().await
        } else {
            None
        };
        self.refresh_symbols().await;

        let market = MarketContext {
            prices: Some(&prices),
            balances: balances.as_ref(),
            symbols: self.symbols.symbols(),
        };
        Ok(self.validator.validate_all(&records, &market))
    }

    /// Cancel the live order of one entry.
    pub async fn cancel_order(&mut self, id: &str) -> Result<(), EngineError> {
        self.reload_states();

        let order_id = self
            .states
            .get(id)
            .filter(|s| s.has_open_order())
            .and_then(|s| s.order_id.clone())
            .ok_or_else(|| EngineError::NoOpenOrder { id: id.to_string() })?;

        self.cancel_on_exchange(&order_id).await?;
        self.mark_user_canceled(id);
        info!(id = %id, order_id = %order_id, "Order canceled by user");
        self.persist_one(id)?;
        Ok(())
    }

    /// Cancel every tracked open order, each independently.
    pub async fn cancel_all(&mut self) -> CancelAllReport {
        self.reload_states();

        let mut tracked: Vec<(String, String)> = self
            .states
            .values()
            .filter(|s| s.has_open_order())
            .filter_map(|s| s.order_id.clone().map(|o| (s.id.clone(), o)))
            .collect();
        tracked.sort();

        let mut report = CancelAllReport::default();
        for (id, order_id) in tracked {
            match self.cancel_on_exchange(&order_id).await {
                Ok(()) => {
                    self.mark_user_canceled(&id);
                    report.succeeded.push((id, order_id));
                }
                Err(e) => {
                    warn!(id = %id, order_id = %order_id, error = %e, "Cancel failed");
                    report.failed.push((id, order_id, e.to_string()));
                }
            }
        }
        self.persist_dirty();

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Cancel-all finished"
        );
        report
    }

    fn reload_states(&mut self) {
        match self.state_store.load() {
            Ok(LoadOutcome::Refreshed) => {
                let stored = self.state_store.states();
                let dirty = &self.dirty;
                self.states
                    .retain(|id, _| dirty.contains(id) || stored.contains_key(id));
                for (id, state) in stored {
                    if !self.dirty.contains(id) {
                        self.states.insert(id.clone(), state.clone());
                    }
                }
                for id in self.state_store.quarantined() {
                    warn!(id = %id, "State row unreadable, entry held until repaired");
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "State load failed, keeping in-memory states"),
        }
    }

    async fn fetch_prices(&mut self, pairs: &[String]) -> Result<HashMap<String, Decimal>, ExchangeError> {
        if pairs.is_empty() {
            return Ok(HashMap::new());
        }
        let exchange = Arc::clone(&self.exchange);
        let result = self
            .policy
            .call("get_prices", Idempotency::Idempotent, || exchange.get_prices(pairs))
            .await;
        match &result {
            Ok(prices) => {
                for pair in pairs.iter().filter(|p| !prices.contains_key(*p)) {
                    warn!(pair = %pair, "No price returned for pair");
                }
            }
            Err(e) => {
                self.stats.failed_calls += 1;
                error!(pairs = pairs.len(), error = %e, "Price fetch failed, skipping tick");
            }
        }
        result
    }

    async fn fetch_balances(&mut self) -> Option<BalanceView> {
        let exchange = Arc::clone(&self.exchange);
        match self
            .policy
            .call("get_balances", Idempotency::Idempotent, || exchange.get_balances())
            .await
        {
            Ok(raw) => Some(aggregate(&raw)),
            Err(e) => {
                self.stats.failed_calls += 1;
                warn!(error = %e, "Balance fetch failed");
                None
            }
        }
    }

    async fn refresh_symbols(&mut self) {
        let now = Instant::now();
        if !self.symbols.is_stale(now) {
            return;
        }
        let exchange = Arc::clone(&self.exchange);
        match self
            .policy
            .call("get_asset_pairs", Idempotency::Idempotent, || exchange.get_asset_pairs())
            .await
        {
            Ok(symbols) => {
                debug!(count = symbols.len(), "Symbol list refreshed");
                self.symbols.store(symbols, now);
            }
            Err(e) => {
                self.stats.failed_calls += 1;
                warn!(error = %e, "Symbol list refresh failed, keeping previous list");
                self.symbols.mark_failed(now);
            }
        }
    }

    /// Rebuild the eligible set from the active config rows.
    ///
    /// Market checks run only on idle rows that are new or were edited since
    /// they last passed them. An unchanged row keeps its earlier acceptance,
    /// so a refresh caused by another edit cannot disable it on the tick its
    /// threshold is crossed.
    async fn validate_active(&mut self, prices: &HashMap<String, Decimal>) {
        let quarantined = self.state_store.quarantined().clone();
        let mut records: Vec<ConfigRecord> = Vec::new();
        let mut market_checked: Vec<bool> = Vec::new();

        for record in &self.config_store.snapshot().active {
            if quarantined.contains(&record.id) {
                continue;
            }
            let idle = match self.states.get(&record.id) {
                Some(s) if s.triggered => continue,
                Some(s) => s.last_status == EntryPhase::Idle,
                None => true,
            };
            let accepted = self
                .accepted
                .get(&record.id)
                .is_some_and(|previous| same_content(previous, record));
            market_checked.push(idle && !accepted);
            records.push(record.clone());
        }

        let balances = if records.iter().any(is_sell) {
            self.fetch_balances().await
        } else {
            None
        };
        self.refresh_symbols().await;

        let mut results: Vec<ValidationResult> = {
            let symbols = self.symbols.symbols();
            let full = MarketContext {
                prices: Some(prices),
                balances: balances.as_ref(),
                symbols,
            };
            let structural = MarketContext {
                prices: None,
                balances: balances.as_ref(),
                symbols,
            };
            records
                .iter()
                .zip(&market_checked)
                .map(|(record, &checked)| {
                    let market = if checked { &full } else { &structural };
                    self.validator.validate_entry(record, market)
                })
                .collect()
        };
        flag_duplicates(&records, &mut results);

        self.accepted.retain(|id, _| records.iter().any(|r| &r.id == id));
        self.eligible.clear();
        for ((record, result), checked) in records.iter().zip(&results).zip(&market_checked) {
            for warning in &result.warnings {
                warn!(id = %result.id, line = result.line, warning = %warning, "Config entry warning");
            }
            if let Some(entry) = result.valid_entry() {
                if *checked {
                    self.accepted.insert(entry.id.clone(), record.clone());
                }
                self.eligible.insert(entry.id.clone(), entry.clone());
                continue;
            }
            self.accepted.remove(&result.id);
            for err in &result.errors {
                warn!(id = %result.id, line = result.line, error = %err, "Config entry invalid");
            }
            if self.config.auto_disable_invalid && !result.id.is_empty() {
                match self
                    .config_store
                    .set_enabled_on_line(&result.id, result.line, EnabledStatus::False)
                {
                    Ok(()) => {
                        self.stats.auto_disabled += 1;
                        info!(id = %result.id, line = result.line, "Invalid entry disabled");
                    }
                    Err(e) => {
                        self.stats.failed_writes += 1;
                        error!(id = %result.id, line = result.line, error = %e, "Failed to disable invalid entry");
                    }
                }
            }
        }

        info!(
            validated = results.len(),
            eligible = self.eligible.len(),
            "Config validated"
        );
        self.validations = results;
    }

    fn evaluate(&mut self, prices: &HashMap<String, Decimal>) {
        for (id, entry) in &self.eligible {
            if !self.states.contains_key(id) {
                self.states.insert(id.clone(), TriggerState::new(id.clone()));
                self.dirty.insert(id.clone());
            }
            let Some(state) = self.states.get_mut(id) else {
                continue;
            };
            if state.triggered || state.last_status != EntryPhase::Idle {
                continue;
            }
            let Some(price) = prices.get(&entry.pair) else {
                continue;
            };
            if !entry.is_threshold_met(*price) {
                continue;
            }

            state.mark_threshold_met(*price);
            self.dirty.insert(id.clone());
            self.stats.thresholds_met += 1;
            info!(
                id = %id,
                pair = %entry.pair,
                price = %price,
                threshold = %entry.threshold_price,
                threshold_type = %entry.threshold_type,
                "Threshold met"
            );
        }
    }

    async fn act(&mut self) {
        let mut pending: Vec<String> = self
            .states
            .values()
            .filter(|s| {
                !s.triggered
                    && matches!(
                        s.last_status,
                        EntryPhase::ThresholdMet | EntryPhase::PlacementUnknown
                    )
            })
            .map(|s| s.id.clone())
            .collect();
        pending.sort();

        let mut open_orders: Option<Vec<OpenOrder>> = None;
        let mut balances: Option<BalanceView> = None;

        for id in pending {
            if self.state_store.quarantined().contains(&id) {
                continue;
            }

            if self.phase_of(&id) == Some(EntryPhase::PlacementUnknown) {
                if open_orders.is_none() {
                    open_orders = self.fetch_open_orders().await;
                }
                let Some(orders) = open_orders.as_ref() else {
                    continue;
                };
                match orders.iter().find(|o| o.client_ref.as_deref() == Some(id.as_str())) {
                    Some(order) => {
                        let order_id = order.order_id.clone();
                        self.record_placement(&id, order_id.clone());
                        self.stats.orders_adopted += 1;
                        info!(id = %id, order_id = %order_id, "Adopted order from unknown placement");
                        continue;
                    }
                    None => {
                        if let Some(state) = self.states.get_mut(&id) {
                            state.set_phase(EntryPhase::ThresholdMet);
                        }
                        self.dirty.insert(id.clone());
                        info!(id = %id, "No order found for unknown placement, will place again");
                    }
                }
            }

            let Some(entry) = self.eligible.get(&id).cloned() else {
                debug!(id = %id, "Entry no longer eligible, holding");
                continue;
            };

            if entry.direction == Direction::Sell {
                if balances.is_none() {
                    balances = self.fetch_balances().await;
                }
                let Some(view) = balances.as_ref() else {
                    warn!(id = %id, "Balance unavailable, placement deferred");
                    continue;
                };
                if let Some(check) = balance_check(&entry, view) {
                    if !check.is_sufficient() {
                        self.stats.insufficient_balance += 1;
                        warn!(
                            id = %id,
                            asset = %check.asset,
                            required = %check.required,
                            available = %check.available,
                            sources = %check.describe_sources(),
                            "Insufficient balance, will retry next tick"
                        );
                        continue;
                    }
                }
            }

            let request = TrailingStopRequest {
                pair: entry.pair.clone(),
                direction: entry.direction,
                volume: entry.volume,
                trailing_offset_percent: entry.trailing_offset_percent,
                client_ref: entry.id.clone(),
            };
            let exchange = Arc::clone(&self.exchange);
            let outcome = self
                .policy
                .call("place_trailing_stop", Idempotency::NonIdempotent, || {
                    exchange.place_trailing_stop(&request)
                })
                .await;

            match outcome {
                Ok(order_id) => {
                    info!(
                        id = %id,
                        order_id = %order_id,
                        pair = %entry.pair,
                        direction = %entry.direction,
                        volume = %entry.volume,
                        offset = %entry.trailing_offset_percent,
                        "Trailing stop placed"
                    );
                    self.record_placement(&id, order_id);
                    self.stats.orders_placed += 1;
                    if entry.direction == Direction::Sell {
                        if let (Some(view), Some(asset)) = (balances.as_mut(), base_asset(&entry.pair)) {
                            view.commit(&asset, entry.volume);
                        }
                    }
                }
                Err(e) if e.is_unknown_outcome() => {
                    self.stats.failed_calls += 1;
                    if let Some(state) = self.states.get_mut(&id) {
                        state.set_phase(EntryPhase::PlacementUnknown);
                    }
                    self.dirty.insert(id.clone());
                    warn!(id = %id, error = %e, "Placement outcome unknown, will check open orders");
                    // A fresh listing is needed to see this placement.
                    open_orders = None;
                }
                Err(e) => {
                    self.stats.failed_calls += 1;
                    error!(id = %id, error = %e, "Placement failed, will retry next tick");
                }
            }
        }
    }

    async fn reconcile(&mut self) {
        let mut tracked: Vec<(String, String)> = self
            .states
            .values()
            .filter(|s| s.has_open_order())
            .filter_map(|s| s.order_id.clone().map(|o| (o, s.id.clone())))
            .collect();
        if tracked.is_empty() {
            return;
        }
        tracked.sort();

        let order_ids: Vec<String> = tracked.iter().map(|(o, _)| o.clone()).collect();
        let exchange = Arc::clone(&self.exchange);
        let statuses = match self
            .policy
            .call("query_orders", Idempotency::Idempotent, || {
                exchange.query_orders(&order_ids)
            })
            .await
        {
            Ok(statuses) => statuses,
            Err(e) => {
                self.stats.failed_calls += 1;
                warn!(orders = order_ids.len(), error = %e, "Order status query failed");
                return;
            }
        };

        for (order_id, id) in tracked {
            let next = match statuses.get(&order_id) {
                Some(OrderStatus::Closed) => EntryPhase::Filled,
                Some(OrderStatus::Canceled) | Some(OrderStatus::Expired) => EntryPhase::CanceledExternal,
                Some(_) => continue,
                None => {
                    debug!(id = %id, order_id = %order_id, "Order missing from status query");
                    continue;
                }
            };
            if let Some(state) = self.states.get_mut(&id) {
                state.set_phase(next);
            }
            self.dirty.insert(id.clone());
            match next {
                EntryPhase::Filled => self.stats.fills += 1,
                _ => self.stats.external_cancels += 1,
            }
            info!(id = %id, order_id = %order_id, status = %next, "Order finished");
        }
    }

    async fn fetch_open_orders(&mut self) -> Option<Vec<OpenOrder>> {
        let exchange = Arc::clone(&self.exchange);
        match self
            .policy
            .call("open_orders", Idempotency::Idempotent, || exchange.open_orders())
            .await
        {
            Ok(orders) => Some(orders),
            Err(e) => {
                self.stats.failed_calls += 1;
                warn!(error = %e, "Open order listing failed");
                None
            }
        }
    }

    async fn cancel_on_exchange(&mut self, order_id: &str) -> Result<(), ExchangeError> {
        let exchange = Arc::clone(&self.exchange);
        let result = self
            .policy
            .call("cancel_order", Idempotency::Idempotent, || exchange.cancel_order(order_id))
            .await;
        if result.is_err() {
            self.stats.failed_calls += 1;
        }
        result
    }

    fn phase_of(&self, id: &str) -> Option<EntryPhase> {
        self.states.get(id).map(|s| s.last_status)
    }

    /// Record an acknowledged order and write it through immediately.
    fn record_placement(&mut self, id: &str, order_id: String) {
        if let Some(state) = self.states.get_mut(id) {
            state.mark_order_placed(order_id);
        }
        self.dirty.insert(id.to_string());
        if let Err(e) = self.persist_one(id) {
            error!(id = %id, error = %e, "Order placed but state write failed, will retry");
        }
    }

    fn mark_user_canceled(&mut self, id: &str) {
        if let Some(state) = self.states.get_mut(id) {
            state.set_phase(EntryPhase::CanceledByUser);
        }
        self.dirty.insert(id.to_string());
        self.stats.user_cancels += 1;
    }

    fn persist_one(&mut self, id: &str) -> Result<(), StoreError> {
        let Some(state) = self.states.get(id) else {
            return Ok(());
        };
        match self.state_store.upsert(std::iter::once(state)) {
            Ok(()) => {
                self.dirty.remove(id);
                Ok(())
            }
            Err(e) => {
                self.stats.failed_writes += 1;
                Err(e)
            }
        }
    }

    fn persist_dirty(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        let pending: Vec<&TriggerState> = self
            .dirty
            .iter()
            .filter_map(|id| self.states.get(id))
            .collect();
        match self.state_store.upsert(pending) {
            Ok(()) => self.dirty.clear(),
            Err(e) => {
                self.stats.failed_writes += 1;
                error!(pending = self.dirty.len(), error = %e, "State write failed, will retry next tick");
            }
        }
    }
}

fn is_sell(record: &ConfigRecord) -> bool {
    record.direction.parse::<Direction>() == Ok(Direction::Sell)
}

/// Equal in every column; the line may differ.
fn same_content(a: &ConfigRecord, b: &ConfigRecord) -> bool {
    a.id == b.id
        && a.pair == b.pair
        && a.threshold_price == b.threshold_price
        && a.threshold_type == b.threshold_type
        && a.direction == b.direction
        && a.volume == b.volume
        && a.trailing_offset_percent == b.trailing_offset_percent
        && a.enabled == b.enabled
}
