//! Config entry validation.
//!
//! Errors mean the entry must never produce an order. Warnings are surfaced
//! to the operator but never block: an underfunded sell is a warning because
//! funds may arrive before the threshold is reached.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::models::{BalanceView, ConfigEntry, ConfigRecord, Direction, ThresholdType};

use super::balance::base_asset;

const MAX_ID_LEN: usize = 50;
const MAX_PAIR_LEN: usize = 20;
const MIN_PAIR_LEN: usize = 3;
/// Offset above which a directionally consistent entry will likely fill at once.
const CONSISTENT_OFFSET_WARN: Decimal = dec!(30);
/// Offset above which any entry is suspicious.
const EXTREME_OFFSET_WARN: Decimal = dec!(50);
/// A gap under this multiple of the offset leaves little room before the stop trails into a fill.
const GAP_WARN_MULTIPLIER: Decimal = dec!(2);

/// One finding, tied to the column it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub field: &'static str,
    pub message: String,
}

impl Issue {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Balance available for a sell entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceCheck {
    pub asset: String,
    pub required: Decimal,
    pub available: Decimal,
    pub sources: Vec<(String, Decimal)>,
}

impl BalanceCheck {
    pub fn is_sufficient(&self) -> bool {
        self.available >= self.required
    }

    pub fn describe_sources(&self) -> String {
        if self.sources.is_empty() {
            return "no wallet holds this asset".to_string();
        }
        self.sources
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Outcome of validating one config row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub id: String,
    pub line: usize,
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
    pub balance: Option<BalanceCheck>,

    /// Present when the row is structurally sound
    #[serde(skip)]
    pub entry: Option<ConfigEntry>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// The typed entry, only when there are no errors.
    pub fn valid_entry(&self) -> Option<&ConfigEntry> {
        self.entry.as_ref().filter(|_| self.is_valid())
    }
}

/// Market data an entry is checked against. Every part is optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketContext<'a> {
    /// `None` skips the price checks; a map missing the pair warns
    pub prices: Option<&'a HashMap<String, Decimal>>,
    pub balances: Option<&'a BalanceView>,
    pub symbols: Option<&'a HashSet<String>>,
}

/// Stateless config validator.
#[derive(Debug, Clone, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Validate every record, flagging ids that appear more than once.
    pub fn validate_all(
        &self,
        records: &[ConfigRecord],
        market: &MarketContext<'_>,
    ) -> Vec<ValidationResult> {
        let mut results: Vec<ValidationResult> = records
            .iter()
            .map(|record| self.validate_entry(record, market))
            .collect();
        flag_duplicates(records, &mut results);
        results
    }

    pub fn validate_entry(
        &self,
        record: &ConfigRecord,
        market: &MarketContext<'_>,
    ) -> ValidationResult {
        let mut result = ValidationResult {
            id: record.id.clone(),
            line: record.line,
            errors: Vec::new(),
            warnings: Vec::new(),
            balance: None,
            entry: None,
        };

        check_id(&record.id, &mut result);
        check_pair(&record.pair, market.symbols, &mut result);
        let threshold_price = positive_decimal("threshold_price", &record.threshold_price, &mut result);
        let threshold_type = parse_enum::<ThresholdType>("threshold_type", &record.threshold_type, &mut result);
        let direction = parse_enum::<Direction>("direction", &record.direction, &mut result);
        let volume = positive_decimal("volume", &record.volume, &mut result);
        let offset = positive_decimal("trailing_offset_percent", &record.trailing_offset_percent, &mut result);
        if let Some(o) = offset {
            if o >= dec!(100) {
                result.errors.push(Issue::new(
                    "trailing_offset_percent",
                    format!("trailing offset {}% must be below 100%", o),
                ));
            }
        }

        if !result.errors.is_empty() {
            return result;
        }
        let (Some(threshold_price), Some(threshold_type), Some(direction), Some(volume), Some(offset)) =
            (threshold_price, threshold_type, direction, volume, offset)
        else {
            return result;
        };

        let entry = ConfigEntry {
            id: record.id.clone(),
            pair: record.pair.clone(),
            threshold_price,
            threshold_type,
            direction,
            volume,
            trailing_offset_percent: offset,
            enabled: record.enabled,
        };

        check_logic(&entry, &mut result);
        check_market(&entry, market.prices, &mut result);
        if entry.direction == Direction::Sell {
            check_sell_balance(&entry, market.balances, &mut result);
        }

        result.entry = Some(entry);
        result
    }
}

/// Add a duplicate-id error to every result whose id repeats in `records`.
///
/// `results` must be in the same order as `records`.
pub(crate) fn flag_duplicates(records: &[ConfigRecord], results: &mut [ValidationResult]) {
    let mut lines_by_id: HashMap<&str, Vec<usize>> = HashMap::new();
    for record in records {
        lines_by_id.entry(&record.id).or_default().push(record.line);
    }

    for (record, result) in records.iter().zip(results.iter_mut()) {
        let Some(lines) = lines_by_id.get(record.id.as_str()).filter(|l| l.len() > 1) else {
            continue;
        };
        let others: Vec<String> = lines
            .iter()
            .filter(|l| **l != record.line)
            .map(|l| l.to_string())
            .collect();
        result.errors.insert(
            0,
            Issue::new(
                "id",
                format!("duplicate id '{}' (also on line {})", record.id, others.join(", ")),
            ),
        );
    }
}

/// Balance available for a sell of `entry`, or `None` when the base asset is unknown.
pub fn balance_check(entry: &ConfigEntry, balances: &BalanceView) -> Option<BalanceCheck> {
    let asset = base_asset(&entry.pair)?;
    let (available, sources) = balances
        .get(&asset)
        .map(|b| (b.total, b.sources.clone()))
        .unwrap_or((Decimal::ZERO, Vec::new()));
    Some(BalanceCheck {
        asset,
        required: entry.volume,
        available,
        sources,
    })
}

fn check_id(id: &str, result: &mut ValidationResult) {
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        result.errors.push(Issue::new(
            "id",
            format!("id '{}' may only contain letters, digits, '_' and '-'", id),
        ));
    }
    if id.len() > MAX_ID_LEN {
        result.warnings.push(Issue::new(
            "id",
            format!("id is {} characters; keep it under {}", id.len(), MAX_ID_LEN),
        ));
    }
}

fn check_pair(pair: &str, symbols: Option<&HashSet<String>>, result: &mut ValidationResult) {
    if pair.is_empty() {
        result.errors.push(Issue::new("pair", "required field is empty"));
        return;
    }
    let well_formed = (MIN_PAIR_LEN..=MAX_PAIR_LEN).contains(&pair.len())
        && pair.matches('/').count() <= 1
        && !pair.starts_with('/')
        && !pair.ends_with('/')
        && pair
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '/');
    if !well_formed {
        result.errors.push(Issue::new(
            "pair",
            format!("'{}' is not a valid pair symbol (uppercase letters and digits)", pair),
        ));
        return;
    }

    match symbols {
        Some(known) if !known.contains(pair) => {
            result
                .errors
                .push(Issue::new("pair", format!("unknown pair '{}'", pair)));
        }
        Some(_) => {}
        None => result.warnings.push(Issue::new(
            "pair",
            "pair list unavailable; symbol not verified",
        )),
    }
}

fn positive_decimal(
    field: &'static str,
    raw: &str,
    result: &mut ValidationResult,
) -> Option<Decimal> {
    if raw.is_empty() {
        result.errors.push(Issue::new(field, "required field is empty"));
        return None;
    }
    match Decimal::from_str(raw) {
        Ok(v) if v > Decimal::ZERO => Some(v),
        Ok(v) => {
            result
                .errors
                .push(Issue::new(field, format!("must be positive, got {}", v)));
            None
        }
        Err(_) => {
            result
                .errors
                .push(Issue::new(field, format!("'{}' is not a decimal number", raw)));
            None
        }
    }
}

fn parse_enum<T: FromStr<Err = String>>(
    field: &'static str,
    raw: &str,
    result: &mut ValidationResult,
) -> Option<T> {
    if raw.is_empty() {
        result.errors.push(Issue::new(field, "required field is empty"));
        return None;
    }
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(message) => {
            result.errors.push(Issue::new(field, message));
            None
        }
    }
}

fn check_logic(entry: &ConfigEntry, result: &mut ValidationResult) {
    let offset = entry.trailing_offset_percent;
    let consistent = match (entry.threshold_type, entry.direction) {
        (ThresholdType::Above, Direction::Sell) | (ThresholdType::Below, Direction::Buy) => true,
        (ThresholdType::Above, Direction::Buy) => {
            result.warnings.push(Issue::new(
                "direction",
                "buying after the price rises above the threshold is unusual",
            ));
            false
        }
        (ThresholdType::Below, Direction::Sell) => {
            result.warnings.push(Issue::new(
                "direction",
                "selling after the price falls below the threshold is unusual",
            ));
            false
        }
    };

    if consistent && offset > CONSISTENT_OFFSET_WARN {
        result.warnings.push(Issue::new(
            "trailing_offset_percent",
            format!(
                "offset {}% exceeds {}%; the order may fill almost immediately",
                offset, CONSISTENT_OFFSET_WARN
            ),
        ));
    }
    if offset > EXTREME_OFFSET_WARN {
        result.warnings.push(Issue::new(
            "trailing_offset_percent",
            format!("offset {}% is unusually large", offset),
        ));
    }
}

fn check_market(
    entry: &ConfigEntry,
    prices: Option<&HashMap<String, Decimal>>,
    result: &mut ValidationResult,
) {
    let Some(prices) = prices else {
        return;
    };
    let price = match prices.get(&entry.pair) {
        Some(p) if *p > Decimal::ZERO => *p,
        _ => {
            result.warnings.push(Issue::new(
                "threshold_price",
                "current price unavailable; market checks skipped",
            ));
            return;
        }
    };

    let threshold = entry.threshold_price;
    if entry.is_threshold_met(price) {
        result.errors.push(Issue::new(
            "threshold_price",
            format!(
                "threshold {} already met ({} current price {})",
                threshold, entry.threshold_type, price
            ),
        ));
        return;
    }

    let gap = ((threshold - price).abs() / price * dec!(100)).round_dp(4);
    let offset = entry.trailing_offset_percent;
    if gap <= offset {
        result.errors.push(Issue::new(
            "trailing_offset_percent",
            format!(
                "gap of {}% between threshold and price {} does not exceed the {}% offset",
                gap, price, offset
            ),
        ));
    } else if gap < offset * GAP_WARN_MULTIPLIER {
        result.warnings.push(Issue::new(
            "trailing_offset_percent",
            format!(
                "gap of {}% is less than twice the {}% offset",
                gap, offset
            ),
        ));
    }
}

fn check_sell_balance(
    entry: &ConfigEntry,
    balances: Option<&BalanceView>,
    result: &mut ValidationResult,
) {
    let Some(balances) = balances else {
        result
            .warnings
            .push(Issue::new("volume", "balance unavailable; funding not verified"));
        return;
    };
    let Some(check) = balance_check(entry, balances) else {
        result.warnings.push(Issue::new(
            "pair",
            format!("cannot determine base asset of '{}'", entry.pair),
        ));
        return;
    };

    if !check.is_sufficient() {
        result.warnings.push(Issue::new(
            "volume",
            format!(
                "insufficient {}: need {}, have {} ({})",
                check.asset,
                check.required,
                check.available,
                check.describe_sources()
            ),
        ));
    }
    result.balance = Some(check);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnabledStatus;
    use crate::trading::balance::aggregate;

    fn record(id: &str, threshold: &str, kind: &str, direction: &str, offset: &str) -> ConfigRecord {
        ConfigRecord {
            line: 2,
            id: id.to_string(),
            pair: "XXBTZUSD".to_string(),
            threshold_price: threshold.to_string(),
            threshold_type: kind.to_string(),
            direction: direction.to_string(),
            volume: "0.01".to_string(),
            trailing_offset_percent: offset.to_string(),
            enabled: EnabledStatus::True,
        }
    }

    fn prices(price: Decimal) -> HashMap<String, Decimal> {
        HashMap::from([("XXBTZUSD".to_string(), price)])
    }

    fn symbols() -> HashSet<String> {
        HashSet::from(["XXBTZUSD".to_string(), "XBTUSD".to_string()])
    }

    fn funded() -> BalanceView {
        aggregate(&HashMap::from([("XXBT".to_string(), "1.0".to_string())]))
    }

    #[test]
    fn test_gap_rule() {
        let validator = Validator::new();
        let prices = prices(dec!(50000));
        let symbols = symbols();
        let balances = funded();
        let market = MarketContext {
            prices: Some(&prices),
            balances: Some(&balances),
            symbols: Some(&symbols),
        };

        let wide = validator.validate_entry(&record("a", "51000", "above", "sell", "5"), &market);
        assert!(!wide.is_valid());
        assert!(wide.errors.iter().any(|e| e.field == "trailing_offset_percent"));

        let ok = validator.validate_entry(&record("a", "51000", "above", "sell", "1"), &market);
        assert!(ok.is_valid(), "unexpected errors: {:?}", ok.errors);
        assert!(ok.warnings.is_empty(), "unexpected warnings: {:?}", ok.warnings);
    }

    #[test]
    fn test_gap_under_twice_offset_warns() {
        let prices = prices(dec!(50000));
        let market = MarketContext {
            prices: Some(&prices),
            ..Default::default()
        };
        let result = Validator::new().validate_entry(&record("a", "51000", "above", "buy", "1.5"), &market);
        assert!(result.is_valid());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("less than twice")));
    }

    #[test]
    fn test_threshold_already_met() {
        let prices = prices(dec!(50000));
        let market = MarketContext {
            prices: Some(&prices),
            ..Default::default()
        };
        let above = Validator::new().validate_entry(&record("a", "49000", "above", "sell", "1"), &market);
        assert!(above.errors.iter().any(|e| e.message.contains("already met")));

        let below = Validator::new().validate_entry(&record("b", "50000", "below", "buy", "1"), &market);
        assert!(below.errors.iter().any(|e| e.message.contains("already met")));
    }

    #[test]
    fn test_structural_errors_are_collected() {
        let mut bad = record("bad id!", "-5", "sideways", "hold", "abc");
        bad.volume = String::new();
        let result = Validator::new().validate_entry(&bad, &MarketContext::default());

        let fields: Vec<_> = result.errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "id",
                "threshold_price",
                "threshold_type",
                "direction",
                "volume",
                "trailing_offset_percent"
            ]
        );
        assert!(result.entry.is_none());
    }

    #[test]
    fn test_unknown_pair_and_missing_cache() {
        let mut rec = record("a", "60000", "above", "sell", "1");
        rec.pair = "FOOBAR".to_string();
        let symbols = symbols();
        let with_cache = Validator::new().validate_entry(
            &rec,
            &MarketContext {
                symbols: Some(&symbols),
                ..Default::default()
            },
        );
        assert!(with_cache.errors.iter().any(|e| e.message.contains("unknown pair")));

        let without_cache = Validator::new().validate_entry(&rec, &MarketContext::default());
        assert!(without_cache.is_valid());
        assert!(without_cache.warnings.iter().any(|w| w.field == "pair"));

        rec.pair = "xbt-usd".to_string();
        let malformed = Validator::new().validate_entry(&rec, &MarketContext::default());
        assert!(malformed.errors.iter().any(|e| e.field == "pair"));
    }

    #[test]
    fn test_insufficient_balance_is_warning_with_sources() {
        let prices = prices(dec!(50000));
        let balances = aggregate(&HashMap::from([
            ("XXBT".to_string(), "0.0".to_string()),
            ("XBT.F".to_string(), "0.005".to_string()),
        ]));
        let market = MarketContext {
            prices: Some(&prices),
            balances: Some(&balances),
            ..Default::default()
        };

        let result = Validator::new().validate_entry(&record("a", "60000", "above", "sell", "1"), &market);
        assert!(result.is_valid());
        let warning = result
            .warnings
            .iter()
            .find(|w| w.message.starts_with("insufficient"))
            .expect("balance warning");
        assert!(warning.message.contains("XBT.F=0.005"));
        assert!(warning.message.contains("XXBT=0.0"));

        let check = result.balance.expect("balance reported");
        assert_eq!(check.asset, "XBT");
        assert_eq!(check.available, dec!(0.005));
        assert!(!check.is_sufficient());
    }

    #[test]
    fn test_price_checks_skipped_without_prices() {
        let rec = record("a", "49000", "above", "sell", "1");
        let skipped = Validator::new().validate_entry(&rec, &MarketContext::default());
        assert!(skipped.is_valid());
        assert!(!skipped.warnings.iter().any(|w| w.field == "threshold_price"));

        let empty = HashMap::new();
        let unavailable = Validator::new().validate_entry(
            &rec,
            &MarketContext {
                prices: Some(&empty),
                ..Default::default()
            },
        );
        assert!(unavailable.is_valid());
        assert!(unavailable.warnings.iter().any(|w| w.message.contains("unavailable")));
    }

    #[test]
    fn test_logic_warnings() {
        let market = MarketContext::default();
        let unusual = Validator::new().validate_entry(&record("a", "60000", "above", "buy", "1"), &market);
        assert!(unusual.warnings.iter().any(|w| w.field == "direction"));

        let wide = Validator::new().validate_entry(&record("a", "60000", "above", "sell", "35"), &market);
        assert!(wide.warnings.iter().any(|w| w.message.contains("fill almost immediately")));

        let extreme = Validator::new().validate_entry(&record("a", "60000", "above", "buy", "60"), &market);
        assert!(extreme.warnings.iter().any(|w| w.message.contains("unusually large")));
        assert!(!extreme.warnings.iter().any(|w| w.message.contains("fill almost immediately")));
    }

    #[test]
    fn test_duplicate_ids_flagged() {
        let mut second = record("dup", "60000", "above", "sell", "1");
        second.line = 5;
        let records = vec![record("dup", "60000", "above", "sell", "1"), second];

        let results = Validator::new().validate_all(&records, &MarketContext::default());
        assert!(results.iter().all(|r| !r.is_valid()));
        assert!(results[0].errors[0].message.contains("line 5"));
        assert!(results[1].errors[0].message.contains("line 2"));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let prices = prices(dec!(50000));
        let symbols = symbols();
        let balances = funded();
        let market = MarketContext {
            prices: Some(&prices),
            balances: Some(&balances),
            symbols: Some(&symbols),
        };
        let records = vec![
            record("a", "51000", "above", "sell", "1"),
            record("b", "45000", "below", "buy", "3"),
        ];

        let validator = Validator::new();
        let first = validator.validate_all(&records, &market);
        let second = validator.validate_all(&records, &market);
        assert_eq!(first, second);
        assert!(first.iter().all(|r| r.is_valid()));
    }
}
