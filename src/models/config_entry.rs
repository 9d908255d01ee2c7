//! Config entry model: one conditional trailing-stop rule.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which side of the threshold activates the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdType {
    Above,
    Below,
}

impl ThresholdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdType::Above => "above",
            ThresholdType::Below => "below",
        }
    }

    /// Whether `price` has reached `threshold` from this side.
    pub fn is_crossed(&self, price: Decimal, threshold: Decimal) -> bool {
        match self {
            ThresholdType::Above => price >= threshold,
            ThresholdType::Below => price <= threshold,
        }
    }
}

impl FromStr for ThresholdType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "above" => Ok(ThresholdType::Above),
            "below" => Ok(ThresholdType::Below),
            other => Err(format!("unknown threshold type '{}'", other)),
        }
    }
}

impl fmt::Display for ThresholdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Direction::Buy),
            "sell" => Ok(Direction::Sell),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `enabled` column of a config row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnabledStatus {
    True,
    False,
    Paused,
    Canceled,
}

/// Effect of moving an entry from one enabled status to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    NoOp,
    Activate,
    Deactivate,
    Cancel,
}

impl EnabledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnabledStatus::True => "true",
            EnabledStatus::False => "false",
            EnabledStatus::Paused => "paused",
            EnabledStatus::Canceled => "canceled",
        }
    }

    /// Only `true` rows are monitored.
    pub fn is_active(&self) -> bool {
        matches!(self, EnabledStatus::True)
    }

    pub fn transition_to(&self, to: EnabledStatus) -> StatusTransition {
        use EnabledStatus::*;
        match (self, to) {
            (a, b) if *a == b => StatusTransition::NoOp,
            (_, Canceled) => StatusTransition::Cancel,
            (_, True) => StatusTransition::Activate,
            (True, False) | (True, Paused) => StatusTransition::Deactivate,
            // moving between two inactive states changes nothing for the monitor
            (_, False) | (_, Paused) => StatusTransition::NoOp,
        }
    }
}

impl FromStr for EnabledStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(EnabledStatus::True),
            "false" => Ok(EnabledStatus::False),
            "paused" => Ok(EnabledStatus::Paused),
            "canceled" => Ok(EnabledStatus::Canceled),
            other => Err(format!(
                "invalid enabled value '{}' (expected true, false, paused or canceled)",
                other
            )),
        }
    }
}

impl fmt::Display for EnabledStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A config row as read from disk, with numeric and enum columns still raw.
///
/// Only `id` and `enabled` are interpreted by the store; the rest is checked
/// by the validator, which turns a clean record into a [`ConfigEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRecord {
    /// 1-based line number in the file
    pub line: usize,
    pub id: String,
    pub pair: String,
    pub threshold_price: String,
    pub threshold_type: String,
    pub direction: String,
    pub volume: String,
    pub trailing_offset_percent: String,
    pub enabled: EnabledStatus,
}

/// A structurally valid config entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub id: String,
    pub pair: String,
    pub threshold_price: Decimal,
    pub threshold_type: ThresholdType,
    pub direction: Direction,
    pub volume: Decimal,
    pub trailing_offset_percent: Decimal,
    pub enabled: EnabledStatus,
}

impl ConfigEntry {
    /// Whether the current price has crossed this entry's threshold.
    pub fn is_threshold_met(&self, price: Decimal) -> bool {
        self.threshold_type.is_crossed(price, self.threshold_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_enabled_status_parsing() {
        assert_eq!("TRUE".parse::<EnabledStatus>(), Ok(EnabledStatus::True));
        assert_eq!(" paused ".parse::<EnabledStatus>(), Ok(EnabledStatus::Paused));
        assert!("yes".parse::<EnabledStatus>().is_err());
        assert!("cancelled".parse::<EnabledStatus>().is_err());
    }

    #[test]
    fn test_transition_table() {
        use EnabledStatus::*;
        assert_eq!(True.transition_to(True), StatusTransition::NoOp);
        assert_eq!(True.transition_to(Paused), StatusTransition::Deactivate);
        assert_eq!(Paused.transition_to(True), StatusTransition::Activate);
        assert_eq!(False.transition_to(Canceled), StatusTransition::Cancel);
        assert_eq!(Paused.transition_to(False), StatusTransition::NoOp);
    }

    #[test]
    fn test_threshold_crossing_is_inclusive() {
        assert!(ThresholdType::Above.is_crossed(dec!(100), dec!(100)));
        assert!(!ThresholdType::Above.is_crossed(dec!(99.99), dec!(100)));
        assert!(ThresholdType::Below.is_crossed(dec!(100), dec!(100)));
        assert!(!ThresholdType::Below.is_crossed(dec!(100.01), dec!(100)));
    }
}
