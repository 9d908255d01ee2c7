//! Persisted per-entry trigger state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of one config entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPhase {
    Idle,
    ThresholdMet,
    /// Placement was sent but its outcome is unknown (timeout or dropped connection).
    PlacementUnknown,
    OrderPlaced,
    Filled,
    CanceledExternal,
    CanceledByUser,
}

impl EntryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPhase::Idle => "idle",
            EntryPhase::ThresholdMet => "threshold_met",
            EntryPhase::PlacementUnknown => "placement_unknown",
            EntryPhase::OrderPlaced => "order_placed",
            EntryPhase::Filled => "filled",
            EntryPhase::CanceledExternal => "canceled_external",
            EntryPhase::CanceledByUser => "canceled_by_user",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryPhase::Filled | EntryPhase::CanceledExternal | EntryPhase::CanceledByUser
        )
    }

    /// Allowed engine transitions. External edits to the state file bypass this.
    pub fn can_transition_to(&self, next: EntryPhase) -> bool {
        use EntryPhase::*;
        matches!(
            (self, next),
            (Idle, ThresholdMet)
                | (ThresholdMet, OrderPlaced)
                | (ThresholdMet, PlacementUnknown)
                | (PlacementUnknown, OrderPlaced)
                | (PlacementUnknown, ThresholdMet)
                | (OrderPlaced, Filled)
                | (OrderPlaced, CanceledExternal)
                | (OrderPlaced, CanceledByUser)
        )
    }
}

impl FromStr for EntryPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "idle" => Ok(EntryPhase::Idle),
            "threshold_met" => Ok(EntryPhase::ThresholdMet),
            "placement_unknown" => Ok(EntryPhase::PlacementUnknown),
            "order_placed" => Ok(EntryPhase::OrderPlaced),
            "filled" => Ok(EntryPhase::Filled),
            "canceled_external" => Ok(EntryPhase::CanceledExternal),
            "canceled_by_user" => Ok(EntryPhase::CanceledByUser),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

impl fmt::Display for EntryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger and order state for one config id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerState {
    pub id: String,

    /// Set once an order has been acknowledged by the exchange. Never cleared by the engine.
    pub triggered: bool,

    pub order_id: Option<String>,

    pub triggered_at: Option<DateTime<Utc>>,

    /// Price observed when the threshold was crossed
    pub trigger_price: Option<Decimal>,

    pub last_status: EntryPhase,

    pub updated_at: DateTime<Utc>,
}

impl TriggerState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            triggered: false,
            order_id: None,
            triggered_at: None,
            trigger_price: None,
            last_status: EntryPhase::Idle,
            updated_at: Utc::now(),
        }
    }

    /// Whether the engine is tracking a live order for this entry.
    pub fn has_open_order(&self) -> bool {
        self.last_status == EntryPhase::OrderPlaced && self.order_id.is_some()
    }

    pub(crate) fn set_phase(&mut self, next: EntryPhase) {
        debug_assert!(
            self.last_status.can_transition_to(next),
            "illegal transition {} -> {}",
            self.last_status,
            next
        );
        self.last_status = next;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_threshold_met(&mut self, price: Decimal) {
        self.trigger_price = Some(price);
        self.set_phase(EntryPhase::ThresholdMet);
    }

    pub(crate) fn mark_order_placed(&mut self, order_id: String) {
        self.triggered = true;
        self.order_id = Some(order_id);
        self.triggered_at = Some(Utc::now());
        self.set_phase(EntryPhase::OrderPlaced);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_phase_round_trip_names() {
        for phase in [
            EntryPhase::Idle,
            EntryPhase::ThresholdMet,
            EntryPhase::PlacementUnknown,
            EntryPhase::OrderPlaced,
            EntryPhase::Filled,
            EntryPhase::CanceledExternal,
            EntryPhase::CanceledByUser,
        ] {
            assert_eq!(phase.as_str().parse::<EntryPhase>(), Ok(phase));
        }
        assert_eq!("".parse::<EntryPhase>(), Ok(EntryPhase::Idle));
    }

    #[test]
    fn test_order_placed_sets_triggered() {
        let mut state = TriggerState::new("btc_1");
        state.mark_threshold_met(dec!(51000));
        state.mark_order_placed("OABC-123".to_string());

        assert!(state.triggered);
        assert!(state.has_open_order());
        assert!(state.triggered_at.is_some());
        assert_eq!(state.trigger_price, Some(dec!(51000)));
    }

    #[test]
    fn test_terminal_phases_do_not_transition() {
        assert!(!EntryPhase::Filled.can_transition_to(EntryPhase::OrderPlaced));
        assert!(!EntryPhase::CanceledByUser.can_transition_to(EntryPhase::Idle));
        assert!(!EntryPhase::Idle.can_transition_to(EntryPhase::OrderPlaced));
    }
}
