use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Bybit wire value: "Buy" | "Sell".
    pub fn as_bybit(self) -> &'static str {
        match self {
            Side::Long => "Buy",
            Side::Short => "Sell",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    New,
    Claimed,
    Expired,
    Rejected,
}

impl SignalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalStatus::New => "NEW",
            SignalStatus::Claimed => "CLAIMED",
            SignalStatus::Expired => "EXPIRED",
            SignalStatus::Rejected => "REJECTED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "CLAIMED" => SignalStatus::Claimed,
            "EXPIRED" => SignalStatus::Expired,
            "REJECTED" => SignalStatus::Rejected,
            _ => SignalStatus::New,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    Swing,
    Dynamic,
    Fast,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Swing => "SWING",
            SignalType::Dynamic => "DYNAMIC",
            SignalType::Fast => "FAST",
        }
    }
}

/// A persisted, normalized trading intent. Unique by `(source_channel, source_message_id)`.
#[derive(Clone, Debug)]
pub struct Signal {
    pub signal_id: i64,
    pub received_at: DateTime<Utc>,
    pub source_channel: String,
    pub source_message_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_mid: Decimal,
    pub entry_low: Option<Decimal>,
    pub entry_high: Option<Decimal>,
    pub targets: Vec<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub declared_leverage: Option<Decimal>,
    pub signal_type: Option<SignalType>,
    pub status: SignalStatus,
    pub re_entry_attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    PendingEntry,
    Partial,
    Open,
    Closing,
    Closed,
    Cancelled,
    Failed,
}

impl PositionState {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionState::PendingEntry => "PENDING_ENTRY",
            PositionState::Partial => "PARTIAL",
            PositionState::Open => "OPEN",
            PositionState::Closing => "CLOSING",
            PositionState::Closed => "CLOSED",
            PositionState::Cancelled => "CANCELLED",
            PositionState::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "PARTIAL" => PositionState::Partial,
            "OPEN" => PositionState::Open,
            "CLOSING" => PositionState::Closing,
            "CLOSED" => PositionState::Closed,
            "CANCELLED" => PositionState::Cancelled,
            "FAILED" => PositionState::Failed,
            _ => PositionState::PendingEntry,
        }
    }

    /// Is this a valid next state from `self`? Enforces the monotone graph in SPEC_FULL §3/§4.H.
    pub fn can_transition_to(self, next: PositionState) -> bool {
        use PositionState::*;
        match (self, next) {
            (PendingEntry, Partial | Open | Cancelled | Failed) => true,
            (Partial, Open | Closing | Failed) => true,
            (Open, Closing | Failed) => true,
            (Closing, Closed | Failed) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HedgeState {
    None,
    Hedged,
    HedgeClosed,
}

impl HedgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            HedgeState::None => "none",
            HedgeState::Hedged => "HEDGED",
            HedgeState::HedgeClosed => "HEDGE_CLOSED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "HEDGED" => HedgeState::Hedged,
            "HEDGE_CLOSED" => HedgeState::HedgeClosed,
            _ => HedgeState::None,
        }
    }
}

/// One `(threshold_pct, add_fraction)` scale already executed for a position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutedScale {
    pub scale_id: u32,
    pub executed_at: DateTime<Utc>,
    pub added_qty: Decimal,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PyramidState {
    pub executed_scales: Vec<ExecutedScale>,
}

impl PyramidState {
    pub fn total_added(&self) -> Decimal {
        self.executed_scales.iter().map(|s| s.added_qty).sum()
    }

    pub fn has_executed(&self, scale_id: u32) -> bool {
        self.executed_scales.iter().any(|s| s.scale_id == scale_id)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HedgeInfo {
    pub state: String, // mirrors HedgeState::as_str for serde simplicity
    pub hedge_position_id: Option<i64>,
    pub re_entry_attempts: u32,
}

impl HedgeInfo {
    pub fn state(&self) -> HedgeState {
        HedgeState::from_str(&self.state)
    }
}

/// The exchange-side exposure created by executing a signal.
#[derive(Clone, Debug)]
pub struct Position {
    pub position_id: i64,
    pub signal_id: i64,
    pub symbol: String,
    pub side: Side,
    pub planned_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_entry_price: Decimal,
    pub leverage: Decimal,
    pub initial_margin_plan: Decimal,
    pub sl_price: Decimal,
    pub tp_prices: Vec<Decimal>,
    pub tp_order_ids: Vec<String>,
    pub sl_order_id: Option<String>,
    pub entry_order_ids: Vec<String>,
    pub replacement_order_id: Option<String>,
    pub state: PositionState,
    pub pyramid_state: PyramidState,
    pub hedge: HedgeInfo,
    pub original_entry_price: Option<Decimal>,
    pub highest_favorable_price: Option<Decimal>,
    pub last_trailing_update: Option<DateTime<Utc>>,
    pub tp2_breakeven_applied: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Basis for every %-threshold (trailing, pyramid, hedge). Falls back to the planned entry
    /// until the first fill lands, since `original_entry_price` is only set on first fill.
    pub fn pct_basis(&self) -> Decimal {
        self.original_entry_price.unwrap_or(self.avg_entry_price)
    }

    /// Unrealized profit against `original_entry_price`, as a percentage (6.1 means 6.1%).
    pub fn unrealized_pct(&self, mark: Decimal) -> Decimal {
        let basis = self.pct_basis();
        if basis.is_zero() {
            return Decimal::ZERO;
        }
        let raw = (mark - basis) / basis * Decimal::ONE_HUNDRED;
        match self.side {
            Side::Long => raw,
            Side::Short => -raw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderRole {
    EntryA,
    EntryB,
    Replacement,
    TakeProfit,
    StopLoss,
    PyramidAdd,
    HedgeEntry,
}

impl OrderRole {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderRole::EntryA => "entry_a",
            OrderRole::EntryB => "entry_b",
            OrderRole::Replacement => "replacement",
            OrderRole::TakeProfit => "tp",
            OrderRole::StopLoss => "sl",
            OrderRole::PyramidAdd => "pyramid_add",
            OrderRole::HedgeEntry => "hedge_entry",
        }
    }
}

/// An append-only, time-ordered audit record. Never edited after being written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub signal_id: Option<i64>,
    pub position_id: Option<i64>,
    pub exchange_order_ids: Vec<String>,
    pub kind: String,
    pub fields: serde_json::Value,
}

impl TelemetryEvent {
    pub fn new(kind: &str, fields: serde_json::Value) -> Self {
        TelemetryEvent {
            timestamp: Utc::now(),
            signal_id: None,
            position_id: None,
            exchange_order_ids: Vec::new(),
            kind: kind.to_string(),
            fields,
        }
    }

    pub fn with_signal(mut self, signal_id: i64) -> Self {
        self.signal_id = Some(signal_id);
        self
    }

    pub fn with_position(mut self, position_id: i64) -> Self {
        self.position_id = Some(position_id);
        self
    }

    pub fn with_orders(mut self, ids: Vec<String>) -> Self {
        self.exchange_order_ids = ids;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_state_graph_is_monotone() {
        assert!(PositionState::PendingEntry.can_transition_to(PositionState::Partial));
        assert!(PositionState::Partial.can_transition_to(PositionState::Open));
        assert!(PositionState::Open.can_transition_to(PositionState::Closing));
        assert!(PositionState::Closing.can_transition_to(PositionState::Closed));
        assert!(!PositionState::Closed.can_transition_to(PositionState::Open));
        assert!(!PositionState::Open.can_transition_to(PositionState::PendingEntry));
    }

    #[test]
    fn unrealized_pct_flips_sign_for_short() {
        let mut p = sample_position(Side::Short, dec("100"));
        p.original_entry_price = Some(dec("100"));
        assert_eq!(p.unrealized_pct(dec("95")), dec("5"));
        p.side = Side::Long;
        assert_eq!(p.unrealized_pct(dec("95")), dec("-5"));
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn sample_position(side: Side, entry: Decimal) -> Position {
        Position {
            position_id: 1,
            signal_id: 1,
            symbol: "BTCUSDT".into(),
            side,
            planned_qty: Decimal::ONE,
            filled_qty: Decimal::ONE,
            avg_entry_price: entry,
            leverage: dec("10"),
            initial_margin_plan: dec("20"),
            sl_price: dec("90"),
            tp_prices: vec![],
            tp_order_ids: vec![],
            sl_order_id: None,
            entry_order_ids: vec![],
            replacement_order_id: None,
            state: PositionState::Open,
            pyramid_state: PyramidState::default(),
            hedge: HedgeInfo::default(),
            original_entry_price: Some(entry),
            highest_favorable_price: None,
            last_trailing_update: None,
            tp2_breakeven_applied: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
