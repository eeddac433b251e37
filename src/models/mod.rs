use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// OHLCV candlestick data for one closed bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Direction of a detected chart signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalKind {
    EnterLong,
    EnterShort,
    Exit,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::EnterLong => "enter_long",
            SignalKind::EnterShort => "enter_short",
            SignalKind::Exit => "exit",
        };
        f.write_str(s)
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enter_long" => Ok(SignalKind::EnterLong),
            "enter_short" => Ok(SignalKind::EnterShort),
            "exit" => Ok(SignalKind::Exit),
            other => Err(format!("unknown signal kind: {}", other)),
        }
    }
}

/// An immutable detection event produced by the signal detector.
///
/// `id` is None until the row is persisted. The `processed` flag is flipped
/// exactly once, after the decision gateway has recorded its verdict.
#[derive(Debug, Clone)]
pub struct Signal {
    pub id: Option<i64>,
    pub symbol_pair: String,
    pub kind: SignalKind,
    pub bar_ts: DateTime<Utc>,
    pub price: f64,
    pub atr: Option<f64>,
    pub ema_metrics: String,
    pub confirmation_metrics: String,
    pub strategy: String,
    pub detected_at: DateTime<Utc>,
    pub processed: bool,
}

/// Trading action recommended by the reasoning engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
    Close,
}

impl TradeAction {
    pub fn is_entry(&self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::Sell)
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::Hold => "hold",
            TradeAction::Close => "close",
        };
        f.write_str(s)
    }
}

impl FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeAction::Buy),
            "sell" => Ok(TradeAction::Sell),
            "hold" => Ok(TradeAction::Hold),
            "close" => Ok(TradeAction::Close),
            other => Err(format!("unknown trade action: {}", other)),
        }
    }
}

/// Conviction label attached to a decision
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Confidence::Low),
            "medium" => Ok(Confidence::Medium),
            "high" => Ok(Confidence::High),
            other => Err(format!("unknown confidence label: {}", other)),
        }
    }
}

/// Origin of a decision row
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Ai,
    RuleOverride,
    Degraded,
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionSource::Ai => "ai",
            DecisionSource::RuleOverride => "rule_override",
            DecisionSource::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

impl FromStr for DecisionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai" => Ok(DecisionSource::Ai),
            "rule_override" => Ok(DecisionSource::RuleOverride),
            "degraded" => Ok(DecisionSource::Degraded),
            other => Err(format!("unknown decision source: {}", other)),
        }
    }
}

/// Result of the reasoning step for one signal, persisted in full before
/// any execution is attempted.
#[derive(Debug, Clone)]
pub struct AiDecision {
    pub id: Option<i64>,
    pub signal_id: i64,
    pub user_config_id: Option<i64>,
    pub symbol_pair: String,
    pub fast_timeframe: String,
    pub slow_timeframe: String,
    pub strategy: String,
    pub signal_summary: String,
    pub action: TradeAction,
    pub confidence: Confidence,
    pub risk_score: Option<f64>,
    pub position_size_pct: Option<f64>,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub rationale: String,
    pub key_factors: String,
    pub source: DecisionSource,
    pub model: Option<String>,
    pub tools_used: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal outcome of running one signal through the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    /// An entry order was submitted.
    Executed { trade_id: Uuid },
    /// Decision was valid but no order should be placed.
    Rejected(String),
    /// Reasoning engine failed or returned invalid data; recorded as a
    /// synthetic hold with zero exchange interaction.
    Degraded(String),
}

/// Side of an entry order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => f.write_str("buy"),
            TradeSide::Sell => f.write_str("sell"),
        }
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(format!("unknown trade side: {}", other)),
        }
    }
}

/// Lifecycle state of a trade.
///
/// Transitions move forward only: PendingEntry -> PartiallyFilled -> Open ->
/// ExitPending -> Closed. Cancelled and Failed are terminal alternates
/// reachable from any live state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingEntry,
    PartiallyFilled,
    Open,
    ExitPending,
    Closed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Closed | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::PendingEntry => 0,
            OrderStatus::PartiallyFilled => 1,
            OrderStatus::Open => 2,
            OrderStatus::ExitPending => 3,
            OrderStatus::Closed | OrderStatus::Cancelled | OrderStatus::Failed => 4,
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, OrderStatus::Cancelled | OrderStatus::Failed) {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::PendingEntry => "pending_entry",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Open => "open",
            OrderStatus::ExitPending => "exit_pending",
            OrderStatus::Closed => "closed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_entry" => Ok(OrderStatus::PendingEntry),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "open" => Ok(OrderStatus::Open),
            "exit_pending" => Ok(OrderStatus::ExitPending),
            "closed" => Ok(OrderStatus::Closed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Execution and lifecycle record for one position
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: Uuid,
    pub entry_order_id: String,
    pub client_order_id: String,
    pub signal_id: i64,
    pub ai_decision_id: i64,
    pub user_config_id: Option<i64>,
    pub symbol_pair: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub initial_stop_loss: f64,
    pub take_profit: Option<f64>,
    pub order_status: OrderStatus,
    pub opened_at: DateTime<Utc>,
    /// When `order_status` last changed. Staleness is measured from here,
    /// so a healthy long-held position is never flagged.
    pub status_changed_at: DateTime<Utc>,
    pub entry_fill_price: Option<f64>,
    pub entry_fill_quantity: Option<f64>,
    pub exit_algo_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub amended_stop_loss: Option<f64>,
    pub exit_fill_price: Option<f64>,
    pub exit_fill_quantity: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// Stop price currently protecting the position.
    pub fn effective_stop_loss(&self) -> f64 {
        self.amended_stop_loss.unwrap_or(self.initial_stop_loss)
    }

    /// Quantity the protective order must cover. For partial fills this is
    /// the filled amount, not the requested amount.
    pub fn protected_quantity(&self) -> f64 {
        self.entry_fill_quantity.unwrap_or(self.quantity)
    }
}

/// Named strategy parameterization, versioned in the database
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub id: Option<i64>,
    pub ai_persona: String,
    pub fast_window: usize,
    pub slow_window: usize,
    pub confirmation_indicator_window: usize,
    pub atr_window: usize,
    pub atr_multiplier: f64,
    pub usage: bool,
    pub added_at: DateTime<Utc>,
    pub discontinued_at: Option<DateTime<Utc>>,
}

impl UserConfig {
    /// Bars required before the detector can emit anything. A few extra
    /// bars let the EMAs converge past their seed values.
    pub fn min_bars_required(&self) -> usize {
        self.fast_window
            .max(self.slow_window)
            .max(self.confirmation_indicator_window)
            .max(self.atr_window + 1)
            + 5
    }
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            id: None,
            ai_persona: "seasoned swing trader".to_string(),
            fast_window: 9,
            slow_window: 21,
            confirmation_indicator_window: 9,
            atr_window: 7,
            atr_multiplier: 3.0,
            usage: true,
            added_at: Utc::now(),
            discontinued_at: None,
        }
    }
}

/// Per-symbol trading permission with a portfolio allocation cap
#[derive(Debug, Clone)]
pub struct SymbolConfig {
    pub id: Option<i64>,
    pub symbol_pair: String,
    pub max_allocation: f64,
    pub usage: bool,
    pub added_at: DateTime<Utc>,
    pub discontinued_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_forward_transitions() {
        assert!(OrderStatus::PendingEntry.can_transition_to(OrderStatus::Open));
        assert!(OrderStatus::PendingEntry.can_transition_to(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::Open.can_transition_to(OrderStatus::ExitPending));
        assert!(OrderStatus::ExitPending.can_transition_to(OrderStatus::Closed));

        // No going backwards
        assert!(!OrderStatus::Open.can_transition_to(OrderStatus::PendingEntry));
        assert!(!OrderStatus::ExitPending.can_transition_to(OrderStatus::Open));

        // Terminal states are final
        assert!(!OrderStatus::Closed.can_transition_to(OrderStatus::Open));
        assert!(!OrderStatus::Failed.can_transition_to(OrderStatus::PendingEntry));
    }

    #[test]
    fn test_cancellation_from_any_live_state() {
        assert!(OrderStatus::PendingEntry.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Open.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::ExitPending.can_transition_to(OrderStatus::Failed));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            OrderStatus::PendingEntry,
            OrderStatus::PartiallyFilled,
            OrderStatus::Open,
            OrderStatus::ExitPending,
            OrderStatus::Closed,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            let parsed: OrderStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_signal_kind_round_trip() {
        for kind in [SignalKind::EnterLong, SignalKind::EnterShort, SignalKind::Exit] {
            let parsed: SignalKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_min_bars_required() {
        let config = UserConfig::default();
        // slow window (21) dominates
        assert_eq!(config.min_bars_required(), 26);
    }

    #[test]
    fn test_effective_stop_loss_prefers_amended() {
        let mut trade = sample_trade();
        assert_eq!(trade.effective_stop_loss(), 58800.0);
        trade.amended_stop_loss = Some(59500.0);
        assert_eq!(trade.effective_stop_loss(), 59500.0);
    }

    #[test]
    fn test_protected_quantity_uses_fill() {
        let mut trade = sample_trade();
        trade.quantity = 0.1;
        trade.entry_fill_quantity = Some(0.04);
        assert_eq!(trade.protected_quantity(), 0.04);
        trade.entry_fill_quantity = None;
        assert_eq!(trade.protected_quantity(), 0.1);
    }

    fn sample_trade() -> Trade {
        Trade {
            id: Uuid::new_v4(),
            entry_order_id: "1001".to_string(),
            client_order_id: "c1001".to_string(),
            signal_id: 1,
            ai_decision_id: 1,
            user_config_id: None,
            symbol_pair: "BTC-EUR".to_string(),
            side: TradeSide::Buy,
            quantity: 0.1,
            entry_price: 60000.0,
            initial_stop_loss: 58800.0,
            take_profit: None,
            order_status: OrderStatus::Open,
            opened_at: Utc::now(),
            status_changed_at: Utc::now(),
            entry_fill_price: Some(60000.0),
            entry_fill_quantity: Some(0.1),
            exit_algo_id: None,
            exit_order_id: None,
            amended_stop_loss: None,
            exit_fill_price: None,
            exit_fill_quantity: None,
            closed_at: None,
        }
    }
}
