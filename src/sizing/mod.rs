// Position sizer and order builder. Pure computation: decision + config +
// balance snapshot + instrument constraints in, an order intent or a typed
// rejection out. No I/O happens here.

use rust_decimal::prelude::*;
use std::fmt;
use uuid::Uuid;

use crate::models::{AiDecision, SymbolConfig, TradeAction, TradeSide};

/// Exchange-imposed constraints for one instrument
#[derive(Debug, Clone)]
pub struct InstrumentSpec {
    pub symbol_pair: String,
    /// Smallest order quantity the exchange accepts.
    pub min_size: f64,
    /// Quantity increment; orders are rounded down to a multiple of this.
    pub lot_step: f64,
}

/// Account balance snapshot used for sizing
#[derive(Debug, Clone, Copy)]
pub struct EquitySnapshot {
    /// Total account value in quote currency.
    pub total_equity: f64,
    /// Quote currency available for new orders.
    pub available_cash: f64,
}

/// A fully specified entry order, ready for the exchange gateway
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub symbol_pair: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: Option<f64>,
    /// Caller-generated idempotence key, passed to the exchange verbatim.
    pub client_order_id: String,
}

/// Reasons the sizer refuses to build an order. These are expected
/// outcomes, not errors: the decision is recorded and the signal consumed.
#[derive(Debug, Clone, PartialEq)]
pub enum SizeRejection {
    /// Action was hold/close or required fields were absent.
    NotAnEntry(String),
    OpenTradeExists,
    RiskTooHigh { risk_score: f64, ceiling: f64 },
    NoAllocationHeadroom { allocated: f64, cap: f64 },
    BelowMinimum { quantity: f64, min_size: f64 },
    InvalidPrice(f64),
}

impl fmt::Display for SizeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeRejection::NotAnEntry(why) => write!(f, "not an entry: {}", why),
            SizeRejection::OpenTradeExists => write!(f, "open trade exists for symbol"),
            SizeRejection::RiskTooHigh { risk_score, ceiling } => {
                write!(f, "risk score {} above ceiling {}", risk_score, ceiling)
            }
            SizeRejection::NoAllocationHeadroom { allocated, cap } => {
                write!(f, "allocation {} already at or above cap {}", allocated, cap)
            }
            SizeRejection::BelowMinimum { quantity, min_size } => {
                write!(f, "quantity {} below exchange minimum {}", quantity, min_size)
            }
            SizeRejection::InvalidPrice(p) => write!(f, "invalid price {}", p),
        }
    }
}

pub struct PositionSizer {
    /// Decisions with risk_score above this never reach the exchange.
    risk_ceiling: f64,
}

impl PositionSizer {
    pub fn new(risk_ceiling: f64) -> Self {
        Self { risk_ceiling }
    }

    /// Build an entry order from an executable decision.
    ///
    /// `allocated_fraction` is the value of the symbol's open positions as
    /// a fraction of total equity; headroom against the symbol's allocation
    /// cap comes out of it. `open_trades` is the count of non-terminal
    /// trades for the symbol. `atr` and `atr_multiplier` bound how far the
    /// stop may sit from the entry: the engine's stop_loss_pct is capped at
    /// `atr * atr_multiplier` of adverse distance.
    #[allow(clippy::too_many_arguments)]
    pub fn size_order(
        &self,
        decision: &AiDecision,
        symbol_config: &SymbolConfig,
        balance: EquitySnapshot,
        price: f64,
        spec: &InstrumentSpec,
        allocated_fraction: f64,
        open_trades: i64,
        atr: Option<f64>,
        atr_multiplier: f64,
    ) -> Result<OrderIntent, SizeRejection> {
        let side = match decision.action {
            TradeAction::Buy => TradeSide::Buy,
            TradeAction::Sell => TradeSide::Sell,
            other => return Err(SizeRejection::NotAnEntry(format!("action is {}", other))),
        };

        if open_trades > 0 {
            return Err(SizeRejection::OpenTradeExists);
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(SizeRejection::InvalidPrice(price));
        }

        let (size_pct, stop_pct) = match (decision.position_size_pct, decision.stop_loss_pct) {
            (Some(s), Some(p)) => (s, p),
            _ => {
                return Err(SizeRejection::NotAnEntry(
                    "decision lacks sizing fields".to_string(),
                ))
            }
        };

        if let Some(risk) = decision.risk_score {
            if risk > self.risk_ceiling {
                return Err(SizeRejection::RiskTooHigh {
                    risk_score: risk,
                    ceiling: self.risk_ceiling,
                });
            }
        }

        let headroom = symbol_config.max_allocation - allocated_fraction;
        if headroom <= 0.0 {
            return Err(SizeRejection::NoAllocationHeadroom {
                allocated: allocated_fraction,
                cap: symbol_config.max_allocation,
            });
        }

        let budget_fraction = size_pct.min(headroom);
        let notional = (budget_fraction * balance.total_equity).min(balance.available_cash);
        let quantity = floor_to_step(notional / price, spec.lot_step);

        if quantity < spec.min_size || quantity <= 0.0 {
            return Err(SizeRejection::BelowMinimum {
                quantity,
                min_size: spec.min_size,
            });
        }

        // Stop sits on the adverse side of the entry, at most the ATR risk
        // bound away; take-profit mirrors the engine's percentage.
        let mut stop_distance = price * stop_pct;
        if let Some(cap) = atr.map(|a| a * atr_multiplier).filter(|c| *c > 0.0) {
            stop_distance = stop_distance.min(cap);
        }
        let stop_loss_price = match side {
            TradeSide::Buy => price - stop_distance,
            TradeSide::Sell => price + stop_distance,
        };
        let take_profit_price = decision.take_profit_pct.filter(|tp| *tp > 0.0).map(|tp| {
            match side {
                TradeSide::Buy => price * (1.0 + tp),
                TradeSide::Sell => price * (1.0 - tp),
            }
        });

        Ok(OrderIntent {
            symbol_pair: decision.symbol_pair.clone(),
            side,
            quantity,
            entry_price: price,
            stop_loss_price,
            take_profit_price,
            client_order_id: Uuid::new_v4().simple().to_string(),
        })
    }
}

/// Round `value` down to a multiple of `step`. Decimal arithmetic avoids
/// float dust like 0.30000000000000004 leaking into order quantities.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 || !value.is_finite() {
        return value;
    }
    let (value_d, step_d) = match (Decimal::from_f64(value), Decimal::from_f64(step)) {
        (Some(v), Some(s)) if !s.is_zero() => (v, s),
        _ => return value,
    };
    let steps = (value_d / step_d).floor();
    (steps * step_d).to_f64().unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Confidence, DecisionSource};
    use chrono::Utc;

    fn buy_decision() -> AiDecision {
        AiDecision {
            id: Some(1),
            signal_id: 1,
            user_config_id: None,
            symbol_pair: "BTC-EUR".to_string(),
            fast_timeframe: "1H".to_string(),
            slow_timeframe: "4H".to_string(),
            strategy: "ema_crossover".to_string(),
            signal_summary: "enter_long on BTC-EUR".to_string(),
            action: TradeAction::Buy,
            confidence: Confidence::High,
            risk_score: Some(0.3),
            position_size_pct: Some(0.5),
            stop_loss_pct: Some(0.02),
            take_profit_pct: Some(0.06),
            rationale: "test".to_string(),
            key_factors: "[]".to_string(),
            source: DecisionSource::Ai,
            model: None,
            tools_used: None,
            created_at: Utc::now(),
        }
    }

    fn btc_config() -> SymbolConfig {
        SymbolConfig {
            id: Some(1),
            symbol_pair: "BTC-EUR".to_string(),
            max_allocation: 0.5,
            usage: true,
            added_at: Utc::now(),
            discontinued_at: None,
        }
    }

    fn btc_spec() -> InstrumentSpec {
        InstrumentSpec {
            symbol_pair: "BTC-EUR".to_string(),
            min_size: 0.001,
            lot_step: 0.0001,
        }
    }

    fn balance(equity: f64) -> EquitySnapshot {
        EquitySnapshot {
            total_equity: equity,
            available_cash: equity,
        }
    }

    #[test]
    fn test_buy_order_with_protective_prices() {
        let sizer = PositionSizer::new(0.8);
        let intent = sizer
            .size_order(
                &buy_decision(),
                &btc_config(),
                balance(12000.0),
                60000.0,
                &btc_spec(),
                0.0,
                0,
                Some(500.0),
                3.0,
            )
            .unwrap();

        // 0.5 of 12000 = 6000 EUR at 60000 = 0.1 BTC; the 2% stop (1200)
        // is inside the ATR bound (500 * 3), so it stands
        assert_eq!(intent.quantity, 0.1);
        assert_eq!(intent.side, TradeSide::Buy);
        assert_eq!(intent.stop_loss_price, 60000.0 * 0.98);
        assert_eq!(intent.take_profit_price, Some(60000.0 * 1.06));
        assert_eq!(intent.client_order_id.len(), 32);
    }

    #[test]
    fn test_atr_bound_caps_wide_stop() {
        let sizer = PositionSizer::new(0.8);
        // 5% of 60000 is 3000, but ATR 500 * 3 bounds the distance at 1500
        let mut decision = buy_decision();
        decision.stop_loss_pct = Some(0.05);
        let intent = sizer
            .size_order(
                &decision,
                &btc_config(),
                balance(12000.0),
                60000.0,
                &btc_spec(),
                0.0,
                0,
                Some(500.0),
                3.0,
            )
            .unwrap();
        assert_eq!(intent.stop_loss_price, 58500.0);

        // Without an ATR reading the engine's stop stands as given
        let intent = sizer
            .size_order(
                &decision,
                &btc_config(),
                balance(12000.0),
                60000.0,
                &btc_spec(),
                0.0,
                0,
                None,
                3.0,
            )
            .unwrap();
        assert_eq!(intent.stop_loss_price, 57000.0);
    }

    #[test]
    fn test_headroom_caps_position() {
        let sizer = PositionSizer::new(0.8);
        // 0.4 of equity already allocated to BTC; cap 0.5 leaves 0.1
        let intent = sizer
            .size_order(
                &buy_decision(),
                &btc_config(),
                balance(10000.0),
                50000.0,
                &btc_spec(),
                0.4,
                0,
                None,
                3.0,
            )
            .unwrap();

        // min(0.5, 0.1) * 10000 = 1000 EUR -> 0.02 BTC
        assert_eq!(intent.quantity, 0.02);
    }

    #[test]
    fn test_no_headroom_rejected() {
        let sizer = PositionSizer::new(0.8);
        let err = sizer
            .size_order(
                &buy_decision(),
                &btc_config(),
                balance(10000.0),
                50000.0,
                &btc_spec(),
                0.5,
                0,
                None,
                3.0,
            )
            .unwrap_err();
        assert!(matches!(err, SizeRejection::NoAllocationHeadroom { .. }));
    }

    #[test]
    fn test_open_trade_blocks_new_entry() {
        let sizer = PositionSizer::new(0.8);
        let err = sizer
            .size_order(
                &buy_decision(),
                &btc_config(),
                balance(10000.0),
                50000.0,
                &btc_spec(),
                0.0,
                1,
                None,
                3.0,
            )
            .unwrap_err();
        assert_eq!(err, SizeRejection::OpenTradeExists);
    }

    #[test]
    fn test_risk_ceiling_enforced() {
        let sizer = PositionSizer::new(0.4);
        let mut decision = buy_decision();
        decision.risk_score = Some(0.55);
        let err = sizer
            .size_order(
                &decision,
                &btc_config(),
                balance(10000.0),
                50000.0,
                &btc_spec(),
                0.0,
                0,
                None,
                3.0,
            )
            .unwrap_err();
        assert!(matches!(err, SizeRejection::RiskTooHigh { .. }));

        // At or below the ceiling the decision goes through
        decision.risk_score = Some(0.4);
        assert!(sizer
            .size_order(
                &decision,
                &btc_config(),
                balance(10000.0),
                50000.0,
                &btc_spec(),
                0.0,
                0,
                None,
                3.0,
            )
            .is_ok());
    }

    #[test]
    fn test_below_minimum_rejected() {
        let sizer = PositionSizer::new(0.8);
        // 50 EUR budget at 60000 -> ~0.0008 BTC, under the 0.001 minimum
        let mut decision = buy_decision();
        decision.position_size_pct = Some(0.005);
        let err = sizer
            .size_order(
                &decision,
                &btc_config(),
                balance(10000.0),
                60000.0,
                &btc_spec(),
                0.0,
                0,
                None,
                3.0,
            )
            .unwrap_err();
        assert!(matches!(err, SizeRejection::BelowMinimum { .. }));
    }

    #[test]
    fn test_hold_is_not_an_entry() {
        let sizer = PositionSizer::new(0.8);
        let mut decision = buy_decision();
        decision.action = TradeAction::Hold;
        let err = sizer
            .size_order(
                &decision,
                &btc_config(),
                balance(10000.0),
                50000.0,
                &btc_spec(),
                0.0,
                0,
                None,
                3.0,
            )
            .unwrap_err();
        assert!(matches!(err, SizeRejection::NotAnEntry(_)));
    }

    #[test]
    fn test_sell_stop_sits_above_entry() {
        let sizer = PositionSizer::new(0.8);
        let mut decision = buy_decision();
        decision.action = TradeAction::Sell;
        let intent = sizer
            .size_order(
                &decision,
                &btc_config(),
                balance(12000.0),
                60000.0,
                &btc_spec(),
                0.0,
                0,
                None,
                3.0,
            )
            .unwrap();
        assert_eq!(intent.side, TradeSide::Sell);
        assert!(intent.stop_loss_price > intent.entry_price);
        assert!(intent.take_profit_price.unwrap() < intent.entry_price);
    }

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(0.10009, 0.0001), 0.1);
        assert_eq!(floor_to_step(0.12345, 0.001), 0.123);
        assert_eq!(floor_to_step(1.0, 0.0), 1.0);
        // 0.1 + 0.2 style float dust stays out of quantities
        assert_eq!(floor_to_step(0.1 + 0.2, 0.0001), 0.3);
    }
}
