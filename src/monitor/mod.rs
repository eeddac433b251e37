// Position monitor: drives each trade through its lifecycle by polling the
// exchange and reconciling what it reports into the trades table. The
// exchange's fill numbers always win over local expectations.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::Store;
use crate::exchange::{ExchangeGateway, OrderExecState, ProtectiveOrderRequest, ProtectiveState};
use crate::models::{OrderStatus, Trade, TradeSide};
use crate::sizing::floor_to_step;
use crate::Result;

/// Trailing stop ladder: the further the position is in profit, the
/// tighter the stop trails the recent high.
const LADDER: [(f64, f64); 5] = [
    (0.05, 0.001),
    (0.04, 0.01),
    (0.03, 0.02),
    (0.02, 0.03),
    (0.005, 0.04),
];
const LADDER_FLOOR: f64 = 0.05;

/// Client id for a trade's first protective order. Deterministic, so a
/// re-run after a crashed tick replays instead of doubling the stop.
fn initial_protective_id(trade: &Trade) -> String {
    format!("p{}", trade.id.simple())
}

/// Client id for a protective order that replaces a cancelled one. The
/// original id is burned on the exchange and cannot be reused.
fn replacement_protective_id() -> String {
    format!("p{}", Uuid::new_v4().simple())
}

/// Stop price for a long position given entry and the high-water mark.
pub fn ladder_stop(entry_price: f64, high: f64) -> f64 {
    let profit = (high - entry_price) / entry_price;
    let trail = LADDER
        .iter()
        .find(|(threshold, _)| profit >= *threshold)
        .map(|(_, trail)| *trail)
        .unwrap_or(LADDER_FLOOR);
    high * (1.0 - trail)
}

pub struct PositionMonitor {
    store: Arc<Store>,
    gateway: Arc<dyn ExchangeGateway>,
    entry_fill_timeout: Duration,
    staleness_hours: i64,
    /// High-water marks since entry, keyed by trade id. In-memory only; a
    /// restart re-seeds from the entry fill price and the ladder catches
    /// back up on the next ticks.
    highs: Mutex<HashMap<Uuid, f64>>,
}

impl PositionMonitor {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn ExchangeGateway>,
        entry_fill_timeout: Duration,
        staleness_hours: i64,
    ) -> Self {
        Self {
            store,
            gateway,
            entry_fill_timeout,
            staleness_hours,
            highs: Mutex::new(HashMap::new()),
        }
    }

    /// One reconciliation pass over a symbol's non-terminal trades.
    /// Returns the ids of trades flagged as stale.
    pub async fn tick(&self, symbol: &str) -> Result<Vec<Uuid>> {
        let trades = self.store.non_terminal_trades(Some(symbol)).await?;
        let mut stale = Vec::new();

        for trade in trades {
            // Stuck means stuck in one state, not held for a long time: a
            // healthy position that keeps advancing is never flagged.
            if Utc::now() - trade.status_changed_at > ChronoDuration::hours(self.staleness_hours) {
                tracing::warn!(
                    trade_id = %trade.id,
                    symbol = %trade.symbol_pair,
                    status = %trade.order_status,
                    status_changed_at = %trade.status_changed_at,
                    "trade stuck past staleness threshold, flagging for manual review"
                );
                stale.push(trade.id);
            }

            if let Err(e) = self.advance(&trade).await {
                tracing::error!(trade_id = %trade.id, error = %e, "monitor step failed");
                if !e.is_transient() {
                    return Err(e);
                }
            }
        }

        Ok(stale)
    }

    async fn advance(&self, trade: &Trade) -> Result<()> {
        match trade.order_status {
            OrderStatus::PendingEntry | OrderStatus::PartiallyFilled => {
                self.reconcile_entry(trade).await
            }
            OrderStatus::Open => self.reconcile_open(trade).await,
            OrderStatus::ExitPending => self.reconcile_exit(trade).await,
            _ => Ok(()),
        }
    }

    async fn reconcile_entry(&self, trade: &Trade) -> Result<()> {
        let report = self
            .gateway
            .get_order_status(&trade.symbol_pair, &trade.entry_order_id)
            .await?;

        match report.state {
            OrderExecState::Filled => {
                let fill_price = report.avg_fill_price.unwrap_or(trade.entry_price);
                self.store
                    .record_entry_fill(
                        trade.id,
                        fill_price,
                        report.filled_quantity,
                        trade.order_status,
                    )
                    .await?;
                self.place_protection(trade, report.filled_quantity).await?;
                self.highs.lock().await.insert(trade.id, fill_price);
                tracing::info!(
                    trade_id = %trade.id,
                    symbol = %trade.symbol_pair,
                    fill_price,
                    quantity = report.filled_quantity,
                    "entry filled, position protected"
                );
            }
            OrderExecState::PartiallyFilled => {
                let fill_price = report.avg_fill_price.unwrap_or(trade.entry_price);
                self.store
                    .record_entry_fill(
                        trade.id,
                        fill_price,
                        report.filled_quantity,
                        OrderStatus::PartiallyFilled,
                    )
                    .await?;
                // The partial position gets protection immediately; each
                // time the fill grows the stop is re-placed at the larger
                // size. `trade.entry_fill_quantity` still holds the size
                // the current stop was placed for.
                match &trade.exit_algo_id {
                    None => {
                        let algo_id = self
                            .place_protective_sized(
                                trade,
                                report.filled_quantity,
                                initial_protective_id(trade),
                            )
                            .await?;
                        self.store.set_exit_algo_id(trade.id, &algo_id).await?;
                    }
                    Some(old_algo)
                        if report.filled_quantity > trade.entry_fill_quantity.unwrap_or(0.0) =>
                    {
                        self.gateway
                            .cancel_protective_order(&trade.symbol_pair, old_algo)
                            .await?;
                        let algo_id = self
                            .place_protective_sized(
                                trade,
                                report.filled_quantity,
                                replacement_protective_id(),
                            )
                            .await?;
                        self.store.set_exit_algo_id(trade.id, &algo_id).await?;
                        tracing::info!(
                            trade_id = %trade.id,
                            symbol = %trade.symbol_pair,
                            quantity = report.filled_quantity,
                            "entry fill grew, protective order resized"
                        );
                    }
                    Some(_) => {}
                }
                if self.entry_timed_out(trade) {
                    // Keep what filled, cancel the rest, trade becomes a
                    // smaller open position.
                    self.gateway
                        .cancel_order(&trade.symbol_pair, &trade.entry_order_id)
                        .await?;
                    self.store.set_order_status(trade.id, OrderStatus::Open).await?;
                }
            }
            OrderExecState::Live => {
                if self.entry_timed_out(trade) {
                    tracing::warn!(
                        trade_id = %trade.id,
                        symbol = %trade.symbol_pair,
                        "entry unfilled after timeout, cancelling"
                    );
                    self.gateway
                        .cancel_order(&trade.symbol_pair, &trade.entry_order_id)
                        .await?;
                    self.store
                        .set_order_status(trade.id, OrderStatus::Failed)
                        .await?;
                }
            }
            OrderExecState::Cancelled => {
                let status = if report.filled_quantity > 0.0 {
                    OrderStatus::Open
                } else {
                    OrderStatus::Failed
                };
                self.store.set_order_status(trade.id, status).await?;
            }
        }
        Ok(())
    }

    async fn place_protection(&self, trade: &Trade, quantity: f64) -> Result<()> {
        // Full fill after a partial one: the old, smaller stop is replaced.
        let client_order_id = match &trade.exit_algo_id {
            Some(old_algo) => {
                self.gateway
                    .cancel_protective_order(&trade.symbol_pair, old_algo)
                    .await?;
                replacement_protective_id()
            }
            None => initial_protective_id(trade),
        };
        let algo_id = self
            .place_protective_sized(trade, quantity, client_order_id)
            .await?;
        self.store.attach_protective_order(trade.id, &algo_id).await?;
        Ok(())
    }

    async fn place_protective_sized(
        &self,
        trade: &Trade,
        quantity: f64,
        client_order_id: String,
    ) -> Result<String> {
        let spec = self.gateway.instrument_spec(&trade.symbol_pair).await?;
        let exit_side = match trade.side {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        };
        let request = ProtectiveOrderRequest {
            symbol_pair: trade.symbol_pair.clone(),
            side: exit_side,
            quantity: floor_to_step(quantity, spec.lot_step),
            trigger_price: trade.effective_stop_loss(),
            lot_step: spec.lot_step,
            client_order_id,
        };
        self.gateway.place_protective_order(&request).await
    }

    async fn reconcile_open(&self, trade: &Trade) -> Result<()> {
        let algo_id = match &trade.exit_algo_id {
            Some(id) => id.clone(),
            None => {
                // Open without protection should not happen; restore it.
                tracing::warn!(trade_id = %trade.id, "open trade without protective order, re-placing");
                let algo_id = self
                    .place_protective_sized(
                        trade,
                        trade.protected_quantity(),
                        initial_protective_id(trade),
                    )
                    .await?;
                self.store.attach_protective_order(trade.id, &algo_id).await?;
                return Ok(());
            }
        };

        let report = self
            .gateway
            .get_protective_status(&trade.symbol_pair, &algo_id)
            .await?;

        match report.state {
            ProtectiveState::Triggered => {
                let fill_price = report.fill_price.unwrap_or(trade.effective_stop_loss());
                // Exit can never exceed what was bought.
                let fill_quantity = report
                    .filled_quantity
                    .unwrap_or(trade.protected_quantity())
                    .min(trade.protected_quantity());
                self.store
                    .close_trade(trade.id, fill_price, fill_quantity)
                    .await?;
                self.highs.lock().await.remove(&trade.id);
                tracing::info!(
                    trade_id = %trade.id,
                    symbol = %trade.symbol_pair,
                    fill_price,
                    "protective order filled, trade closed"
                );
            }
            ProtectiveState::Cancelled | ProtectiveState::Failed => {
                tracing::warn!(trade_id = %trade.id, "protective order lost, re-placing");
                let algo_id = self
                    .place_protective_sized(
                        trade,
                        trade.protected_quantity(),
                        replacement_protective_id(),
                    )
                    .await?;
                self.store.attach_protective_order(trade.id, &algo_id).await?;
            }
            ProtectiveState::Live => {
                // Spot book: only long entries reach Open.
                if trade.side != TradeSide::Buy {
                    return Ok(());
                }
                let price = self.gateway.current_price(&trade.symbol_pair).await?;
                if !self.take_profit_reached(trade, &algo_id, price).await? {
                    self.trail_stop(trade, &algo_id, price).await?;
                }
            }
        }
        Ok(())
    }

    /// Take the profit when the decision set a target and price reached it.
    /// The protective stop is cancelled first so the exit sell does not race
    /// it for the same position.
    async fn take_profit_reached(
        &self,
        trade: &Trade,
        algo_id: &str,
        price: f64,
    ) -> Result<bool> {
        let target = match trade.take_profit {
            Some(t) => t,
            None => return Ok(false),
        };
        if price < target {
            return Ok(false);
        }

        self.gateway
            .cancel_protective_order(&trade.symbol_pair, algo_id)
            .await?;
        let ack = self
            .gateway
            .place_exit_order(
                &trade.symbol_pair,
                TradeSide::Sell,
                trade.protected_quantity(),
                &format!("x{}", trade.id.simple()),
            )
            .await?;
        self.store.set_exit_order_id(trade.id, &ack.order_id).await?;
        tracing::info!(
            trade_id = %trade.id,
            symbol = %trade.symbol_pair,
            price,
            target,
            "take profit reached, exit order placed"
        );
        Ok(true)
    }

    /// Tighten the stop when the position has run far enough.
    async fn trail_stop(&self, trade: &Trade, algo_id: &str, price: f64) -> Result<()> {
        let entry = match trade.entry_fill_price {
            Some(p) => p,
            None => return Ok(()),
        };

        let high = {
            let mut highs = self.highs.lock().await;
            let h = highs.entry(trade.id).or_insert(entry);
            if price > *h {
                *h = price;
            }
            *h
        };

        let candidate = ladder_stop(entry, high);
        // Only ever move the trigger up.
        if candidate > trade.effective_stop_loss() {
            self.gateway
                .amend_protective_order(&trade.symbol_pair, algo_id, candidate)
                .await?;
            // Persisted only after the exchange confirmed the amendment.
            self.store.update_amended_stop(trade.id, candidate).await?;
            tracing::info!(
                trade_id = %trade.id,
                symbol = %trade.symbol_pair,
                new_stop = candidate,
                high,
                "trailing stop amended"
            );
        }
        Ok(())
    }

    async fn reconcile_exit(&self, trade: &Trade) -> Result<()> {
        let exit_order_id = match &trade.exit_order_id {
            Some(id) => id.clone(),
            None => return Ok(()),
        };
        let report = self
            .gateway
            .get_order_status(&trade.symbol_pair, &exit_order_id)
            .await?;

        if report.state == OrderExecState::Filled {
            let fill_price = report.avg_fill_price.unwrap_or(trade.entry_price);
            let fill_quantity = report.filled_quantity.min(trade.protected_quantity());
            self.store
                .close_trade(trade.id, fill_price, fill_quantity)
                .await?;
            self.highs.lock().await.remove(&trade.id);
        }
        Ok(())
    }

    fn entry_timed_out(&self, trade: &Trade) -> bool {
        let elapsed = Utc::now() - trade.opened_at;
        elapsed.to_std().map(|e| e > self.entry_fill_timeout).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_deep_profit_trails_tight() {
        // 6% up: stop 0.1% below the high
        let stop = ladder_stop(100.0, 106.0);
        assert!((stop - 106.0 * 0.999).abs() < 1e-9);
    }

    #[test]
    fn test_ladder_tiers() {
        // 4.5% profit -> 1% below high
        assert!((ladder_stop(100.0, 104.5) - 104.5 * 0.99).abs() < 1e-9);
        // 3.5% -> 2%
        assert!((ladder_stop(100.0, 103.5) - 103.5 * 0.98).abs() < 1e-9);
        // 2.5% -> 3%
        assert!((ladder_stop(100.0, 102.5) - 102.5 * 0.97).abs() < 1e-9);
        // 1% -> 4%
        assert!((ladder_stop(100.0, 101.0) - 101.0 * 0.96).abs() < 1e-9);
    }

    #[test]
    fn test_ladder_floor_below_half_percent() {
        // Barely in profit: stop 5% below the high
        let stop = ladder_stop(100.0, 100.2);
        assert!((stop - 100.2 * 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_ladder_monotone_in_high() {
        // A rising high never lowers the candidate stop
        let mut prev = 0.0;
        for high in [100.5, 101.0, 102.0, 103.0, 104.0, 105.0, 106.0] {
            let stop = ladder_stop(100.0, high);
            assert!(stop >= prev, "stop regressed at high {}", high);
            prev = stop;
        }
    }
}
