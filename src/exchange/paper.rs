/// In-memory exchange for dry runs and tests
///
/// Market orders fill instantly at the scripted price unless fills are held
/// back; tests drive partial fills and stop triggers through the scripting
/// hooks. Enforces the same client-order-id idempotence contract as the
/// real adapter.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{
    ExchangeGateway, OrderAck, OrderExecState, OrderReport, ProtectiveOrderRequest,
    ProtectiveReport, ProtectiveState,
};
use crate::error::BotError;
use crate::market::MarketData;
use crate::models::TradeSide;
use crate::sizing::{EquitySnapshot, InstrumentSpec, OrderIntent};
use crate::Result;
use std::sync::Arc;

/// Equity assumed for dry runs when none is scripted.
const DEFAULT_PAPER_EQUITY: f64 = 10_000.0;

struct PaperOrder {
    quantity: f64,
    state: OrderExecState,
    filled_quantity: f64,
    avg_fill_price: Option<f64>,
}

struct PaperAlgo {
    symbol: String,
    quantity: f64,
    trigger_price: f64,
    state: ProtectiveState,
    fill_price: Option<f64>,
    filled_quantity: Option<f64>,
}

#[derive(Default)]
struct Inner {
    prices: HashMap<String, f64>,
    specs: HashMap<String, InstrumentSpec>,
    equity: Option<EquitySnapshot>,
    orders: HashMap<String, PaperOrder>,
    orders_by_client_id: HashMap<String, String>,
    algos: HashMap<String, PaperAlgo>,
    algos_by_client_id: HashMap<String, String>,
    next_id: u64,
    reject_entries: bool,
    hold_entry_fills: bool,
    equity_failures: u32,
    calls: u64,
}

pub struct PaperExchange {
    inner: Mutex<Inner>,
    /// Live price fallback for dry runs; tests script prices instead.
    market: Option<Arc<dyn MarketData>>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            market: None,
        }
    }

    /// Paper exchange that marks to real market prices.
    pub fn with_market(market: Arc<dyn MarketData>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            market: Some(market),
        }
    }

    async fn price_of(&self, symbol: &str) -> Result<f64> {
        if let Some(price) = self.inner.lock().await.prices.get(symbol).copied() {
            return Ok(price);
        }
        if let Some(market) = &self.market {
            return market.current_price(symbol).await;
        }
        Err(BotError::Validation(format!("no paper price for {}", symbol)))
    }

    pub async fn set_price(&self, symbol: &str, price: f64) {
        self.inner.lock().await.prices.insert(symbol.to_string(), price);
    }

    pub async fn set_equity(&self, snapshot: EquitySnapshot) {
        self.inner.lock().await.equity = Some(snapshot);
    }

    pub async fn set_spec(&self, spec: InstrumentSpec) {
        self.inner
            .lock()
            .await
            .specs
            .insert(spec.symbol_pair.clone(), spec);
    }

    /// Entry orders are rejected by the exchange (scenario: bad instrument,
    /// no balance).
    pub async fn reject_entries(&self, reject: bool) {
        self.inner.lock().await.reject_entries = reject;
    }

    /// Entry orders rest unfilled until `fill_order` is called.
    pub async fn hold_entry_fills(&self, hold: bool) {
        self.inner.lock().await.hold_entry_fills = hold;
    }

    /// The next `times` balance lookups fail as if the endpoint were down.
    pub async fn fail_equity(&self, times: u32) {
        self.inner.lock().await.equity_failures = times;
    }

    /// Script a (possibly partial) fill on a resting order.
    pub async fn fill_order(&self, order_id: &str, quantity: f64, price: f64) {
        let mut inner = self.inner.lock().await;
        if let Some(order) = inner.orders.get_mut(order_id) {
            order.filled_quantity = (order.filled_quantity + quantity).min(order.quantity);
            order.avg_fill_price = Some(price);
            order.state = if order.filled_quantity >= order.quantity {
                OrderExecState::Filled
            } else {
                OrderExecState::PartiallyFilled
            };
        }
    }

    /// Fire a protective stop: the closing order executes at `price`.
    pub async fn trigger_protective(&self, algo_id: &str, price: f64) {
        let mut inner = self.inner.lock().await;
        if let Some(algo) = inner.algos.get_mut(algo_id) {
            if algo.state == ProtectiveState::Live {
                algo.state = ProtectiveState::Triggered;
                algo.fill_price = Some(price);
                algo.filled_quantity = Some(algo.quantity);
            }
        }
    }

    /// Total trait calls made against the exchange. Degraded-path tests
    /// assert this stays at zero.
    pub async fn call_count(&self) -> u64 {
        self.inner.lock().await.calls
    }

    pub async fn order_count(&self) -> usize {
        self.inner.lock().await.orders.len()
    }

    pub async fn algo_trigger_price(&self, algo_id: &str) -> Option<f64> {
        self.inner.lock().await.algos.get(algo_id).map(|a| a.trigger_price)
    }

    pub async fn algo_quantity(&self, algo_id: &str) -> Option<f64> {
        self.inner.lock().await.algos.get(algo_id).map(|a| a.quantity)
    }

    pub async fn algo_state(&self, algo_id: &str) -> Option<ProtectiveState> {
        self.inner.lock().await.algos.get(algo_id).map(|a| a.state)
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn instrument_spec(&self, symbol: &str) -> Result<InstrumentSpec> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        Ok(inner.specs.get(symbol).cloned().unwrap_or(InstrumentSpec {
            symbol_pair: symbol.to_string(),
            min_size: 0.001,
            lot_step: 0.0001,
        }))
    }

    async fn equity(&self, _quote_ccy: &str) -> Result<EquitySnapshot> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        if inner.equity_failures > 0 {
            inner.equity_failures -= 1;
            return Err(BotError::Transient(
                "paper balance endpoint unavailable".to_string(),
            ));
        }
        Ok(inner.equity.unwrap_or(EquitySnapshot {
            total_equity: DEFAULT_PAPER_EQUITY,
            available_cash: DEFAULT_PAPER_EQUITY,
        }))
    }

    async fn current_price(&self, symbol: &str) -> Result<f64> {
        self.inner.lock().await.calls += 1;
        self.price_of(symbol).await
    }

    async fn place_entry_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        let price = self.price_of(&intent.symbol_pair).await?;
        let mut inner = self.inner.lock().await;
        inner.calls += 1;

        // Idempotent replay: same client order id, same order.
        if let Some(order_id) = inner.orders_by_client_id.get(&intent.client_order_id) {
            return Ok(OrderAck {
                order_id: order_id.clone(),
                client_order_id: intent.client_order_id.clone(),
            });
        }

        if inner.reject_entries {
            return Err(BotError::ExchangeRejected {
                symbol: intent.symbol_pair.clone(),
                reason: "51000: paper exchange rejecting entries".to_string(),
            });
        }

        inner.next_id += 1;
        let order_id = format!("o-{}", inner.next_id);
        let filled = !inner.hold_entry_fills;
        inner.orders.insert(
            order_id.clone(),
            PaperOrder {
                quantity: intent.quantity,
                state: if filled {
                    OrderExecState::Filled
                } else {
                    OrderExecState::Live
                },
                filled_quantity: if filled { intent.quantity } else { 0.0 },
                avg_fill_price: if filled { Some(price) } else { None },
            },
        );
        inner
            .orders_by_client_id
            .insert(intent.client_order_id.clone(), order_id.clone());

        Ok(OrderAck {
            order_id,
            client_order_id: intent.client_order_id.clone(),
        })
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> Result<OrderReport> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        let order = inner
            .orders
            .get(order_id)
            .ok_or_else(|| BotError::Validation(format!("unknown paper order {}", order_id)))?;
        Ok(OrderReport {
            order_id: order_id.to_string(),
            state: order.state,
            filled_quantity: order.filled_quantity,
            avg_fill_price: order.avg_fill_price,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BotError::Validation(format!("unknown paper order {}", order_id)))?;
        if order.state == OrderExecState::Live || order.state == OrderExecState::PartiallyFilled {
            order.state = OrderExecState::Cancelled;
        }
        Ok(())
    }

    async fn place_protective_order(&self, request: &ProtectiveOrderRequest) -> Result<String> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;

        if let Some(algo_id) = inner.algos_by_client_id.get(&request.client_order_id) {
            return Ok(algo_id.clone());
        }

        inner.next_id += 1;
        let algo_id = format!("a-{}", inner.next_id);
        inner.algos.insert(
            algo_id.clone(),
            PaperAlgo {
                symbol: request.symbol_pair.clone(),
                quantity: request.quantity,
                trigger_price: request.trigger_price,
                state: ProtectiveState::Live,
                fill_price: None,
                filled_quantity: None,
            },
        );
        inner
            .algos_by_client_id
            .insert(request.client_order_id.clone(), algo_id.clone());
        Ok(algo_id)
    }

    async fn get_protective_status(&self, _symbol: &str, algo_id: &str) -> Result<ProtectiveReport> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        let algo = inner
            .algos
            .get(algo_id)
            .ok_or_else(|| BotError::Validation(format!("unknown paper algo {}", algo_id)))?;
        Ok(ProtectiveReport {
            algo_id: algo_id.to_string(),
            state: algo.state,
            fill_price: algo.fill_price,
            filled_quantity: algo.filled_quantity,
        })
    }

    async fn amend_protective_order(
        &self,
        _symbol: &str,
        algo_id: &str,
        new_trigger: f64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        let algo = inner
            .algos
            .get_mut(algo_id)
            .ok_or_else(|| BotError::Validation(format!("unknown paper algo {}", algo_id)))?;
        if algo.state != ProtectiveState::Live {
            return Err(BotError::ExchangeRejected {
                symbol: algo.symbol.clone(),
                reason: "51293: algo order not live".to_string(),
            });
        }
        algo.trigger_price = new_trigger;
        Ok(())
    }

    async fn cancel_protective_order(&self, _symbol: &str, algo_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        if let Some(algo) = inner.algos.get_mut(algo_id) {
            if algo.state == ProtectiveState::Live {
                algo.state = ProtectiveState::Cancelled;
            }
        }
        Ok(())
    }

    async fn place_exit_order(
        &self,
        symbol: &str,
        _side: TradeSide,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<OrderAck> {
        let price = self.price_of(symbol).await?;
        let mut inner = self.inner.lock().await;
        inner.calls += 1;

        if let Some(order_id) = inner.orders_by_client_id.get(client_order_id) {
            return Ok(OrderAck {
                order_id: order_id.clone(),
                client_order_id: client_order_id.to_string(),
            });
        }

        inner.next_id += 1;
        let order_id = format!("o-{}", inner.next_id);
        inner.orders.insert(
            order_id.clone(),
            PaperOrder {
                quantity,
                state: OrderExecState::Filled,
                filled_quantity: quantity,
                avg_fill_price: Some(price),
            },
        );
        inner
            .orders_by_client_id
            .insert(client_order_id.to_string(), order_id.clone());
        Ok(OrderAck {
            order_id,
            client_order_id: client_order_id.to_string(),
        })
    }
}
