// Exchange gateway seam. The pipeline only ever talks to the trait; the OKX
// adapter implements it for live/demo trading and the paper adapter backs
// dry runs and tests.

pub mod okx;
pub mod paper;

use async_trait::async_trait;
use std::str::FromStr;

use crate::models::TradeSide;
use crate::sizing::{EquitySnapshot, InstrumentSpec, OrderIntent};
use crate::Result;

pub use okx::OkxGateway;
pub use paper::PaperExchange;

/// Acknowledgment for a submitted order
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
}

/// Execution state of a regular order, as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderExecState {
    Live,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl FromStr for OrderExecState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "live" => Ok(OrderExecState::Live),
            "partially_filled" => Ok(OrderExecState::PartiallyFilled),
            "filled" => Ok(OrderExecState::Filled),
            "canceled" | "mmp_canceled" => Ok(OrderExecState::Cancelled),
            other => Err(format!("unknown order state: {}", other)),
        }
    }
}

/// Fill progress report for a regular order. The exchange's numbers always
/// win over locally computed expectations.
#[derive(Debug, Clone)]
pub struct OrderReport {
    pub order_id: String,
    pub state: OrderExecState,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
}

/// Request for a conditional stop order protecting an open position
#[derive(Debug, Clone)]
pub struct ProtectiveOrderRequest {
    pub symbol_pair: String,
    /// Side that closes the position (sell for a long).
    pub side: TradeSide,
    pub quantity: f64,
    pub trigger_price: f64,
    /// Lot step used when the not-enough-funds ladder shrinks the size.
    pub lot_step: f64,
    pub client_order_id: String,
}

/// State of a conditional stop order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectiveState {
    Live,
    /// Trigger fired and the closing market order executed.
    Triggered,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ProtectiveReport {
    pub algo_id: String,
    pub state: ProtectiveState,
    pub fill_price: Option<f64>,
    pub filled_quantity: Option<f64>,
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Minimum size and lot step for the instrument.
    async fn instrument_spec(&self, symbol: &str) -> Result<InstrumentSpec>;

    /// Account equity and cash available in `quote_ccy`.
    async fn equity(&self, quote_ccy: &str) -> Result<EquitySnapshot>;

    async fn current_price(&self, symbol: &str) -> Result<f64>;

    /// Submit the entry order. The intent's `client_order_id` is the
    /// idempotence key: replaying the same intent must not create a second
    /// order.
    async fn place_entry_order(&self, intent: &OrderIntent) -> Result<OrderAck>;

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderReport>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    /// Place a conditional stop order; returns the algo order id.
    async fn place_protective_order(&self, request: &ProtectiveOrderRequest) -> Result<String>;

    async fn get_protective_status(&self, symbol: &str, algo_id: &str) -> Result<ProtectiveReport>;

    /// Move the stop trigger of an existing protective order.
    async fn amend_protective_order(
        &self,
        symbol: &str,
        algo_id: &str,
        new_trigger: f64,
    ) -> Result<()>;

    async fn cancel_protective_order(&self, symbol: &str, algo_id: &str) -> Result<()>;

    /// Market order that closes a position outside the protective path.
    async fn place_exit_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<OrderAck>;
}
