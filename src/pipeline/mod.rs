// Pipeline orchestration: one lane task per symbol, each internally
// sequential. A lane never processes a new signal while the symbol has a
// non-terminal trade; pending signals simply stay unprocessed in the
// database and are picked up when the lane frees.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::PipelineSettings;
use crate::db::Store;
use crate::decision::{DecisionGateway, ReasoningEngine};
use crate::error::BotError;
use crate::exchange::ExchangeGateway;
use crate::market::MarketData;
use crate::models::{
    DecisionOutcome, DecisionSource, OrderStatus, SymbolConfig, Trade, UserConfig,
};
use crate::monitor::PositionMonitor;
use crate::signal::SignalDetector;
use crate::sizing::PositionSizer;
use crate::Result;

/// Extra bars fetched beyond the detector's minimum so the EMAs are warm.
const CANDLE_FETCH_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct LaneStatus {
    pub symbol_pair: String,
    pub state: LaneState,
    pub non_terminal_trades: i64,
    pub stale_trades: Vec<Uuid>,
    pub last_error: Option<String>,
    pub last_tick: Option<chrono::DateTime<Utc>>,
}

type StatusMap = Arc<RwLock<HashMap<String, LaneStatus>>>;

/// Everything a lane needs, shared across lanes.
pub struct Pipeline {
    store: Arc<Store>,
    market: Arc<dyn MarketData>,
    gateway: Arc<dyn ExchangeGateway>,
    decision_gateway: Arc<DecisionGateway<Arc<dyn ReasoningEngine>>>,
    monitor: Arc<PositionMonitor>,
    sizer: PositionSizer,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        market: Arc<dyn MarketData>,
        gateway: Arc<dyn ExchangeGateway>,
        engine: Arc<dyn ReasoningEngine>,
        settings: PipelineSettings,
    ) -> Self {
        let decision_gateway = Arc::new(DecisionGateway::new(
            engine,
            Duration::from_secs(settings.decision_timeout_secs),
        ));
        let monitor = Arc::new(PositionMonitor::new(
            store.clone(),
            gateway.clone(),
            Duration::from_secs(settings.entry_fill_timeout_secs),
            settings.staleness_hours,
        ));
        let sizer = PositionSizer::new(settings.risk_ceiling);
        Self {
            store,
            market,
            gateway,
            decision_gateway,
            monitor,
            sizer,
            settings,
        }
    }

    /// Run the detector on the latest closed bars and persist any signal.
    /// The dedupe index makes re-runs on the same bar a no-op.
    pub async fn detect_once(&self, symbol: &str, config: &UserConfig) -> Result<Option<i64>> {
        let mut candles = self
            .market
            .fetch_candles(symbol, &self.settings.bar_interval, CANDLE_FETCH_LIMIT)
            .await?;
        // The newest bar of each series is still forming; the detector only
        // sees closed bars, on both timeframes.
        candles.pop();

        let mut confirmation = self
            .market
            .fetch_candles(
                symbol,
                &self.settings.confirmation_bar_interval,
                CANDLE_FETCH_LIMIT,
            )
            .await?;
        confirmation.pop();

        let detector = SignalDetector::new(config.clone());
        let signal = match detector.detect(&candles, &confirmation) {
            Some(s) => s,
            None => return Ok(None),
        };

        let id = self.store.log_signal(&signal).await?;
        if let Some(id) = id {
            tracing::info!(
                symbol,
                signal_id = id,
                kind = %signal.kind,
                price = signal.price,
                "signal detected"
            );
        }
        Ok(id)
    }

    /// Take the oldest unprocessed signal through decision, sizing and
    /// entry placement. Exactly one decision row is written and the signal
    /// is marked processed exactly once, whatever the outcome.
    pub async fn process_next_signal(
        &self,
        config: &UserConfig,
        symbol_config: &SymbolConfig,
    ) -> Result<Option<DecisionOutcome>> {
        let symbol = symbol_config.symbol_pair.as_str();

        // One position per symbol: while a trade is live the lane leaves
        // pending signals untouched.
        if self.store.count_non_terminal_trades(symbol).await? > 0 {
            return Ok(None);
        }

        let signal = match self.store.oldest_unprocessed_signal(symbol).await? {
            Some(s) => s,
            None => return Ok(None),
        };

        let mut decision = self
            .decision_gateway
            .evaluate(
                &signal,
                config,
                &self.settings.bar_interval,
                &self.settings.confirmation_bar_interval,
                None,
            )
            .await;
        let decision_id = self.store.log_decision(&decision).await?;
        decision.id = Some(decision_id);

        // The signal is consumed the moment its decision row exists. A
        // failure during execution must not re-run the reasoning step and
        // write a second decision for the same signal.
        if let Some(signal_id) = signal.id {
            self.store.mark_signal_processed(signal_id).await?;
        }

        let outcome = if decision.source == DecisionSource::Degraded {
            DecisionOutcome::Degraded(decision.rationale.clone())
        } else if decision.action.is_entry() {
            self.execute_entry(&decision, symbol_config, decision_id, signal.atr, config)
                .await?
        } else {
            DecisionOutcome::Rejected(format!("engine chose {}", decision.action))
        };

        tracing::info!(
            symbol,
            decision_id,
            action = %decision.action,
            outcome = ?outcome,
            "signal processed"
        );
        Ok(Some(outcome))
    }

    async fn execute_entry(
        &self,
        decision: &crate::models::AiDecision,
        symbol_config: &SymbolConfig,
        decision_id: i64,
        signal_atr: Option<f64>,
        config: &UserConfig,
    ) -> Result<DecisionOutcome> {
        let symbol = decision.symbol_pair.as_str();
        let quote_ccy = symbol.rsplit('-').next().unwrap_or("EUR");

        let balance = self.gateway.equity(quote_ccy).await?;
        let spec = self.gateway.instrument_spec(symbol).await?;
        let price = self.gateway.current_price(symbol).await?;

        let intent = match self.sizer.size_order(
            decision,
            symbol_config,
            balance,
            price,
            &spec,
            0.0,
            0,
            signal_atr,
            config.atr_multiplier,
        ) {
            Ok(intent) => intent,
            Err(rejection) => {
                tracing::info!(symbol, %rejection, "decision not executed");
                return Ok(DecisionOutcome::Rejected(rejection.to_string()));
            }
        };

        // Write-ahead: the intent row exists before the exchange sees the
        // order. If this insert fails, no order is placed.
        let trade = Trade {
            id: Uuid::new_v4(),
            entry_order_id: String::new(),
            client_order_id: intent.client_order_id.clone(),
            signal_id: decision.signal_id,
            ai_decision_id: decision_id,
            user_config_id: decision.user_config_id,
            symbol_pair: symbol.to_string(),
            side: intent.side,
            quantity: intent.quantity,
            entry_price: intent.entry_price,
            initial_stop_loss: intent.stop_loss_price,
            take_profit: intent.take_profit_price,
            order_status: OrderStatus::PendingEntry,
            opened_at: Utc::now(),
            status_changed_at: Utc::now(),
            entry_fill_price: None,
            entry_fill_quantity: None,
            exit_algo_id: None,
            exit_order_id: None,
            amended_stop_loss: None,
            exit_fill_price: None,
            exit_fill_quantity: None,
            closed_at: None,
        };
        self.store.insert_trade(&trade).await?;

        // The client order id makes a retry of the same intent idempotent.
        let mut attempt = 0;
        let ack = loop {
            match self.gateway.place_entry_order(&intent).await {
                Ok(ack) => break ack,
                Err(e) if e.is_transient() && attempt == 0 => {
                    attempt += 1;
                    tracing::warn!(symbol, error = %e, "entry placement failed, retrying once");
                }
                Err(e) => {
                    self.store
                        .set_order_status(trade.id, OrderStatus::Failed)
                        .await?;
                    tracing::warn!(symbol, error = %e, "entry rejected, trade failed");
                    return Ok(DecisionOutcome::Rejected(format!("entry rejected: {}", e)));
                }
            }
        };
        self.store.set_entry_order_id(trade.id, &ack.order_id).await?;

        Ok(DecisionOutcome::Executed { trade_id: trade.id })
    }

    pub async fn monitor_once(&self, symbol: &str) -> Result<Vec<Uuid>> {
        self.monitor.tick(symbol).await
    }
}

/// Running pipeline: the lane tasks plus the control surface to stop and
/// inspect them.
pub struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    lanes: HashMap<String, (watch::Sender<bool>, JoinHandle<()>)>,
    status: StatusMap,
}

impl PipelineHandle {
    /// Spawn one lane per enabled symbol.
    pub async fn start(
        pipeline: Arc<Pipeline>,
        user_config: UserConfig,
        symbol_configs: Vec<SymbolConfig>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let status: StatusMap = Arc::new(RwLock::new(HashMap::new()));
        let mut lanes = HashMap::new();

        for symbol_config in symbol_configs {
            let symbol = symbol_config.symbol_pair.clone();
            status.write().await.insert(
                symbol.clone(),
                LaneStatus {
                    symbol_pair: symbol.clone(),
                    state: LaneState::Running,
                    non_terminal_trades: 0,
                    stale_trades: Vec::new(),
                    last_error: None,
                    last_tick: None,
                },
            );

            let (lane_shutdown, lane_rx) = watch::channel(false);
            let handle = tokio::spawn(run_lane(
                pipeline.clone(),
                user_config.clone(),
                symbol_config,
                status.clone(),
                shutdown.subscribe(),
                lane_rx,
            ));
            lanes.insert(symbol, (lane_shutdown, handle));
        }

        Self {
            shutdown,
            lanes,
            status,
        }
    }

    /// Graceful stop: lanes finish their in-flight iteration first.
    pub async fn stop_all(mut self) {
        let _ = self.shutdown.send(true);
        for (symbol, (_, handle)) in self.lanes.drain() {
            if let Err(e) = handle.await {
                tracing::error!(symbol, error = %e, "lane task panicked");
            }
        }
    }

    pub async fn stop_lane(&mut self, symbol: &str) {
        if let Some((lane_shutdown, handle)) = self.lanes.remove(symbol) {
            let _ = lane_shutdown.send(true);
            if let Err(e) = handle.await {
                tracing::error!(symbol, error = %e, "lane task panicked");
            }
        }
    }

    pub async fn status(&self) -> Vec<LaneStatus> {
        let mut statuses: Vec<LaneStatus> = self.status.read().await.values().cloned().collect();
        statuses.sort_by(|a, b| a.symbol_pair.cmp(&b.symbol_pair));
        statuses
    }
}

async fn run_lane(
    pipeline: Arc<Pipeline>,
    user_config: UserConfig,
    symbol_config: SymbolConfig,
    status: StatusMap,
    mut shutdown: watch::Receiver<bool>,
    mut lane_shutdown: watch::Receiver<bool>,
) {
    let symbol = symbol_config.symbol_pair.clone();
    tracing::info!(symbol, "lane started");

    let mut detector_ticker = interval_at(
        Instant::now(),
        Duration::from_secs(pipeline.settings.detector_interval_secs),
    );
    detector_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut monitor_ticker = interval_at(
        Instant::now() + Duration::from_secs(1),
        Duration::from_secs(pipeline.settings.monitor_interval_secs),
    );
    monitor_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = lane_shutdown.changed() => break,
            _ = detector_ticker.tick() => {
                let result = async {
                    pipeline.detect_once(&symbol, &user_config).await?;
                    pipeline.process_next_signal(&user_config, &symbol_config).await?;
                    Ok::<(), BotError>(())
                }
                .await;
                record_tick(&status, &symbol, &pipeline, result.err(), None).await;
            }
            _ = monitor_ticker.tick() => {
                let result = pipeline.monitor_once(&symbol).await;
                match result {
                    Ok(stale) => record_tick(&status, &symbol, &pipeline, None, Some(stale)).await,
                    Err(e) => record_tick(&status, &symbol, &pipeline, Some(e), None).await,
                }
            }
        }
    }

    if let Some(lane) = status.write().await.get_mut(&symbol) {
        lane.state = LaneState::Stopped;
    }
    tracing::info!(symbol, "lane stopped");
}

async fn record_tick(
    status: &StatusMap,
    symbol: &str,
    pipeline: &Pipeline,
    error: Option<BotError>,
    stale: Option<Vec<Uuid>>,
) {
    let non_terminal = pipeline
        .store
        .count_non_terminal_trades(symbol)
        .await
        .unwrap_or(-1);

    if let Some(e) = &error {
        tracing::error!(symbol, error = %e, "lane iteration failed");
    }

    if let Some(lane) = status.write().await.get_mut(symbol) {
        lane.non_terminal_trades = non_terminal;
        lane.last_tick = Some(Utc::now());
        if let Some(e) = error {
            lane.last_error = Some(e.to_string());
        }
        if let Some(stale) = stale {
            lane.stale_trades = stale;
        }
    }
}
