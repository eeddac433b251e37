// Decision gateway: turns a detected signal into a validated, persisted
// trade decision. The reasoning engine sits behind a trait so the pipeline
// can run against a scripted engine in tests; the production engine calls
// OpenAI chat completions.

pub mod openai;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;

use crate::models::{AiDecision, Confidence, DecisionSource, Signal, TradeAction, UserConfig};
use crate::Result;

pub use openai::OpenAiEngine;

/// Everything the engine gets to see for one signal.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub symbol_pair: String,
    pub signal_summary: String,
    pub ema_metrics: String,
    pub confirmation_metrics: String,
    pub persona: String,
    pub fast_timeframe: String,
    pub slow_timeframe: String,
    pub strategy: String,
    /// Best-effort extra context (order book, news digest). Absence never
    /// blocks a decision.
    pub market_context: Option<String>,
}

/// Raw decision contract returned by the engine, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineDecision {
    pub action: String,
    pub confidence: String,
    pub risk_score: f64,
    pub position_size_pct: f64,
    pub stop_loss_pct: f64,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    pub rationale: String,
    #[serde(default)]
    pub key_factors: Vec<String>,
}

#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<EngineDecision>;

    fn model_name(&self) -> &str;
}

#[async_trait]
impl<T: ReasoningEngine + ?Sized> ReasoningEngine for std::sync::Arc<T> {
    async fn decide(&self, request: &DecisionRequest) -> Result<EngineDecision> {
        (**self).decide(request).await
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// A validated engine decision.
struct ValidatedDecision {
    action: TradeAction,
    confidence: Confidence,
    risk_score: f64,
    position_size_pct: f64,
    stop_loss_pct: f64,
    take_profit_pct: Option<f64>,
    rationale: String,
    key_factors: String,
}

fn validate(raw: EngineDecision) -> std::result::Result<ValidatedDecision, String> {
    let action: TradeAction = raw.action.parse()?;
    let confidence: Confidence = raw.confidence.parse()?;

    for (name, value) in [
        ("risk_score", raw.risk_score),
        ("position_size_pct", raw.position_size_pct),
        ("stop_loss_pct", raw.stop_loss_pct),
    ] {
        if !(0.0..=1.0).contains(&value) || !value.is_finite() {
            return Err(format!("{} out of range [0,1]: {}", name, value));
        }
    }
    if let Some(tp) = raw.take_profit_pct {
        if !(0.0..=5.0).contains(&tp) || !tp.is_finite() {
            return Err(format!("take_profit_pct out of range [0,5]: {}", tp));
        }
    }

    let key_factors = serde_json::to_string(&raw.key_factors)
        .map_err(|e| format!("key_factors not serializable: {}", e))?;

    Ok(ValidatedDecision {
        action,
        confidence,
        risk_score: raw.risk_score,
        position_size_pct: raw.position_size_pct,
        stop_loss_pct: raw.stop_loss_pct,
        take_profit_pct: raw.take_profit_pct,
        rationale: raw.rationale,
        key_factors,
    })
}

pub struct DecisionGateway<E> {
    engine: E,
    timeout: Duration,
}

impl<E: ReasoningEngine> DecisionGateway<E> {
    pub fn new(engine: E, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Produce a decision for one signal. Always returns a record worth
    /// persisting: engine failure, timeout, or invalid output degrades to a
    /// synthetic hold rather than propagating an error, so the signal can
    /// still be marked processed exactly once.
    pub async fn evaluate(
        &self,
        signal: &Signal,
        config: &UserConfig,
        fast_timeframe: &str,
        slow_timeframe: &str,
        market_context: Option<String>,
    ) -> AiDecision {
        let summary = format!(
            "{} signal on {} at {:.2} (bar {}, ATR {})",
            signal.kind,
            signal.symbol_pair,
            signal.price,
            signal.bar_ts.to_rfc3339(),
            signal
                .atr
                .map(|a| format!("{:.2}", a))
                .unwrap_or_else(|| "n/a".to_string()),
        );

        let request = DecisionRequest {
            symbol_pair: signal.symbol_pair.clone(),
            signal_summary: summary.clone(),
            ema_metrics: signal.ema_metrics.clone(),
            confirmation_metrics: signal.confirmation_metrics.clone(),
            persona: config.ai_persona.clone(),
            fast_timeframe: fast_timeframe.to_string(),
            slow_timeframe: slow_timeframe.to_string(),
            strategy: signal.strategy.clone(),
            market_context,
        };

        let base = AiDecision {
            id: None,
            signal_id: signal.id.unwrap_or(0),
            user_config_id: config.id,
            symbol_pair: signal.symbol_pair.clone(),
            fast_timeframe: fast_timeframe.to_string(),
            slow_timeframe: slow_timeframe.to_string(),
            strategy: signal.strategy.clone(),
            signal_summary: summary,
            action: TradeAction::Hold,
            confidence: Confidence::Low,
            risk_score: None,
            position_size_pct: None,
            stop_loss_pct: None,
            take_profit_pct: None,
            rationale: String::new(),
            key_factors: "[]".to_string(),
            source: DecisionSource::Degraded,
            model: Some(self.engine.model_name().to_string()),
            tools_used: None,
            created_at: Utc::now(),
        };

        let raw = match tokio::time::timeout(self.timeout, self.engine.decide(&request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                tracing::warn!(symbol = %signal.symbol_pair, error = %e, "reasoning engine failed, degrading to hold");
                return AiDecision {
                    rationale: format!("degraded: engine error: {}", e),
                    ..base
                };
            }
            Err(_) => {
                tracing::warn!(symbol = %signal.symbol_pair, timeout_secs = self.timeout.as_secs(), "reasoning engine timed out, degrading to hold");
                return AiDecision {
                    rationale: "degraded: engine timed out".to_string(),
                    ..base
                };
            }
        };

        match validate(raw) {
            Ok(v) => AiDecision {
                action: v.action,
                confidence: v.confidence,
                risk_score: Some(v.risk_score),
                position_size_pct: Some(v.position_size_pct),
                stop_loss_pct: Some(v.stop_loss_pct),
                take_profit_pct: v.take_profit_pct,
                rationale: v.rationale,
                key_factors: v.key_factors,
                source: DecisionSource::Ai,
                ..base
            },
            Err(reason) => {
                tracing::warn!(symbol = %signal.symbol_pair, %reason, "engine returned invalid decision, degrading to hold");
                AiDecision {
                    rationale: format!("degraded: invalid decision: {}", reason),
                    ..base
                }
            }
        }
    }
}
