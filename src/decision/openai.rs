/// OpenAI-backed reasoning engine
///
/// Sends the signal context to the chat completions endpoint and parses the
/// structured JSON decision. Retries transient failures with exponential
/// backoff; 429 responses are always retried, other HTTP errors are not.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DecisionRequest, EngineDecision, ReasoningEngine};
use crate::error::BotError;
use crate::Result;

const MAX_TOKENS: u32 = 1024;
const BACKOFF_BASE_MS: u64 = 1000;

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: String,
}

pub struct OpenAiEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: std::time::Duration,
    max_retries: u32,
}

impl OpenAiEngine {
    pub fn new(
        base_url: &str,
        api_key: String,
        model: String,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout: std::time::Duration::from_secs(timeout_secs),
            max_retries,
        }
    }

    fn system_prompt(persona: &str) -> String {
        format!(
            "You are {}, acting as a disciplined cryptocurrency trading advisor. \
             Evaluate the presented chart signal and respond with valid JSON only, \
             no markdown formatting. Be conservative: when the evidence is mixed, \
             prefer hold.",
            persona
        )
    }

    fn user_prompt(request: &DecisionRequest) -> String {
        let context = request
            .market_context
            .as_deref()
            .unwrap_or("(no additional market context available)");

        format!(
            r#"## Signal
{summary}

Strategy: {strategy} (fast timeframe {fast}, slow/confirmation timeframe {slow})

## EMA metrics
{ema}

## Confirmation metrics
{confirm}

## Market context
{context}

Respond ONLY with valid JSON (no markdown, no code blocks):

{{
  "action": "buy|sell|hold|close",
  "confidence": "low|medium|high",
  "risk_score": 0.0,
  "position_size_pct": 0.0,
  "stop_loss_pct": 0.0,
  "take_profit_pct": 0.0,
  "rationale": "1-2 sentence explanation",
  "key_factors": ["factor", "factor"]
}}

risk_score, position_size_pct and stop_loss_pct must be in [0, 1].
take_profit_pct must be in [0, 5]."#,
            summary = request.signal_summary,
            strategy = request.strategy,
            fast = request.fast_timeframe,
            slow = request.slow_timeframe,
            ema = request.ema_metrics,
            confirm = request.confirmation_metrics,
            context = context,
        )
    }
}

#[async_trait]
impl ReasoningEngine for OpenAiEngine {
    async fn decide(&self, request: &DecisionRequest) -> Result<EngineDecision> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = OpenAIRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            temperature: 0.0,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: Self::system_prompt(&request.persona),
                },
                Message {
                    role: "user".to_string(),
                    content: Self::user_prompt(request),
                },
            ],
        };

        let mut retry_count = 0;
        loop {
            if retry_count > 0 {
                let delay_ms = BACKOFF_BASE_MS * 2_u64.pow(retry_count - 1);
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }

            let response = match self
                .client
                .post(&url)
                .timeout(self.timeout)
                .header("Authorization", format!("Bearer {}", &self.api_key))
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= self.max_retries {
                        return Err(BotError::Transient(format!("openai network error: {}", e)));
                    }
                    continue;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();

                if status.as_u16() == 429 {
                    retry_count += 1;
                    if retry_count >= self.max_retries {
                        return Err(BotError::Transient(format!(
                            "openai rate limited after {} attempts: {}",
                            retry_count, text
                        )));
                    }
                    continue;
                }

                return Err(BotError::Transient(format!(
                    "openai api error {}: {}",
                    status, text
                )));
            }

            let parsed: OpenAIResponse = match response.json().await {
                Ok(r) => r,
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= self.max_retries {
                        return Err(BotError::Validation(format!(
                            "openai response decode error: {}",
                            e
                        )));
                    }
                    continue;
                }
            };

            let mut text = parsed
                .choices
                .first()
                .map(|c| c.message.content.clone())
                .ok_or_else(|| BotError::Validation("openai response had no choices".to_string()))?;

            // Strip markdown code fences the model sometimes adds anyway.
            if text.starts_with("```") {
                text = text
                    .trim_start_matches("```json")
                    .trim_start_matches("```")
                    .trim_end_matches("```")
                    .trim()
                    .to_string();
            }

            match serde_json::from_str::<EngineDecision>(&text) {
                Ok(decision) => return Ok(decision),
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= self.max_retries {
                        return Err(BotError::Validation(format!(
                            "decision JSON parse error: {} (text: {})",
                            e, text
                        )));
                    }
                    continue;
                }
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
