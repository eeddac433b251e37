/// OKX v5 REST adapter
///
/// Spot trading in cash mode. Every private request is signed with
/// HMAC-SHA256 over timestamp + method + path + body; the demo-trading
/// header routes orders to the OKX sandbox. All requests pass through a
/// shared rate limiter, and rate-limit rejections are retried with
/// exponential backoff.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::{
    ExchangeGateway, OrderAck, OrderExecState, OrderReport, ProtectiveOrderRequest,
    ProtectiveReport, ProtectiveState,
};
use crate::config::OkxSettings;
use crate::error::BotError;
use crate::models::TradeSide;
use crate::sizing::{floor_to_step, EquitySnapshot, InstrumentSpec, OrderIntent};
use crate::Result;

type HmacSha256 = Hmac<Sha256>;
type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const RATE_LIMIT_BACKOFF_MS: u64 = 500;
/// Attempts for the not-enough-funds shrink ladder on protective orders.
const MAX_FUNDS_RETRIES: u32 = 5;
/// Size multiplier applied per shrink attempt.
const FUNDS_SHRINK_FACTOR: f64 = 0.995;

/// OKX error code for insufficient balance.
const CODE_INSUFFICIENT_FUNDS: &str = "51008";
/// OKX error code for a reused client order id.
const CODE_DUPLICATE_CLIENT_ID: &str = "51016";

pub struct OkxGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    passphrase: String,
    demo_trading: bool,
    limiter: Arc<Limiter>,
}

impl OkxGateway {
    pub fn new(settings: &OkxSettings) -> Self {
        let per_second = NonZeroU32::new(settings.max_requests_per_second.max(1))
            .unwrap_or(NonZeroU32::MIN);
        Self {
            client: reqwest::Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            passphrase: settings.passphrase.clone(),
            demo_trading: settings.demo_trading,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| BotError::Config("invalid OKX API secret".to_string()))?;
        mac.update(format!("{}{}{}{}", timestamp, method, path, body).as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Signed request returning the envelope's `data` array. Retries 429s
    /// and OKX rate-limit codes with backoff; other failures map onto the
    /// error taxonomy for the caller to interpret.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> Result<Vec<Value>> {
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let url = format!("{}{}", self.base_url, path);

        let mut retry_count = 0;
        loop {
            self.limiter.until_ready().await;

            if retry_count > 0 {
                let delay_ms = RATE_LIMIT_BACKOFF_MS * 2_u64.pow(retry_count - 1);
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }

            let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
            let signature = self.sign(&timestamp, method, path, &body_str)?;

            let mut builder = match method {
                "GET" => self.client.get(&url),
                _ => self.client.post(&url),
            };
            builder = builder
                .header("OK-ACCESS-KEY", &self.api_key)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
                .header("content-type", "application/json");
            if self.demo_trading {
                builder = builder.header("x-simulated-trading", "1");
            }
            if let Some(b) = &body {
                builder = builder.json(b);
            }

            let response = builder.send().await?;
            if response.status().as_u16() == 429 {
                retry_count += 1;
                if retry_count >= MAX_RATE_LIMIT_RETRIES {
                    return Err(BotError::Transient("okx rate limited (429)".to_string()));
                }
                continue;
            }
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(BotError::Transient(format!(
                    "okx http error {}: {}",
                    status, text
                )));
            }

            let envelope: Value = response.json().await?;
            let code = envelope["code"].as_str().unwrap_or("");
            let data = envelope["data"].as_array().cloned().unwrap_or_default();

            if code == "0" {
                return Ok(data);
            }

            // OKX puts the useful code on the first data item.
            let s_code = data
                .first()
                .and_then(|d| d["sCode"].as_str())
                .unwrap_or(code);
            let s_msg = data
                .first()
                .and_then(|d| d["sMsg"].as_str())
                .or_else(|| envelope["msg"].as_str())
                .unwrap_or("");

            if s_code == "50011" {
                retry_count += 1;
                if retry_count >= MAX_RATE_LIMIT_RETRIES {
                    return Err(BotError::Transient(format!(
                        "okx rate limited (50011): {}",
                        s_msg
                    )));
                }
                continue;
            }

            return Err(BotError::ExchangeRejected {
                symbol: path.to_string(),
                reason: format!("{}: {}", s_code, s_msg),
            });
        }
    }

    /// Submit a market order. A duplicate-clOrdId rejection means an
    /// earlier attempt already went through; recover that order's ack
    /// instead of surfacing the rejection, so a retried intent can never
    /// leave a live order behind a failed trade.
    async fn submit_order(
        &self,
        symbol: &str,
        client_order_id: &str,
        body: Value,
    ) -> Result<OrderAck> {
        let data = match self.request("POST", "/api/v5/trade/order", Some(body)).await {
            Ok(data) => data,
            Err(e) if is_duplicate_client_id(&e) => {
                tracing::info!(
                    symbol,
                    client_order_id,
                    "client order id already known to the exchange, recovering original order"
                );
                return self.order_by_client_id(symbol, client_order_id).await;
            }
            Err(e) => return Err(e),
        };

        let item = data
            .first()
            .ok_or_else(|| BotError::Validation("empty order response".to_string()))?;
        let order_id = item["ordId"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BotError::Validation("order response missing ordId".to_string()))?;

        Ok(OrderAck {
            order_id: order_id.to_string(),
            client_order_id: client_order_id.to_string(),
        })
    }

    async fn order_by_client_id(&self, symbol: &str, client_order_id: &str) -> Result<OrderAck> {
        let path = format!(
            "/api/v5/trade/order?instId={}&clOrdId={}",
            symbol, client_order_id
        );
        let data = self.request("GET", &path, None).await?;
        let item = data.first().ok_or_else(|| {
            BotError::Validation(format!("no order found for client id {}", client_order_id))
        })?;
        let order_id = item["ordId"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BotError::Validation("order response missing ordId".to_string()))?;

        Ok(OrderAck {
            order_id: order_id.to_string(),
            client_order_id: client_order_id.to_string(),
        })
    }
}

fn field_f64(value: &Value, key: &str) -> f64 {
    value[key].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0)
}

fn is_insufficient_funds(err: &BotError) -> bool {
    matches!(err, BotError::ExchangeRejected { reason, .. } if reason.starts_with(CODE_INSUFFICIENT_FUNDS))
}

fn is_duplicate_client_id(err: &BotError) -> bool {
    matches!(err, BotError::ExchangeRejected { reason, .. } if reason.starts_with(CODE_DUPLICATE_CLIENT_ID))
}

#[async_trait]
impl ExchangeGateway for OkxGateway {
    async fn instrument_spec(&self, symbol: &str) -> Result<InstrumentSpec> {
        let path = format!("/api/v5/public/instruments?instType=SPOT&instId={}", symbol);
        let data = self.request("GET", &path, None).await?;
        let item = data.first().ok_or_else(|| {
            BotError::Validation(format!("no instrument data for {}", symbol))
        })?;

        Ok(InstrumentSpec {
            symbol_pair: symbol.to_string(),
            min_size: field_f64(item, "minSz"),
            lot_step: field_f64(item, "lotSz"),
        })
    }

    async fn equity(&self, quote_ccy: &str) -> Result<EquitySnapshot> {
        let data = self.request("GET", "/api/v5/account/balance", None).await?;
        let account = data
            .first()
            .ok_or_else(|| BotError::Validation("empty balance response".to_string()))?;

        let total_equity = field_f64(account, "totalEq");
        let available_cash = account["details"]
            .as_array()
            .and_then(|details| {
                details
                    .iter()
                    .find(|d| d["ccy"].as_str() == Some(quote_ccy))
            })
            .map(|d| field_f64(d, "availBal"))
            .unwrap_or(0.0);

        Ok(EquitySnapshot {
            total_equity,
            available_cash,
        })
    }

    async fn current_price(&self, symbol: &str) -> Result<f64> {
        let path = format!("/api/v5/market/ticker?instId={}", symbol);
        let data = self.request("GET", &path, None).await?;
        let last = data
            .first()
            .map(|t| field_f64(t, "last"))
            .filter(|p| *p > 0.0)
            .ok_or_else(|| BotError::Validation(format!("no ticker price for {}", symbol)))?;
        Ok(last)
    }

    async fn place_entry_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        let body = json!({
            "instId": intent.symbol_pair,
            "tdMode": "cash",
            "clOrdId": intent.client_order_id,
            "side": intent.side.to_string(),
            "ordType": "market",
            "sz": intent.quantity.to_string(),
            "tgtCcy": "base_ccy",
        });
        self.submit_order(&intent.symbol_pair, &intent.client_order_id, body)
            .await
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderReport> {
        let path = format!("/api/v5/trade/order?instId={}&ordId={}", symbol, order_id);
        let data = self.request("GET", &path, None).await?;
        let item = data
            .first()
            .ok_or_else(|| BotError::Validation(format!("no order data for {}", order_id)))?;

        let state: OrderExecState = item["state"]
            .as_str()
            .unwrap_or("")
            .parse()
            .map_err(BotError::Validation)?;
        let avg_px = field_f64(item, "avgPx");

        Ok(OrderReport {
            order_id: order_id.to_string(),
            state,
            filled_quantity: field_f64(item, "accFillSz"),
            avg_fill_price: if avg_px > 0.0 { Some(avg_px) } else { None },
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let body = json!({ "instId": symbol, "ordId": order_id });
        self.request("POST", "/api/v5/trade/cancel-order", Some(body))
            .await?;
        Ok(())
    }

    async fn place_protective_order(&self, request: &ProtectiveOrderRequest) -> Result<String> {
        // Fees can leave slightly less base currency than the reported
        // fill; shrink and retry instead of leaving the position naked.
        let mut size = request.quantity;
        let mut attempt = 0;
        loop {
            let body = json!({
                "instId": request.symbol_pair,
                "tdMode": "cash",
                "side": request.side.to_string(),
                "ordType": "conditional",
                "sz": size.to_string(),
                "slTriggerPx": request.trigger_price.to_string(),
                "slOrdPx": "-1",
                "algoClOrdId": request.client_order_id,
            });
            match self.request("POST", "/api/v5/trade/order-algo", Some(body)).await {
                Ok(data) => {
                    let algo_id = data
                        .first()
                        .and_then(|d| d["algoId"].as_str())
                        .filter(|s| !s.is_empty())
                        .ok_or_else(|| {
                            BotError::Validation("algo response missing algoId".to_string())
                        })?;
                    return Ok(algo_id.to_string());
                }
                Err(e) if is_insufficient_funds(&e) && attempt + 1 < MAX_FUNDS_RETRIES => {
                    attempt += 1;
                    size = floor_to_step(size * FUNDS_SHRINK_FACTOR, request.lot_step);
                    tracing::warn!(
                        symbol = %request.symbol_pair,
                        attempt,
                        new_size = size,
                        "insufficient funds for protective order, shrinking size"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_protective_status(&self, _symbol: &str, algo_id: &str) -> Result<ProtectiveReport> {
        let path = format!("/api/v5/trade/order-algo?algoId={}", algo_id);
        let data = self.request("GET", &path, None).await?;
        let item = data
            .first()
            .ok_or_else(|| BotError::Validation(format!("no algo data for {}", algo_id)))?;

        let state = match item["state"].as_str().unwrap_or("") {
            "live" => ProtectiveState::Live,
            "effective" => ProtectiveState::Triggered,
            "canceled" => ProtectiveState::Cancelled,
            "order_failed" => ProtectiveState::Failed,
            other => {
                return Err(BotError::Validation(format!("unknown algo state: {}", other)))
            }
        };

        let fill_px = field_f64(item, "actualPx");
        let fill_sz = field_f64(item, "actualSz");
        Ok(ProtectiveReport {
            algo_id: algo_id.to_string(),
            state,
            fill_price: if fill_px > 0.0 { Some(fill_px) } else { None },
            filled_quantity: if fill_sz > 0.0 { Some(fill_sz) } else { None },
        })
    }

    async fn amend_protective_order(
        &self,
        symbol: &str,
        algo_id: &str,
        new_trigger: f64,
    ) -> Result<()> {
        let body = json!({
            "instId": symbol,
            "algoId": algo_id,
            "newSlTriggerPx": new_trigger.to_string(),
        });
        self.request("POST", "/api/v5/trade/amend-algos", Some(body))
            .await?;
        Ok(())
    }

    async fn cancel_protective_order(&self, symbol: &str, algo_id: &str) -> Result<()> {
        let body = json!([{ "instId": symbol, "algoId": algo_id }]);
        self.request("POST", "/api/v5/trade/cancel-algos", Some(body))
            .await?;
        Ok(())
    }

    async fn place_exit_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<OrderAck> {
        let body = json!({
            "instId": symbol,
            "tdMode": "cash",
            "clOrdId": client_order_id,
            "side": side.to_string(),
            "ordType": "market",
            "sz": quantity.to_string(),
            "tgtCcy": "base_ccy",
        });
        self.submit_order(symbol, client_order_id, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn gateway(url: &str) -> OkxGateway {
        OkxGateway::new(&OkxSettings {
            base_url: url.to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            passphrase: "phrase".to_string(),
            demo_trading: true,
            max_requests_per_second: 100,
        })
    }

    #[tokio::test]
    async fn test_entry_order_request_shape() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v5/trade/order")
            .match_header("ok-access-key", "key")
            .match_header("x-simulated-trading", "1")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(serde_json::json!({
                    "instId": "BTC-EUR",
                    "tdMode": "cash",
                    "side": "buy",
                    "ordType": "market",
                    "sz": "0.1",
                })),
                Matcher::Regex("clOrdId".to_string()),
            ]))
            .with_status(200)
            .with_body(r#"{"code":"0","msg":"","data":[{"ordId":"312269865356374016","clOrdId":"abc","sCode":"0","sMsg":""}]}"#)
            .create_async()
            .await;

        let intent = OrderIntent {
            symbol_pair: "BTC-EUR".to_string(),
            side: TradeSide::Buy,
            quantity: 0.1,
            entry_price: 60000.0,
            stop_loss_price: 58800.0,
            take_profit_price: None,
            client_order_id: "abc123".to_string(),
        };
        let ack = gateway(&server.url()).place_entry_order(&intent).await.unwrap();

        mock.assert_async().await;
        assert_eq!(ack.order_id, "312269865356374016");
        assert_eq!(ack.client_order_id, "abc123");
    }

    #[tokio::test]
    async fn test_rejected_order_surfaces_exchange_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v5/trade/order")
            .with_status(200)
            .with_body(r#"{"code":"1","msg":"","data":[{"ordId":"","sCode":"51000","sMsg":"Parameter sz error"}]}"#)
            .create_async()
            .await;

        let intent = OrderIntent {
            symbol_pair: "BTC-EUR".to_string(),
            side: TradeSide::Buy,
            quantity: 0.0,
            entry_price: 60000.0,
            stop_loss_price: 58800.0,
            take_profit_price: None,
            client_order_id: "abc123".to_string(),
        };
        let err = gateway(&server.url()).place_entry_order(&intent).await.unwrap_err();

        match err {
            BotError::ExchangeRejected { reason, .. } => assert!(reason.contains("51000")),
            other => panic!("expected ExchangeRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replayed_entry_recovers_original_order() {
        let mut server = mockito::Server::new_async().await;
        // The exchange already knows this client order id.
        let post = server
            .mock("POST", "/api/v5/trade/order")
            .with_status(200)
            .with_body(r#"{"code":"1","msg":"","data":[{"ordId":"","sCode":"51016","sMsg":"Duplicate clOrdId"}]}"#)
            .create_async()
            .await;
        // Lookup by clOrdId recovers the order the first attempt created.
        let get = server
            .mock("GET", "/api/v5/trade/order")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("instId".into(), "BTC-EUR".into()),
                Matcher::UrlEncoded("clOrdId".into(), "abc123".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"code":"0","msg":"","data":[{"ordId":"111","clOrdId":"abc123","state":"filled","accFillSz":"0.1","avgPx":"60000"}]}"#)
            .create_async()
            .await;

        let intent = OrderIntent {
            symbol_pair: "BTC-EUR".to_string(),
            side: TradeSide::Buy,
            quantity: 0.1,
            entry_price: 60000.0,
            stop_loss_price: 58800.0,
            take_profit_price: None,
            client_order_id: "abc123".to_string(),
        };
        let ack = gateway(&server.url()).place_entry_order(&intent).await.unwrap();

        post.assert_async().await;
        get.assert_async().await;
        assert_eq!(ack.order_id, "111");
        assert_eq!(ack.client_order_id, "abc123");
    }

    #[tokio::test]
    async fn test_protective_order_shrinks_on_insufficient_funds() {
        let mut server = mockito::Server::new_async().await;
        // First attempt at full size fails with 51008.
        let first = server
            .mock("POST", "/api/v5/trade/order-algo")
            .match_body(Matcher::PartialJson(serde_json::json!({"sz": "0.1"})))
            .with_status(200)
            .with_body(r#"{"code":"1","msg":"","data":[{"algoId":"","sCode":"51008","sMsg":"insufficient balance"}]}"#)
            .create_async()
            .await;
        // Retry at 0.995x succeeds.
        let second = server
            .mock("POST", "/api/v5/trade/order-algo")
            .match_body(Matcher::PartialJson(serde_json::json!({"sz": "0.0995"})))
            .with_status(200)
            .with_body(r#"{"code":"0","msg":"","data":[{"algoId":"algo-1","sCode":"0","sMsg":""}]}"#)
            .create_async()
            .await;

        let request = ProtectiveOrderRequest {
            symbol_pair: "BTC-EUR".to_string(),
            side: TradeSide::Sell,
            quantity: 0.1,
            trigger_price: 58800.0,
            lot_step: 0.0001,
            client_order_id: "algo-c1".to_string(),
        };
        let algo_id = gateway(&server.url())
            .place_protective_order(&request)
            .await
            .unwrap();

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(algo_id, "algo-1");
    }

    #[tokio::test]
    async fn test_instrument_spec_parsing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v5/public/instruments")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"code":"0","msg":"","data":[{"instId":"BTC-EUR","minSz":"0.001","lotSz":"0.0001"}]}"#)
            .create_async()
            .await;

        let spec = gateway(&server.url()).instrument_spec("BTC-EUR").await.unwrap();
        assert_eq!(spec.min_size, 0.001);
        assert_eq!(spec.lot_step, 0.0001);
    }
}
