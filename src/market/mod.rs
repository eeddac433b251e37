// Public market data: OHLC candles and last traded price from the OKX v5
// REST API. No authentication needed for these endpoints.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::error::BotError;
use crate::models::Candle;
use crate::Result;

/// Source of closed OHLC bars and spot prices
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Fetch up to `limit` most recent candles for `symbol` at `bar`
    /// granularity, oldest first. The newest candle may still be forming;
    /// callers that need closed bars only should drop the last element.
    async fn fetch_candles(&self, symbol: &str, bar: &str, limit: u32) -> Result<Vec<Candle>>;

    /// Last traded price for `symbol`.
    async fn current_price(&self, symbol: &str) -> Result<f64>;
}

/// OKX v5 public market data client
#[derive(Clone)]
pub struct OkxMarketData {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct OkxEnvelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    last: String,
}

impl OkxMarketData {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_envelope(&self, url: &str) -> Result<OkxEnvelope> {
        let envelope: OkxEnvelope = self.client.get(url).send().await?.json().await?;
        if envelope.code != "0" {
            return Err(BotError::Transient(format!(
                "okx market data error {}: {}",
                envelope.code, envelope.msg
            )));
        }
        Ok(envelope)
    }
}

fn parse_field(value: &serde_json::Value, what: &str) -> Result<f64> {
    value
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| BotError::Validation(format!("candle {} is not numeric: {}", what, value)))
}

#[async_trait]
impl MarketData for OkxMarketData {
    async fn fetch_candles(&self, symbol: &str, bar: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v5/market/candles?instId={}&bar={}&limit={}",
            self.base_url, symbol, bar, limit
        );
        let envelope = self.get_envelope(&url).await?;

        // OKX returns rows newest-first: [ts, o, h, l, c, vol, ...]
        let mut candles = Vec::with_capacity(envelope.data.len());
        for row in &envelope.data {
            let fields = row
                .as_array()
                .ok_or_else(|| BotError::Validation("candle row is not an array".to_string()))?;
            if fields.len() < 6 {
                return Err(BotError::Validation(format!(
                    "candle row has {} fields, expected at least 6",
                    fields.len()
                )));
            }

            let ts_ms: i64 = fields[0]
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    BotError::Validation(format!("candle timestamp not numeric: {}", fields[0]))
                })?;
            let timestamp: DateTime<Utc> = Utc
                .timestamp_millis_opt(ts_ms)
                .single()
                .ok_or_else(|| {
                    BotError::Validation(format!("candle timestamp out of range: {}", ts_ms))
                })?;

            candles.push(Candle {
                symbol: symbol.to_string(),
                timestamp,
                open: parse_field(&fields[1], "open")?,
                high: parse_field(&fields[2], "high")?,
                low: parse_field(&fields[3], "low")?,
                close: parse_field(&fields[4], "close")?,
                volume: parse_field(&fields[5], "volume")?,
            });
        }

        candles.reverse();
        Ok(candles)
    }

    async fn current_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/api/v5/market/ticker?instId={}", self.base_url, symbol);
        let envelope = self.get_envelope(&url).await?;

        let first = envelope
            .data
            .first()
            .ok_or_else(|| BotError::Validation(format!("empty ticker response for {}", symbol)))?;
        let ticker: TickerData = serde_json::from_value(first.clone())?;
        ticker
            .last
            .parse::<f64>()
            .map_err(|_| BotError::Validation(format!("ticker price not numeric: {}", ticker.last)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_candles_parses_and_orders() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{"code":"0","msg":"","data":[
            ["1700003600000","102","104","101","103","12","0","0","1"],
            ["1700000000000","100","103","99","102","10","0","0","1"]
        ]}"#;
        let mock = server
            .mock("GET", "/api/v5/market/candles")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let market = OkxMarketData::new(&server.url());
        let candles = market.fetch_candles("BTC-EUR", "1H", 2).await.unwrap();

        mock.assert_async().await;
        assert_eq!(candles.len(), 2);
        // Oldest first after reversal
        assert!(candles[0].timestamp < candles[1].timestamp);
        assert_eq!(candles[0].close, 102.0);
        assert_eq!(candles[1].close, 103.0);
    }

    #[tokio::test]
    async fn test_current_price() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{"code":"0","msg":"","data":[{"instId":"BTC-EUR","last":"60123.5"}]}"#;
        server
            .mock("GET", "/api/v5/market/ticker")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let market = OkxMarketData::new(&server.url());
        let price = market.current_price("BTC-EUR").await.unwrap();
        assert_eq!(price, 60123.5);
    }

    #[tokio::test]
    async fn test_api_error_code_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{"code":"50011","msg":"rate limit","data":[]}"#;
        server
            .mock("GET", "/api/v5/market/ticker")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let market = OkxMarketData::new(&server.url());
        let err = market.current_price("BTC-EUR").await.unwrap_err();
        assert!(err.is_transient());
    }
}
