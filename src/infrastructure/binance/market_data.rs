//! Binance spot REST adapter for the `MarketDataFetcher` port.
//!
//! Uses the public market-data endpoints only (klines and ticker/price),
//! which Binance serves without authentication.

use crate::domain::ports::MarketDataFetcher;
use crate::domain::types::{Bar, SessionKey};
use crate::infrastructure::core::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::infrastructure::core::http_client_factory::{HttpClientFactory, build_url_with_query};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Maximum klines Binance returns per request.
const KLINE_PAGE_LIMIT: usize = 1000;

pub struct BinanceMarketData {
    client: ClientWithMiddleware,
    base_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl BinanceMarketData {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: HttpClientFactory::create_client(),
            base_url: base_url.into(),
            circuit_breaker: Arc::new(CircuitBreaker::new(
                "BinanceMarketData",
                5,
                3,
                Duration::from_secs(60),
            )),
        }
    }

    /// "ETH/USDT" -> "ETHUSDT".
    fn api_symbol(symbol: &str) -> String {
        symbol.replace('/', "")
    }

    /// One klines request: up to `limit` bars ending at `end_time`
    /// (inclusive, epoch ms) or at the present when `end_time` is `None`.
    /// Bars come back oldest first.
    async fn fetch_klines(
        &self,
        key: &SessionKey,
        limit: usize,
        end_time: Option<i64>,
    ) -> Result<Vec<Bar>> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", Self::api_symbol(&key.symbol)),
            ("interval", key.time_frame.clone()),
            ("limit", limit.to_string()),
        ];
        if let Some(end) = end_time {
            params.push(("endTime", end.to_string()));
        }
        let url_with_query = build_url_with_query(&url, &params);

        let response = self
            .client
            .get(&url_with_query)
            .send()
            .await
            .context("Failed to fetch klines from Binance")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance klines fetch failed: {}", error_text);
        }

        let rows: Vec<serde_json::Value> = response
            .json()
            .await
            .context("Failed to parse Binance klines response")?;

        Ok(rows.into_iter().filter_map(parse_kline_row).collect())
    }
}

#[async_trait]
impl MarketDataFetcher for BinanceMarketData {
    async fn fetch_history(&self, key: &SessionKey, limit: usize) -> Result<Vec<Bar>> {
        self.circuit_breaker
            .call(async {
                let mut collected: VecDeque<Bar> = VecDeque::new();
                let mut end_time: Option<i64> = None;

                // Page backwards from the present until enough bars are
                // collected or the exchange runs out of history.
                while collected.len() < limit {
                    let page_limit = (limit - collected.len()).min(KLINE_PAGE_LIMIT);
                    let page = self.fetch_klines(key, page_limit, end_time).await?;
                    if page.is_empty() {
                        break;
                    }

                    let exhausted = page.len() < page_limit;
                    end_time = page.first().map(|bar| bar.timestamp - 1);
                    for bar in page.into_iter().rev() {
                        collected.push_front(bar);
                    }
                    if exhausted {
                        break;
                    }
                }

                info!(
                    "BinanceMarketData: Fetched {} bars for {}",
                    collected.len(),
                    key
                );
                Ok(collected.into_iter().collect())
            })
            .await
            .map_err(flatten_breaker_error)
    }

    async fn fetch_latest_bar(&self, key: &SessionKey) -> Result<Bar> {
        self.circuit_breaker
            .call(async {
                let bars = self.fetch_klines(key, 2, None).await?;
                bars.last()
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("Binance returned no klines for {}", key))
            })
            .await
            .map_err(flatten_breaker_error)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<f64> {
        self.circuit_breaker
            .call(async {
                let url = format!("{}/api/v3/ticker/price", self.base_url);
                let url_with_query =
                    build_url_with_query(&url, &[("symbol", Self::api_symbol(symbol))]);

                let response = self
                    .client
                    .get(&url_with_query)
                    .send()
                    .await
                    .context("Failed to fetch ticker from Binance")?;

                if !response.status().is_success() {
                    let error_text = response.text().await.unwrap_or_default();
                    anyhow::bail!("Binance ticker fetch failed: {}", error_text);
                }

                #[derive(serde::Deserialize)]
                struct PriceTicker {
                    price: String,
                }

                let ticker: PriceTicker = response
                    .json()
                    .await
                    .context("Failed to parse Binance ticker response")?;
                ticker
                    .price
                    .parse::<f64>()
                    .with_context(|| format!("Unparseable ticker price for {}", symbol))
            })
            .await
            .map_err(flatten_breaker_error)
    }
}

/// Kline rows are heterogeneous arrays:
/// [open time, open, high, low, close, volume, close time, ...], with the
/// prices quoted as strings. Malformed rows are dropped.
fn parse_kline_row(row: serde_json::Value) -> Option<Bar> {
    let fields = row.as_array()?;
    if fields.len() < 6 {
        return None;
    }

    Some(Bar {
        timestamp: fields[0].as_i64()?,
        open: fields[1].as_str()?.parse().ok()?,
        high: fields[2].as_str()?.parse().ok()?,
        low: fields[3].as_str()?.parse().ok()?,
        close: fields[4].as_str()?.parse().ok()?,
        volume: fields[5].as_str()?.parse().ok()?,
    })
}

fn flatten_breaker_error(err: CircuitBreakerError<anyhow::Error>) -> anyhow::Error {
    match err {
        CircuitBreakerError::Open(msg) => {
            anyhow::anyhow!("Binance market data unavailable: {}", msg)
        }
        CircuitBreakerError::Inner(inner) => inner,
    }
}
