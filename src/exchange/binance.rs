use std::num::NonZeroU32;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::exchange::{SubscriptionBatch, TradeSource};
use crate::model::{ExchangeKind, Ticker, Trade};

const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";
const EXCHANGE_INFO_URL: &str = "https://api.binance.com/api/v3/exchangeInfo";
/// Binance documents 1024 streams per connection.
const STREAMS_PER_CONNECTION: usize = 1024;
/// Symbols packed into one SUBSCRIBE frame.
const SYMBOLS_PER_MESSAGE: usize = 200;
/// Binance allows ~5 subscription messages/sec; one send per 0.3 s stays under.
const SUBSCRIBE_DELAY: Duration = Duration::from_millis(300);
/// REST budget kept well under Binance's 5000 weight/min.
const BINANCE_REQUESTS_PER_SECOND: u32 = 20;

pub struct BinanceSource {
    client: reqwest::Client,
    rate_limiter: DefaultDirectRateLimiter,
}

impl BinanceSource {
    pub fn new() -> Self {
        let quota = Quota::per_second(NonZeroU32::new(BINANCE_REQUESTS_PER_SECOND).unwrap());
        Self {
            client: reqwest::Client::new(),
            rate_limiter: RateLimiter::direct(quota),
        }
    }

    async fn fetch_symbols(&self) -> Result<Vec<String>, Report<ExchangeError>> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(EXCHANGE_INFO_URL)
            .send()
            .await
            .change_context(ExchangeError::Request {
                exchange: "BINANCE".into(),
            })?;

        if !response.status().is_success() {
            return Err(Report::new(ExchangeError::Request {
                exchange: "BINANCE".into(),
            })
            .attach(format!("HTTP status: {}", response.status())));
        }

        let info: ExchangeInfo =
            response
                .json()
                .await
                .change_context(ExchangeError::ResponseParse {
                    exchange: "BINANCE".into(),
                })?;

        let mut symbols: Vec<String> = info.symbols.into_iter().map(|s| s.symbol).collect();
        // Deterministic connection assignment across restarts
        symbols.sort();
        Ok(symbols)
    }
}

impl Default for BinanceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TradeSource for BinanceSource {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    fn ws_url(&self) -> &str {
        BINANCE_WS_URL
    }

    fn subscription_plan(
        &self,
    ) -> BoxFuture<'_, Result<Vec<SubscriptionBatch>, Report<ExchangeError>>> {
        Box::pin(async move {
            info!("fetching binance symbol universe");
            let symbols = self.fetch_symbols().await?;
            info!(symbols = symbols.len(), "binance symbols fetched");
            Ok(plan_from_symbols(&symbols))
        })
    }

    fn parse_frame(&self, frame: &str) -> Option<Trade> {
        let payload: AggTradePayload = serde_json::from_str(frame).ok()?;
        if payload.event_type != "aggTrade" {
            return None;
        }
        Some(payload.into_trade())
    }
}

/// One connection per 1024 symbols, at most 200 symbols per SUBSCRIBE frame.
fn plan_from_symbols(symbols: &[String]) -> Vec<SubscriptionBatch> {
    symbols
        .chunks(STREAMS_PER_CONNECTION)
        .map(|per_connection| SubscriptionBatch {
            messages: per_connection
                .chunks(SYMBOLS_PER_MESSAGE)
                .map(subscribe_message)
                .collect(),
            delay: Some(SUBSCRIBE_DELAY),
        })
        .collect()
}

fn subscribe_message(symbols: &[String]) -> String {
    let params: Vec<String> = symbols
        .iter()
        .map(|symbol| format!("{}@aggTrade", symbol.to_lowercase()))
        .collect();

    serde_json::json!({
        "method": "SUBSCRIBE",
        "params": params,
        "id": Uuid::new_v4().to_string(),
    })
    .to_string()
}

/// Binance aggTrade event. Prices and quantities arrive as strings and are
/// decoded as exact decimals.
#[derive(Debug, Deserialize)]
struct AggTradePayload {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    /// Trade time in milliseconds
    #[serde(rename = "T")]
    trade_time: i64,
}

impl AggTradePayload {
    fn into_trade(self) -> Trade {
        Trade {
            time_ms: self.trade_time,
            ticker: Ticker::build(&self.symbol, ExchangeKind::Binance),
            price: self.price,
            volume: self.quantity,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
}
