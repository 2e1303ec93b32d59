use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    Binance,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binance => write!(f, "BINANCE"),
        }
    }
}

/// Exchange-scoped instrument identity, serialized as `SYMBOL.EXCHANGE`
/// (e.g. `BTCUSDT.BINANCE`). Stable across the ingest pipeline, the HTTP
/// APIs and the database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticker(String);

impl Ticker {
    pub fn build(symbol: &str, exchange: ExchangeKind) -> Self {
        Self(format!("{symbol}.{exchange}"))
    }

    // Accessors for the two halves; the ingest path only ever builds
    #[allow(dead_code)]
    pub fn symbol(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    #[allow(dead_code)]
    pub fn exchange(&self) -> &str {
        self.0.split('.').nth(1).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Ticker {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unix seconds, UTC. The candle bucket key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_dt(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_dt(self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single executed trade as published by an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    /// Event time in milliseconds since the Unix epoch.
    pub time_ms: i64,
    pub ticker: Ticker,
    pub price: Decimal,
    pub volume: Decimal,
}

impl Trade {
    /// The one-second bucket this trade belongs to.
    pub fn bucket(&self) -> Timestamp {
        Timestamp(self.time_ms.div_euclid(1000))
    }

    /// Seed a fresh candle from the first trade of a bucket.
    pub fn to_candle(&self) -> Candle {
        Candle {
            ticker: self.ticker.clone(),
            time: self.bucket().to_dt(),
            open: self.price,
            close: self.price,
            high: self.price,
            low: self.price,
            volume: self.volume,
        }
    }
}

/// One-second OHLCV candle.
///
/// The wire format uses short field names shared by both services, so a
/// candle serialized by the quote-consumer deserializes unchanged in the
/// currency-conversion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(rename = "T")]
    pub ticker: Ticker,
    /// Bucket start instant (second-aligned, UTC).
    #[serde(rename = "t")]
    pub time: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
}

impl Candle {
    /// Fold a later trade of the same bucket into this candle.
    pub fn update(&mut self, trade: &Trade) {
        self.volume += trade.volume;
        self.close = trade.price;
        self.low = self.low.min(trade.price);
        self.high = self.high.max(trade.price);
    }

    pub fn bucket(&self) -> Timestamp {
        Timestamp::from_dt(self.time)
    }
}
