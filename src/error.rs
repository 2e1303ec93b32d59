use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum ExchangeError {
    #[display("failed to connect to {exchange}")]
    Connection { exchange: String },
    #[display("request to {exchange} failed")]
    Request { exchange: String },
    #[display("failed to parse response from {exchange}")]
    ResponseParse { exchange: String },
    #[display("subscription to {exchange} failed")]
    Subscription { exchange: String },
}

#[derive(Debug, Display, Error)]
pub enum StorageError {
    #[display("failed to connect to database")]
    Connect,
    #[display("database migration failed")]
    Migration,
    #[display("failed to upsert candles")]
    Upsert,
    #[display("failed to delete old candles")]
    Delete,
    #[display("failed to query candles")]
    Query,
}

/// The quote-consumer's in-memory candle endpoint was unreachable or
/// answered non-2xx; callers fall back to durable storage.
#[derive(Debug, Display, Error)]
pub enum QuoteServiceError {
    #[display("quote consumer service unavailable")]
    Unavailable,
    #[display("quote consumer returned no usable candle")]
    BadResponse,
}
