pub mod postgres;

use chrono::{DateTime, Utc};
use error_stack::Report;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::StorageError;
use crate::model::{Candle, Ticker, Timestamp};

/// Durable candle store: an opaque map keyed by `(ticker, bucket second)`.
///
/// Uses `BoxFuture` (from `futures`) instead of `async fn` in trait to keep
/// the trait object-safe (`dyn CandleStore`).
pub trait CandleStore: Send + Sync {
    /// Idempotent on `(ticker, t)`: a conflicting row is overwritten with the
    /// new OHLCV. Empty input is a no-op.
    fn bulk_upsert(&self, candles: &[Candle]) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    /// Delete every candle with bucket start strictly before `till`.
    /// Returns the number of rows removed.
    fn remove_old_candles(
        &self,
        till: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, Report<StorageError>>>;

    /// The candle for `ticker` with the greatest bucket start `<= till`.
    fn get_latest_candle(
        &self,
        ticker: &Ticker,
        till: Timestamp,
    ) -> BoxFuture<'_, Result<Option<Candle>, Report<StorageError>>>;

    /// Lazy scan of all candles with `from <= t < to`, used by the
    /// aggregator's startup warmup.
    fn get_candles(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxStream<'_, Result<Candle, Report<StorageError>>>;
}
