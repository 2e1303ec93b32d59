use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use error_stack::Report;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::CandleFlowConfig;
use crate::error::StorageError;
use crate::model::{Candle, Ticker, Timestamp, Trade};
use crate::storage::CandleStore;

pub type CandleBuffer = HashMap<Ticker, BTreeMap<Timestamp, Candle>>;

#[derive(Default)]
struct BufferState {
    buffer: CandleBuffer,
    /// Buckets mutated since the last successful flush.
    dirty: HashMap<Ticker, BTreeSet<Timestamp>>,
}

/// Outcome of a candle lookup against the in-memory buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum CandleLookup {
    Found(Candle),
    TickerNotInMemory,
    NoCandlesForTicker,
    TooOldTimestamp,
}

/// Buckets the trade stream into one-second candles, keeps the recent
/// window in memory, and runs the flush / buffer-clean / storage-clean
/// duties.
///
/// `buffer` and `dirty` are mutated together, so one mutex guards both.
/// The lock is never held across an await point.
pub struct CandleAggregator {
    state: Mutex<BufferState>,
    store: Arc<dyn CandleStore>,
    config: CandleFlowConfig,
}

impl CandleAggregator {
    pub fn new(store: Arc<dyn CandleStore>, config: CandleFlowConfig) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            store,
            config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().expect("aggregator state lock poisoned")
    }

    /// Spawn the trade intake loop and the three periodic duties.
    pub fn run(
        self: Arc<Self>,
        trades: mpsc::Receiver<Trade>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self).intake_loop(trades, cancel.clone())),
            tokio::spawn(Arc::clone(&self).flush_loop(cancel.clone())),
            tokio::spawn(Arc::clone(&self).buffer_clean_loop(cancel.clone())),
            tokio::spawn(Arc::clone(&self).storage_clean_loop(cancel.clone())),
        ]
    }

    /// Load the recent candle window from storage so a restarted process
    /// serves quotes immediately.
    pub async fn warmup(&self) -> Result<(), Report<StorageError>> {
        let started = Instant::now();
        let now = Utc::now();
        let from = now - chrono::Duration::seconds(self.config.buffer_interval as i64);

        let mut candles = self.store.get_candles(from, now);
        let mut loaded = 0usize;
        while let Some(candle) = candles.next().await {
            let candle = candle?;
            let mut state = self.lock();
            state
                .buffer
                .entry(candle.ticker.clone())
                .or_default()
                .insert(candle.bucket(), candle);
            loaded += 1;
        }

        info!(loaded, elapsed = ?started.elapsed(), "buffer warmed up from storage");
        Ok(())
    }

    /// Buffer a trade into its bucket's candle and mark the bucket for the
    /// next flush.
    pub fn apply_trade(&self, trade: &Trade) {
        let bucket = trade.bucket();
        let mut state = self.lock();

        state
            .dirty
            .entry(trade.ticker.clone())
            .or_default()
            .insert(bucket);

        match state
            .buffer
            .entry(trade.ticker.clone())
            .or_default()
            .entry(bucket)
        {
            Entry::Vacant(slot) => {
                slot.insert(trade.to_candle());
            }
            Entry::Occupied(slot) => slot.into_mut().update(trade),
        }
    }

    /// Resolve the candle for `ticker` nearest to `timestamp` (latest when
    /// absent or in the future; exact match; otherwise the greatest bucket
    /// strictly below it).
    pub fn lookup(&self, ticker: &Ticker, timestamp: Option<Timestamp>) -> CandleLookup {
        let state = self.lock();

        let Some(ticker_buffer) = state.buffer.get(ticker) else {
            return CandleLookup::TickerNotInMemory;
        };
        let Some((latest, latest_candle)) = ticker_buffer.last_key_value() else {
            return CandleLookup::NoCandlesForTicker;
        };
        let Some(ts) = timestamp else {
            return CandleLookup::Found(latest_candle.clone());
        };

        if ts > *latest {
            return CandleLookup::Found(latest_candle.clone());
        }
        if let Some(candle) = ticker_buffer.get(&ts) {
            return CandleLookup::Found(candle.clone());
        }
        match ticker_buffer.range(..ts).next_back() {
            Some((_, candle)) => CandleLookup::Found(candle.clone()),
            None => CandleLookup::TooOldTimestamp,
        }
    }

    /// Snapshot every dirty candle and persist the batch. The dirty set is
    /// taken together with the snapshot and merged back if the upsert
    /// fails, so a failed flush is retried in full on the next cycle.
    pub async fn flush(&self) -> Result<(), Report<StorageError>> {
        let started = Instant::now();

        let (candles, taken) = {
            let mut state = self.lock();
            let taken = std::mem::take(&mut state.dirty);
            let mut candles = Vec::new();
            for (ticker, buckets) in &taken {
                let Some(ticker_buffer) = state.buffer.get(ticker) else {
                    continue;
                };
                // Evicted buckets may linger in the dirty set; skip them
                candles.extend(
                    buckets
                        .iter()
                        .filter_map(|bucket| ticker_buffer.get(bucket).cloned()),
                );
            }
            (candles, taken)
        };

        info!(candles = candles.len(), tickers = taken.len(), "flushing candles to storage");

        if let Err(report) = self.store.bulk_upsert(&candles).await {
            let mut state = self.lock();
            for (ticker, buckets) in taken {
                state.dirty.entry(ticker).or_default().extend(buckets);
            }
            return Err(report);
        }

        debug!(elapsed = ?started.elapsed(), "flush complete");
        Ok(())
    }

    /// Evict buckets old enough that their final flush has already run.
    /// The threshold trails `buffer_interval` by one flush period so a
    /// boundary bucket cannot be dropped before it was persisted.
    pub fn clean_buffer(&self) {
        let remove_till = Utc::now().timestamp()
            - (self.config.buffer_interval + self.config.flush_to_db_period) as i64;

        let mut removed = 0usize;
        let mut state = self.lock();
        state.buffer.retain(|_, ticker_buffer| {
            let kept = ticker_buffer.split_off(&Timestamp(remove_till + 1));
            removed += ticker_buffer.len();
            *ticker_buffer = kept;
            !ticker_buffer.is_empty()
        });
        let tickers = state.buffer.len();
        drop(state);

        info!(removed, tickers, "buffer clean pass complete");
    }

    /// Drop candles older than the retention window from durable storage.
    pub async fn clean_storage(&self) -> Result<(), Report<StorageError>> {
        let started = Instant::now();
        let till = Utc::now() - chrono::Duration::days(self.config.storage_max_interval as i64);

        info!(%till, "removing old candles from storage");
        let removed = self.store.remove_old_candles(till).await?;
        info!(removed, elapsed = ?started.elapsed(), "storage clean pass complete");
        Ok(())
    }

    async fn intake_loop(self: Arc<Self>, mut trades: mpsc::Receiver<Trade>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                trade = trades.recv() => match trade {
                    Some(trade) => self.apply_trade(&trade),
                    None => {
                        info!("trade channel closed, stopping intake");
                        break;
                    }
                }
            }
        }
    }

    async fn flush_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.flush_to_db_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(period) => {
                    // A failed duty run is logged; the next cycle retries
                    if let Err(report) = self.flush().await {
                        error!(error = ?report, "flush to storage failed");
                    }
                }
            }
        }
    }

    async fn buffer_clean_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.buffer_clean_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(period) => self.clean_buffer(),
            }
        }
    }

    async fn storage_clean_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.storage_clean_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(period) => {
                    if let Err(report) = self.clean_storage().await {
                        error!(error = ?report, "storage clean failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::{DateTime, Utc};
    use futures::future::BoxFuture;
    use futures::stream::{self, BoxStream};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::model::ExchangeKind;

    #[derive(Default)]
    struct FakeStore {
        rows: Mutex<HashMap<(Ticker, Timestamp), Candle>>,
        fail_upserts: AtomicBool,
        upsert_sizes: Mutex<Vec<usize>>,
    }

    impl CandleStore for FakeStore {
        fn bulk_upsert(
            &self,
            candles: &[Candle],
        ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
            let candles = candles.to_vec();
            Box::pin(async move {
                if self.fail_upserts.load(Ordering::SeqCst) {
                    return Err(Report::new(StorageError::Upsert));
                }
                self.upsert_sizes.lock().unwrap().push(candles.len());
                let mut rows = self.rows.lock().unwrap();
                for candle in candles {
                    rows.insert((candle.ticker.clone(), candle.bucket()), candle);
                }
                Ok(())
            })
        }

        fn remove_old_candles(
            &self,
            till: DateTime<Utc>,
        ) -> BoxFuture<'_, Result<u64, Report<StorageError>>> {
            Box::pin(async move {
                let mut rows = self.rows.lock().unwrap();
                let before = rows.len();
                rows.retain(|_, candle| candle.time >= till);
                Ok((before - rows.len()) as u64)
            })
        }

        fn get_latest_candle(
            &self,
            ticker: &Ticker,
            till: Timestamp,
        ) -> BoxFuture<'_, Result<Option<Candle>, Report<StorageError>>> {
            let ticker = ticker.clone();
            Box::pin(async move {
                let rows = self.rows.lock().unwrap();
                Ok(rows
                    .values()
                    .filter(|c| c.ticker == ticker && c.bucket() <= till)
                    .max_by_key(|c| c.bucket())
                    .cloned())
            })
        }

        fn get_candles(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> BoxStream<'_, Result<Candle, Report<StorageError>>> {
            let selected: Vec<_> = self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|c| c.time >= from && c.time < to)
                .cloned()
                .map(Ok)
                .collect();
            stream::iter(selected).boxed()
        }
    }

    fn ticker() -> Ticker {
        Ticker::build("BTCUSDT", ExchangeKind::Binance)
    }

    fn trade(time_ms: i64, price: Decimal, volume: Decimal) -> Trade {
        Trade {
            time_ms,
            ticker: ticker(),
            price,
            volume,
        }
    }

    fn aggregator() -> (Arc<FakeStore>, CandleAggregator) {
        let store = Arc::new(FakeStore::default());
        let aggregator =
            CandleAggregator::new(Arc::clone(&store) as Arc<dyn CandleStore>, CandleFlowConfig::default());
        (store, aggregator)
    }

    fn found(lookup: CandleLookup) -> Candle {
        match lookup {
            CandleLookup::Found(candle) => candle,
            other => panic!("expected candle, got {other:?}"),
        }
    }

    #[test]
    fn single_trade_creates_candle() {
        let (_, aggregator) = aggregator();
        aggregator.apply_trade(&trade(1_700_000_001_000, dec!(50000), dec!(0.1)));

        let candle = found(aggregator.lookup(&ticker(), None));
        assert_eq!(candle.bucket().0, 1_700_000_001);
        assert_eq!(candle.open, dec!(50000));
        assert_eq!(candle.close, dec!(50000));
        assert_eq!(candle.high, dec!(50000));
        assert_eq!(candle.low, dec!(50000));
        assert_eq!(candle.volume, dec!(0.1));
    }

    #[test]
    fn second_trade_in_bucket_mutates_candle() {
        let (_, aggregator) = aggregator();
        aggregator.apply_trade(&trade(1_700_000_001_000, dec!(50000), dec!(0.1)));
        aggregator.apply_trade(&trade(1_700_000_001_500, dec!(50100), dec!(0.2)));

        let candle = found(aggregator.lookup(&ticker(), None));
        assert_eq!(candle.open, dec!(50000));
        assert_eq!(candle.close, dec!(50100));
        assert_eq!(candle.high, dec!(50100));
        assert_eq!(candle.low, dec!(50000));
        assert_eq!(candle.volume, dec!(0.3));
    }

    #[test]
    fn bucket_boundary_splits_candles() {
        let (_, aggregator) = aggregator();
        aggregator.apply_trade(&trade(1_700_000_001_999, dec!(50000), dec!(0.1)));
        aggregator.apply_trade(&trade(1_700_000_002_000, dec!(50100), dec!(0.2)));

        let first = found(aggregator.lookup(&ticker(), Some(Timestamp(1_700_000_001))));
        let second = found(aggregator.lookup(&ticker(), Some(Timestamp(1_700_000_002))));
        assert_eq!(first.bucket().0, 1_700_000_001);
        assert_eq!(first.volume, dec!(0.1));
        assert_eq!(second.bucket().0, 1_700_000_002);
        assert_eq!(second.volume, dec!(0.2));
    }

    #[test]
    fn lookup_resolution_rules() {
        let (_, aggregator) = aggregator();
        for second in [100, 120, 140] {
            aggregator.apply_trade(&trade(second * 1000, Decimal::from(second), dec!(1)));
        }

        // Unknown ticker
        let other = Ticker::build("ETHUSDT", ExchangeKind::Binance);
        assert_eq!(aggregator.lookup(&other, None), CandleLookup::TickerNotInMemory);

        // No timestamp and future timestamp resolve to the latest bucket
        assert_eq!(found(aggregator.lookup(&ticker(), None)).bucket().0, 140);
        assert_eq!(
            found(aggregator.lookup(&ticker(), Some(Timestamp(500)))).bucket().0,
            140
        );

        // Exact hit
        assert_eq!(
            found(aggregator.lookup(&ticker(), Some(Timestamp(120)))).bucket().0,
            120
        );

        // Greatest bucket strictly below the queried instant
        assert_eq!(
            found(aggregator.lookup(&ticker(), Some(Timestamp(135)))).bucket().0,
            120
        );

        // Older than everything in the buffer
        assert_eq!(
            aggregator.lookup(&ticker(), Some(Timestamp(95))),
            CandleLookup::TooOldTimestamp
        );
    }

    #[tokio::test]
    async fn flush_persists_dirty_and_second_flush_is_empty() {
        let (store, aggregator) = aggregator();
        aggregator.apply_trade(&trade(1_700_000_001_000, dec!(50000), dec!(0.1)));
        aggregator.apply_trade(&trade(1_700_000_002_000, dec!(50100), dec!(0.2)));

        aggregator.flush().await.unwrap();
        assert_eq!(store.rows.lock().unwrap().len(), 2);

        // No trades in between: the follow-up flush carries nothing
        aggregator.flush().await.unwrap();
        assert_eq!(*store.upsert_sizes.lock().unwrap(), vec![2, 0]);
    }

    #[tokio::test]
    async fn failed_flush_keeps_buckets_dirty() {
        let (store, aggregator) = aggregator();
        aggregator.apply_trade(&trade(1_700_000_001_000, dec!(50000), dec!(0.1)));

        store.fail_upserts.store(true, Ordering::SeqCst);
        assert!(aggregator.flush().await.is_err());
        assert!(store.rows.lock().unwrap().is_empty());

        // Same buckets retried on the next cycle
        store.fail_upserts.store(false, Ordering::SeqCst);
        aggregator.flush().await.unwrap();
        assert_eq!(store.rows.lock().unwrap().len(), 1);
    }

    #[test]
    fn clean_buffer_evicts_only_buckets_past_the_widened_threshold() {
        let (_, aggregator) = aggregator();
        let now = Utc::now().timestamp();

        // Past buffer_interval + flush period: must go
        aggregator.apply_trade(&trade((now - 200) * 1000, dec!(1), dec!(1)));
        // Past buffer_interval but within one flush period of it: must stay
        aggregator.apply_trade(&trade((now - 65) * 1000, dec!(2), dec!(1)));
        // Fresh
        aggregator.apply_trade(&trade((now - 5) * 1000, dec!(3), dec!(1)));

        aggregator.clean_buffer();

        assert_eq!(
            aggregator.lookup(&ticker(), Some(Timestamp(now - 200))),
            CandleLookup::TooOldTimestamp
        );
        assert_eq!(found(aggregator.lookup(&ticker(), Some(Timestamp(now - 65)))).open, dec!(2));
        assert_eq!(found(aggregator.lookup(&ticker(), None)).open, dec!(3));
    }

    #[test]
    fn clean_buffer_drops_empty_ticker_entries() {
        let (_, aggregator) = aggregator();
        let now = Utc::now().timestamp();
        aggregator.apply_trade(&trade((now - 500) * 1000, dec!(1), dec!(1)));

        aggregator.clean_buffer();

        assert_eq!(aggregator.lookup(&ticker(), None), CandleLookup::TickerNotInMemory);
    }

    #[tokio::test]
    async fn warmup_then_flush_round_trip() {
        let (store, aggregator) = aggregator();
        // Second-aligned base keeps the first two trades in one bucket
        let base_ms = (Utc::now().timestamp() - 5) * 1000;

        aggregator.apply_trade(&trade(base_ms + 100, dec!(50000), dec!(0.1)));
        aggregator.apply_trade(&trade(base_ms + 300, dec!(50100), dec!(0.2)));
        aggregator.apply_trade(&trade(base_ms + 3000, dec!(49900), dec!(0.3)));
        aggregator.flush().await.unwrap();

        let original = found(aggregator.lookup(&ticker(), None));

        // Fresh process over the same storage
        let restarted = CandleAggregator::new(
            Arc::clone(&store) as Arc<dyn CandleStore>,
            CandleFlowConfig::default(),
        );
        restarted.warmup().await.unwrap();

        assert_eq!(found(restarted.lookup(&ticker(), None)), original);
        let first_bucket = Timestamp(base_ms.div_euclid(1000));
        let first = found(restarted.lookup(&ticker(), Some(first_bucket)));
        assert_eq!(first.volume, dec!(0.3));
        assert_eq!(first.close, dec!(50100));
    }

    #[tokio::test]
    async fn storage_clean_removes_beyond_retention() {
        let (store, aggregator) = aggregator();
        let now_ms = Utc::now().timestamp_millis();

        let old = trade(now_ms - chrono::Duration::days(8).num_milliseconds(), dec!(1), dec!(1));
        let fresh = trade(now_ms, dec!(2), dec!(2));
        store
            .bulk_upsert(&[old.to_candle(), fresh.to_candle()])
            .await
            .unwrap();

        aggregator.clean_storage().await.unwrap();
        assert_eq!(store.rows.lock().unwrap().len(), 1);

        let latest = store
            .get_latest_candle(&ticker(), Timestamp::now())
            .await
            .unwrap()
            .expect("fresh candle missing");
        assert_eq!(latest.open, dec!(2));
    }

    #[tokio::test]
    async fn run_consumes_trades_until_cancelled() {
        let (store, aggregator) = aggregator();
        let aggregator = Arc::new(aggregator);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(10);

        let handles = Arc::clone(&aggregator).run(rx, &cancel);

        tx.send(trade(1_700_000_001_000, dec!(50000), dec!(0.1)))
            .await
            .unwrap();
        tx.send(trade(1_700_000_001_400, dec!(50100), dec!(0.2)))
            .await
            .unwrap();

        // Let the intake loop drain the channel
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        // Final flush after shutdown persists in-flight buckets
        aggregator.flush().await.unwrap();
        assert_eq!(store.rows.lock().unwrap().len(), 1);
        let candle = found(aggregator.lookup(&ticker(), None));
        assert_eq!(candle.volume, dec!(0.3));
    }
}
