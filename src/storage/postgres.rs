use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::StorageError;
use crate::model::{Candle, Ticker, Timestamp};
use crate::storage::CandleStore;

type CandleRow = (
    String,
    DateTime<Utc>,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    Option<Decimal>,
);

fn row_to_candle(row: CandleRow) -> Candle {
    let (ticker, t, open, close, high, low, volume) = row;
    Candle {
        ticker: Ticker::from(ticker),
        time: t,
        open,
        close,
        high,
        low,
        volume: volume.unwrap_or_default(),
    }
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and run embedded migrations. Connection failure
    /// here is fatal for both services.
    pub async fn connect(dsn: &str) -> Result<Self, Report<StorageError>> {
        let pool = PgPoolOptions::new()
            .connect(dsn)
            .await
            .change_context(StorageError::Connect)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;

        Ok(Self { pool })
    }
}

impl CandleStore for PostgresStore {
    fn bulk_upsert(&self, candles: &[Candle]) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let candles = candles.to_vec();
        Box::pin(async move {
            if candles.is_empty() {
                return Ok(());
            }

            let mut tx = self
                .pool
                .begin()
                .await
                .change_context(StorageError::Upsert)?;

            for c in &candles {
                sqlx::query(
                    "INSERT INTO candles_1s (ticker, t, open, close, high, low, volume) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     ON CONFLICT (ticker, t) DO UPDATE SET \
                     open = EXCLUDED.open, close = EXCLUDED.close, \
                     high = EXCLUDED.high, low = EXCLUDED.low, volume = EXCLUDED.volume",
                )
                .bind(c.ticker.as_str())
                .bind(c.time)
                .bind(c.open)
                .bind(c.close)
                .bind(c.high)
                .bind(c.low)
                .bind(c.volume)
                .execute(&mut *tx)
                .await
                .change_context(StorageError::Upsert)?;
            }

            tx.commit().await.change_context(StorageError::Upsert)?;
            Ok(())
        })
    }

    fn remove_old_candles(
        &self,
        till: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64, Report<StorageError>>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM candles_1s WHERE t < $1")
                .bind(till)
                .execute(&self.pool)
                .await
                .change_context(StorageError::Delete)?;
            Ok(result.rows_affected())
        })
    }

    fn get_latest_candle(
        &self,
        ticker: &Ticker,
        till: Timestamp,
    ) -> BoxFuture<'_, Result<Option<Candle>, Report<StorageError>>> {
        let ticker = ticker.clone();
        Box::pin(async move {
            let row: Option<CandleRow> = sqlx::query_as(
                "SELECT ticker, t, open, close, high, low, volume FROM candles_1s \
                 WHERE ticker = $1 AND t <= $2 \
                 ORDER BY t DESC LIMIT 1",
            )
            .bind(ticker.as_str())
            .bind(till.to_dt())
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(row.map(row_to_candle))
        })
    }

    fn get_candles(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxStream<'_, Result<Candle, Report<StorageError>>> {
        sqlx::query_as::<_, CandleRow>(
            "SELECT ticker, t, open, close, high, low, volume FROM candles_1s \
             WHERE t >= $1 AND t < $2 \
             ORDER BY t ASC",
        )
        .bind(from)
        .bind(to)
        .fetch(&self.pool)
        .map(|row| row.map(row_to_candle).change_context(StorageError::Query))
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn row_maps_null_volume_to_zero() {
        let row: CandleRow = (
            "BTCUSDT.BINANCE".into(),
            DateTime::from_timestamp(1_700_000_001, 0).unwrap(),
            dec!(50000),
            dec!(50100),
            dec!(50200),
            dec!(49900),
            None,
        );
        let candle = row_to_candle(row);
        assert_eq!(candle.ticker.as_str(), "BTCUSDT.BINANCE");
        assert_eq!(candle.bucket().0, 1_700_000_001);
        assert_eq!(candle.volume, dec!(0));
    }

    /// Integration test: requires a live Postgres pointed to by DATABASE_URL.
    /// Run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn integration_upsert_and_read_back() {
        let dsn = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
        let store = PostgresStore::connect(&dsn).await.unwrap();

        let ticker = Ticker::from("ITESTUSDT.BINANCE".to_string());
        let candle = Candle {
            ticker: ticker.clone(),
            time: DateTime::from_timestamp(1_700_000_001, 0).unwrap(),
            open: dec!(1),
            close: dec!(2),
            high: dec!(3),
            low: dec!(0.5),
            volume: dec!(10),
        };

        store.bulk_upsert(std::slice::from_ref(&candle)).await.unwrap();

        // Upsert again with a new close: conflict must overwrite
        let mut updated = candle.clone();
        updated.close = dec!(4);
        store.bulk_upsert(std::slice::from_ref(&updated)).await.unwrap();

        let read = store
            .get_latest_candle(&ticker, Timestamp(1_700_000_100))
            .await
            .unwrap()
            .expect("candle missing");
        assert_eq!(read.close, dec!(4));

        let removed = store
            .remove_old_candles(DateTime::from_timestamp(1_800_000_000, 0).unwrap())
            .await
            .unwrap();
        assert!(removed >= 1);
    }
}
