use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::aggregator::{CandleAggregator, CandleLookup};
use crate::api::{self, ApiError};
use crate::model::{Candle, Ticker, Timestamp};

#[derive(Debug, Deserialize)]
struct CandleQuery {
    ticker: Ticker,
    timestamp: Option<Timestamp>,
}

pub fn router(aggregator: Arc<CandleAggregator>) -> Router {
    Router::new()
        .route("/candles", get(get_candle))
        .route("/health", get(api::health))
        .with_state(aggregator)
}

/// Latest in-memory candle for the ticker, or the one nearest below
/// `timestamp` when provided.
async fn get_candle(
    State(aggregator): State<Arc<CandleAggregator>>,
    Query(query): Query<CandleQuery>,
) -> Result<Json<Candle>, ApiError> {
    match aggregator.lookup(&query.ticker, query.timestamp) {
        CandleLookup::Found(candle) => Ok(Json(candle)),
        CandleLookup::TickerNotInMemory => Err(ApiError::NotFound("ticker_not_in_memory")),
        CandleLookup::NoCandlesForTicker => Err(ApiError::NotFound("no_candles_for_ticker")),
        CandleLookup::TooOldTimestamp => Err(ApiError::NotFound("too_old_timestamp")),
    }
}
