use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderValue;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

use crate::api::{self, ApiError};
use crate::error::QuoteServiceError;
use crate::model::{Candle, ExchangeKind, Ticker, Timestamp};
use crate::storage::CandleStore;

/// How old the latest candle may be before a "latest" quote is refused.
const QUOTE_MAX_AGE_SECS: i64 = 60;

/// Client for the quote-consumer's in-memory candle endpoint.
pub struct QuoteConsumerClient {
    client: reqwest::Client,
    base_url: String,
}

impl QuoteConsumerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    async fn get_candle(
        &self,
        ticker: &Ticker,
        timestamp: Option<Timestamp>,
    ) -> Result<Candle, Report<QuoteServiceError>> {
        let mut request = self
            .client
            .get(format!("{}/candles", self.base_url))
            .query(&[("ticker", ticker.as_str())]);
        if let Some(ts) = timestamp {
            request = request.query(&[("timestamp", ts.0)]);
        }

        let response = request
            .send()
            .await
            .change_context(QuoteServiceError::Unavailable)?;

        if !response.status().is_success() {
            return Err(Report::new(QuoteServiceError::Unavailable)
                .attach(format!("HTTP status: {}", response.status())));
        }

        response
            .json()
            .await
            .change_context(QuoteServiceError::BadResponse)
    }
}

pub struct ConvertState {
    pub store: Arc<dyn CandleStore>,
    pub quotes: QuoteConsumerClient,
}

pub fn router(state: Arc<ConvertState>, allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/convert", get(get_quote))
        .route("/health", get(api::health))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct QuoteQuery {
    amount: Decimal,
    from: String,
    to: String,
    timestamp: Option<Timestamp>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Quote {
    amount: Decimal,
    conversion_rate: Decimal,
}

/// Price `amount` of `from` in `to` using the candle close: the in-memory
/// service first, durable storage when it is unavailable.
async fn get_quote(
    State(state): State<Arc<ConvertState>>,
    Query(query): Query<QuoteQuery>,
) -> Result<Json<Quote>, ApiError> {
    if query.amount <= Decimal::ZERO {
        return Err(ApiError::UnprocessableEntity("amount_must_be_positive"));
    }

    // Only Binance publishes trades into this deployment for now
    let symbol = format!("{}{}", query.from.to_uppercase(), query.to.to_uppercase());
    let ticker = Ticker::build(&symbol, ExchangeKind::Binance);

    let candle = match state.quotes.get_candle(&ticker, query.timestamp).await {
        Ok(candle) => Some(candle),
        Err(report) => {
            warn!(error = ?report, %ticker, "in-memory quote service miss, using storage");
            let till = query.timestamp.unwrap_or_else(Timestamp::now);
            match state.store.get_latest_candle(&ticker, till).await {
                Ok(candle) => candle,
                Err(report) => {
                    error!(error = ?report, %ticker, "storage candle lookup failed");
                    None
                }
            }
        }
    };

    let Some(candle) = candle else {
        return Err(ApiError::NotFound("conversion_not_possible"));
    };

    // Staleness only guards "latest" requests; explicit instants are
    // historical by definition
    if query.timestamp.is_none() && is_stale(&candle, Utc::now()) {
        return Err(ApiError::NotFound("quotes_outdated"));
    }

    Ok(Json(Quote {
        amount: query.amount * candle.close,
        conversion_rate: candle.close,
    }))
}

fn is_stale(candle: &Candle, now: DateTime<Utc>) -> bool {
    candle.time < now - chrono::Duration::seconds(QUOTE_MAX_AGE_SECS)
}
