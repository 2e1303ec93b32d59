pub mod binance;

use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::model::{ExchangeKind, Trade};

/// Subscription work for one WebSocket connection: the messages to send
/// after connecting and the pause between sends imposed by the exchange's
/// subscription rate limit.
#[derive(Debug, Clone)]
pub struct SubscriptionBatch {
    pub messages: Vec<String>,
    pub delay: Option<Duration>,
}

/// Abstraction over an exchange's real-time trade feed.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn TradeSource`).
pub trait TradeSource: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    fn ws_url(&self) -> &str;

    /// Decompose the exchange's symbol universe into per-connection
    /// subscription batches. One batch = one WebSocket connection.
    fn subscription_plan(
        &self,
    ) -> BoxFuture<'_, Result<Vec<SubscriptionBatch>, Report<ExchangeError>>>;

    /// Decode a frame into a trade. `None` for anything that is not a trade
    /// (heartbeats, subscription acks).
    fn parse_frame(&self, frame: &str) -> Option<Trade>;
}

const DEFAULT_LAUNCH_DELAY: Duration = Duration::from_millis(200);

enum ListenOutcome {
    Cancelled,
    ChannelClosed,
}

/// Runs the listener fleet for every registered trade source and fans all
/// decoded trades into one bounded channel.
pub struct Connector {
    sources: Vec<Arc<dyn TradeSource>>,
    trade_queue_capacity: usize,
    retry_period: Duration,
}

impl Connector {
    pub fn new(
        sources: Vec<Arc<dyn TradeSource>>,
        trade_queue_capacity: usize,
        retry_period: Duration,
    ) -> Self {
        Self {
            sources,
            trade_queue_capacity,
            retry_period,
        }
    }

    /// Start every configured source. Returns the shared trade channel
    /// receiver and the listener handles.
    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<(mpsc::Receiver<Trade>, Vec<JoinHandle<()>>), Report<ExchangeError>> {
        let (tx, rx) = mpsc::channel(self.trade_queue_capacity);
        let mut listeners = Vec::new();

        for source in &self.sources {
            let batches = source.subscription_plan().await?;
            info!(
                exchange = %source.kind(),
                connections = batches.len(),
                "starting trade listeners"
            );

            let total = batches.len();
            for (index, batch) in batches.into_iter().enumerate() {
                let stagger = 5 * batch.delay.unwrap_or(DEFAULT_LAUNCH_DELAY);
                listeners.push(tokio::spawn(connection_loop(
                    Arc::clone(source),
                    batch,
                    tx.clone(),
                    cancel.clone(),
                    self.retry_period,
                )));
                // Opening many connections from one IP at once gets throttled
                if index + 1 < total {
                    sleep(stagger).await;
                }
            }
        }

        Ok((rx, listeners))
    }
}

async fn connection_loop(
    source: Arc<dyn TradeSource>,
    batch: SubscriptionBatch,
    tx: mpsc::Sender<Trade>,
    cancel: CancellationToken,
    retry_period: Duration,
) {
    let exchange = source.kind();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connect_and_listen(source.as_ref(), &batch, &tx, &cancel).await {
            Ok(ListenOutcome::Cancelled) => {
                debug!(%exchange, "listener cancelled");
                break;
            }
            Ok(ListenOutcome::ChannelClosed) => {
                info!(%exchange, "trade channel closed, stopping listener");
                break;
            }
            Err(report) => {
                warn!(%exchange, error = ?report, "connection lost, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(retry_period) => {}
                }
            }
        }
    }
}

async fn connect_and_listen(
    source: &dyn TradeSource,
    batch: &SubscriptionBatch,
    tx: &mpsc::Sender<Trade>,
    cancel: &CancellationToken,
) -> Result<ListenOutcome, Report<ExchangeError>> {
    let exchange = source.kind();

    let (ws_stream, _) =
        connect_async(source.ws_url())
            .await
            .change_context(ExchangeError::Connection {
                exchange: exchange.to_string(),
            })?;

    let (mut write, mut read) = ws_stream.split();

    info!(%exchange, subscriptions = batch.messages.len(), "ws connected");

    // One permit per configured delay keeps subscription sends under the
    // exchange's messages-per-second limit.
    let pacer: Option<DefaultDirectRateLimiter> = batch
        .delay
        .and_then(Quota::with_period)
        .map(RateLimiter::direct);

    for message in &batch.messages {
        if let Some(pacer) = &pacer {
            pacer.until_ready().await;
        }
        write
            .send(Message::Text(message.clone().into()))
            .await
            .change_context(ExchangeError::Subscription {
                exchange: exchange.to_string(),
            })?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(ListenOutcome::Cancelled);
            }
            msg = read.next() => match msg {
                None => {
                    return Err(Report::new(ExchangeError::Connection {
                        exchange: exchange.to_string(),
                    })
                    .attach("stream ended"));
                }
                Some(Err(e)) => {
                    return Err(Report::new(e).change_context(ExchangeError::Connection {
                        exchange: exchange.to_string(),
                    }));
                }
                Some(Ok(Message::Text(text))) => {
                    match source.parse_frame(&text) {
                        // Blocks when the channel is full: backpressure onto
                        // the socket instead of unbounded memory growth
                        Some(trade) => {
                            if tx.send(trade).await.is_err() {
                                return Ok(ListenOutcome::ChannelClosed);
                            }
                        }
                        None => debug!(%exchange, frame = %text, "non-trade frame"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    // Server pings periodically; an unanswered ping gets the
                    // connection dropped
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    return Err(Report::new(ExchangeError::Connection {
                        exchange: exchange.to_string(),
                    })
                    .attach("server closed connection"));
                }
                Some(Ok(_)) => {}
            }
        }
    }
}
