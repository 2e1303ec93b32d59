mod aggregator;
mod api;
mod config;
mod error;
mod exchange;
mod model;
mod storage;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aggregator::CandleAggregator;
use api::convert::{ConvertState, QuoteConsumerClient};
use config::AppConfig;
use exchange::binance::BinanceSource;
use exchange::{Connector, TradeSource};
use storage::CandleStore;
use storage::postgres::PostgresStore;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("exchange error")]
    Exchange,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(
    name = "crypto-converter",
    about = "Real-time trades-to-candles ingest and currency conversion services"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest exchange trades into one-second candles and serve them from memory
    QuoteConsumer,
    /// Serve conversion quotes priced from candle closes
    CurrencyConversion,
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    match cli.command {
        Command::QuoteConsumer => run_quote_consumer(config).await,
        Command::CurrencyConversion => run_currency_conversion(config).await,
    }
}

async fn run_quote_consumer(config: AppConfig) -> Result<(), Report<AppError>> {
    let store = open_store(&config).await?;

    let aggregator = Arc::new(CandleAggregator::new(Arc::clone(&store), config.candles));
    aggregator.warmup().await.change_context(AppError::Storage)?;

    let cancel = CancellationToken::new();

    let sources: Vec<Arc<dyn TradeSource>> = vec![Arc::new(BinanceSource::new())];
    let connector = Connector::new(
        sources,
        config.connector.trade_queue_capacity,
        config.connector.retry_period(),
    );
    let (trades, mut listeners) = connector
        .run(cancel.clone())
        .await
        .change_context(AppError::Exchange)?;

    let mut tasks = Arc::clone(&aggregator).run(trades, &cancel);
    tasks.append(&mut listeners);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.quote_consumer.port));
    let listener = TcpListener::bind(addr)
        .await
        .change_context(AppError::Runtime)?;
    info!(%addr, "quote-consumer listening");

    let router = api::candles::router(Arc::clone(&aggregator));
    let server_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "quote-consumer http server failed");
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .change_context(AppError::Runtime)?;

    info!("ctrl+c received, shutting down");
    cancel.cancel();

    for handle in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    // In-flight buckets survive the restart
    aggregator.flush().await.change_context(AppError::Storage)?;

    info!("shutdown complete");
    Ok(())
}

async fn run_currency_conversion(config: AppConfig) -> Result<(), Report<AppError>> {
    let store = open_store(&config).await?;

    let state = Arc::new(ConvertState {
        store,
        quotes: QuoteConsumerClient::new(&config.currency_conversion.quote_consumer_service),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.currency_conversion.port));
    let listener = TcpListener::bind(addr)
        .await
        .change_context(AppError::Runtime)?;
    info!(%addr, "currency-conversion listening");

    let router = api::convert::router(state, &config.currency_conversion.allowed_origins);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .change_context(AppError::Runtime)?;

    info!("shutdown complete");
    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn CandleStore>, Report<AppError>> {
    let dsn = config.database.require_dsn().change_context(AppError::Config)?;

    let store = PostgresStore::connect(dsn)
        .await
        .change_context(AppError::Storage)?;
    Ok(Arc::new(store))
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
