use anyhow::Context;
use clap::{Parser, Subcommand};
use cross_arb_core::{AppConfig, ExchangeClient, TradingPair};
use cross_arb_data::{BufferedStore, DatabaseClient, PgStore};
use cross_arb_engine::{NullStore, OpportunityStore};
use cross_arb_exchange_coinbase::{CoinbaseClient, CoinbaseClientConfig};
use cross_arb_exchange_kraken::{KrakenClient, KrakenClientConfig};
use cross_arb_orchestrator::Supervisor;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cross-arb")]
#[command(about = "Cross-exchange cryptocurrency arbitrage engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the arbitrage engine
    Run {
        /// Config file path (defaults to $ARB_CONFIG or config/Config.toml)
        #[arg(short, long, default_value_t = AppConfig::default_path())]
        config: String,
    },
    /// Validate the configuration and exit
    CheckConfig {
        /// Config file path (defaults to $ARB_CONFIG or config/Config.toml)
        #[arg(short, long, default_value_t = AppConfig::default_path())]
        config: String,
    },
    /// Connect to the configured exchanges, print one status snapshot, exit
    Status {
        /// Config file path (defaults to $ARB_CONFIG or config/Config.toml)
        #[arg(short, long, default_value_t = AppConfig::default_path())]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_engine(&config).await?,
        Commands::CheckConfig { config } => check_config(&config)?,
        Commands::Status { config } => run_status(&config).await?,
    }

    Ok(())
}

fn check_config(path: &str) -> anyhow::Result<()> {
    let config = AppConfig::load(path)?;
    println!(
        "configuration ok: {} pairs, {} exchanges, paper_trading={}",
        config.trading_pairs.len(),
        config.enabled_exchanges().count(),
        config.paper_trading_enabled
    );
    Ok(())
}

fn build_clients(config: &AppConfig) -> anyhow::Result<Vec<Arc<dyn ExchangeClient>>> {
    let mut clients: Vec<Arc<dyn ExchangeClient>> = Vec::new();
    for exchange in config.enabled_exchanges() {
        match exchange.exchange_id.as_str() {
            "coinbase" => {
                let client =
                    CoinbaseClient::new(CoinbaseClientConfig::from_exchange_config(exchange))?;
                clients.push(Arc::new(client));
            }
            "kraken" => {
                let client = KrakenClient::new(KrakenClientConfig::from_exchange_config(
                    exchange,
                    config.polling_interval_ms,
                ))?;
                clients.push(Arc::new(client));
            }
            other => anyhow::bail!("unsupported exchange: {other}"),
        }
    }
    Ok(clients)
}

async fn run_engine(config_path: &str) -> anyhow::Result<()> {
    let config = AppConfig::load(config_path)?;
    tracing::info!(config = %config_path, "Starting cross-arb");

    let clients = build_clients(&config)?;

    // Persistence is best-effort at startup: an unreachable database falls
    // back to the in-memory store so paper sessions still run.
    let (store, pool): (Arc<dyn OpportunityStore>, _) =
        match DatabaseClient::new(&config.database.url, config.database.max_connections).await {
            Ok(client) => {
                let pool = client.pool();
                let store = BufferedStore::spawn(PgStore::new(pool.clone()));
                (store, Some(pool))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Database unavailable, running without persistence");
                (Arc::new(NullStore), None)
            }
        };

    let handle = Supervisor::spawn(config, clients, store, pool);
    handle.start().await?;
    tracing::info!("Engine running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.stop().await?;
    handle.shutdown().await;
    Ok(())
}

/// One-shot status: connect each configured exchange, fetch a book snapshot
/// for the first pair, print a line per exchange, and exit.
async fn run_status(config_path: &str) -> anyhow::Result<()> {
    let config = AppConfig::load(config_path)?;
    let pair = config
        .trading_pairs
        .first()
        .cloned()
        .context("no trading pairs configured")?;
    let clients = build_clients(&config)?;

    println!("exchange status for {pair}:");
    for client in &clients {
        println!("  {}", snapshot_line(client.as_ref(), &pair).await);
    }

    for client in &clients {
        client.stop().await;
    }
    Ok(())
}

async fn snapshot_line(client: &dyn ExchangeClient, pair: &TradingPair) -> String {
    let exchange = client.exchange_id();

    if let Err(e) = client.connect().await {
        return format!("{exchange:<10} unreachable: {e}");
    }
    if let Err(e) = client.subscribe_order_book(pair).await {
        return format!("{exchange:<10} subscribe failed: {e}");
    }

    let snapshot =
        tokio::time::timeout(Duration::from_secs(10), client.get_order_book_snapshot(pair, 5))
            .await;
    let health = client.health();

    match snapshot {
        Ok(Ok(book)) => {
            let bid = book
                .best_bid()
                .map_or_else(|| "-".to_string(), |l| l.price.to_string());
            let ask = book
                .best_ask()
                .map_or_else(|| "-".to_string(), |l| l.price.to_string());
            format!(
                "{exchange:<10} connected={} best_bid={bid} best_ask={ask} messages_in={}",
                health.connected, health.messages_in
            )
        }
        Ok(Err(e)) => format!(
            "{exchange:<10} connected={} book unavailable: {e}",
            health.connected
        ),
        Err(_) => format!(
            "{exchange:<10} connected={} book fetch timed out",
            health.connected
        ),
    }
}
