//! Market data aggregator.
//!
//! Maintains the latest [`OrderBook`] per `(exchange, pair)` and fans merged
//! ticks out over a broadcast channel. Producers never block: slow consumers
//! lag the bounded channel and the oldest queued events are dropped for that
//! consumer (tokio broadcast semantics), which readers observe and count.

use cross_arb_core::{ExchangeClient, OrderBook, Result, TradingPair};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One merged event: the pair, which exchange moved, and every current book.
#[derive(Debug, Clone)]
pub struct BookTick {
    /// Pair that updated.
    pub pair: TradingPair,
    /// Exchange whose book changed.
    pub updated_exchange: String,
    /// Latest book per exchange for the pair.
    pub books: HashMap<String, OrderBook>,
}

/// Aggregator counters for status surfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct BookTickCount {
    /// Active broadcast receivers.
    pub receivers: usize,
    /// Books dropped because a newer one was already held.
    pub stale_dropped: u64,
}

/// Configuration for the aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Broadcast capacity; lagging consumers drop their oldest events.
    pub channel_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// Merges per-exchange book streams into a unified per-pair view.
pub struct MarketDataAggregator {
    books: Arc<RwLock<HashMap<TradingPair, HashMap<String, OrderBook>>>>,
    event_tx: broadcast::Sender<BookTick>,
    stale_dropped: Arc<AtomicU64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MarketDataAggregator {
    /// Creates an aggregator with the given channel capacity.
    #[must_use]
    pub fn new(config: AggregatorConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            books: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            stale_dropped: Arc::new(AtomicU64::new(0)),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Subscribes every client to every pair and starts merge tasks.
    /// Idempotent: a second start while running is a no-op.
    ///
    /// # Errors
    /// Returns the first subscription error; already-started streams keep
    /// running and are torn down by `stop`.
    pub async fn start(
        self: &Arc<Self>,
        clients: &[Arc<dyn ExchangeClient>],
        pairs: &[TradingPair],
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            exchanges = clients.len(),
            pairs = pairs.len(),
            "Starting market data aggregator"
        );

        for client in clients {
            for pair in pairs {
                client.subscribe_order_book(pair).await?;
                let mut updates = client.order_book_updates(pair).await?;
                let aggregator = Arc::clone(self);
                let exchange = client.exchange_id().to_string();
                let pair = pair.clone();

                let handle = tokio::spawn(async move {
                    while let Some(book) = updates.recv().await {
                        aggregator.ingest(book);
                    }
                    debug!(exchange = %exchange, pair = %pair, "Book stream ended");
                });
                self.tasks.lock().push(handle);
            }
        }
        Ok(())
    }

    /// Applies one book update and emits a merged tick.
    ///
    /// A book older than the held one for the same `(exchange, pair)` is
    /// dropped and counted.
    pub fn ingest(&self, book: OrderBook) {
        let pair = book.pair.clone();
        let exchange = book.exchange_id.clone();

        let tick = {
            let mut map = self.books.write();
            let by_exchange = map.entry(pair.clone()).or_default();
            if let Some(held) = by_exchange.get(&exchange) {
                if book.timestamp < held.timestamp {
                    self.stale_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(exchange = %exchange, pair = %pair, "Dropping stale book");
                    return;
                }
            }
            by_exchange.insert(exchange.clone(), book);
            BookTick {
                pair,
                updated_exchange: exchange,
                books: by_exchange.clone(),
            }
        };

        // Errors only mean no receivers are subscribed right now.
        let _ = self.event_tx.send(tick);
    }

    /// Opens a new consumer of merged ticks. Multi-fan-out: each receiver
    /// sees every event, subject to its own lag budget.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BookTick> {
        self.event_tx.subscribe()
    }

    /// Non-blocking snapshot of the current books for a pair.
    #[must_use]
    pub fn latest(&self, pair: &TradingPair) -> HashMap<String, OrderBook> {
        self.books
            .read()
            .get(pair)
            .cloned()
            .unwrap_or_default()
    }

    /// Books dropped because a newer one was already held.
    #[must_use]
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped.load(Ordering::Relaxed)
    }

    /// Tick counters for status surfaces.
    #[must_use]
    pub fn counters(&self) -> BookTickCount {
        BookTickCount {
            receivers: self.event_tx.receiver_count(),
            stale_dropped: self.stale_dropped(),
        }
    }

    /// Stops merge tasks. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Merge task ended abnormally");
                }
            }
        }
        info!("Market data aggregator stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    fn book(exchange: &str, bid: rust_decimal::Decimal, age_secs: i64) -> OrderBook {
        let mut book = OrderBook::new(exchange, pair());
        book.apply_snapshot(
            vec![(bid, dec!(1))],
            vec![(bid + dec!(10), dec!(1))],
            Utc::now() - Duration::seconds(age_secs),
        );
        book
    }

    #[tokio::test]
    async fn test_ingest_emits_merged_tick() {
        let aggregator = MarketDataAggregator::new(AggregatorConfig::default());
        let mut rx = aggregator.subscribe();

        aggregator.ingest(book("coinbase", dec!(49990), 0));
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.updated_exchange, "coinbase");
        assert_eq!(tick.books.len(), 1);

        aggregator.ingest(book("kraken", dec!(50000), 0));
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.updated_exchange, "kraken");
        assert_eq!(tick.books.len(), 2);
        assert!(tick.books.contains_key("coinbase"));
    }

    #[tokio::test]
    async fn test_stale_books_dropped() {
        let aggregator = MarketDataAggregator::new(AggregatorConfig::default());
        let mut rx = aggregator.subscribe();

        aggregator.ingest(book("coinbase", dec!(49990), 0));
        let _ = rx.recv().await.unwrap();

        // Ten seconds older than the held book: dropped, no event.
        aggregator.ingest(book("coinbase", dec!(40000), 10));
        assert_eq!(aggregator.stale_dropped(), 1);
        assert!(rx.try_recv().is_err());

        // latest() still serves the newer book.
        let latest = aggregator.latest(&pair());
        assert_eq!(
            latest.get("coinbase").unwrap().best_bid().unwrap().price,
            dec!(49990)
        );
    }

    #[tokio::test]
    async fn test_multi_fanout() {
        let aggregator = MarketDataAggregator::new(AggregatorConfig::default());
        let mut a = aggregator.subscribe();
        let mut b = aggregator.subscribe();

        aggregator.ingest(book("kraken", dec!(50000), 0));
        assert_eq!(a.recv().await.unwrap().updated_exchange, "kraken");
        assert_eq!(b.recv().await.unwrap().updated_exchange, "kraken");
    }

    #[tokio::test]
    async fn test_slow_consumer_lags_without_blocking_producer() {
        let aggregator = MarketDataAggregator::new(AggregatorConfig {
            channel_capacity: 4,
        });
        let mut rx = aggregator.subscribe();

        for i in 0..20 {
            aggregator.ingest(book("kraken", dec!(50000) + rust_decimal::Decimal::from(i), 0));
        }

        // The lagged receiver surfaces the drop count, then resumes with the
        // newest events.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 1),
            Ok(_) => panic!("expected lag after overflow"),
            Err(e) => panic!("unexpected error: {e}"),
        }
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.updated_exchange, "kraken");
    }

    #[tokio::test]
    async fn test_latest_unknown_pair_is_empty() {
        let aggregator = MarketDataAggregator::new(AggregatorConfig::default());
        assert!(aggregator.latest(&pair()).is_empty());
    }
}
