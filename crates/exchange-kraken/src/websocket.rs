//! Book feed for Kraken.
//!
//! Streaming mode subscribes to the `book-100` channel over a managed
//! socket. On subscribe the feed queues incoming deltas, fetches a REST
//! `Depth` snapshot, discards queued deltas older than the snapshot, then
//! applies the remainder and goes live. Kraken's own `as`/`bs` snapshot is
//! honored when it arrives first and short-circuits the REST fetch.
//!
//! Polling mode covers deployments without streaming access: every
//! `poll_interval` the feed fetches `Depth` for each subscribed pair and
//! publishes the result as a fresh book.

use crate::models::{BookMessage, BookSubscription, DepthEntry, KrakenWsMessage, RestResponse};
use crate::symbols::{rest_pair_name, ws_pair_name};
use chrono::{DateTime, Utc};
use cross_arb_core::{
    ConnectionHealth, ExchangeError, ManagedSocket, OrderBook, Result, Side, SocketConfig,
    SocketEvent, TradingPair, MAX_BOOK_DEPTH,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Attempts made to fetch the Depth snapshot before surfacing the error.
const SNAPSHOT_RETRIES: u32 = 5;

/// Book depth requested on the WebSocket channel.
const BOOK_DEPTH: usize = 100;

type BookMap = Arc<RwLock<HashMap<TradingPair, OrderBook>>>;
type SubscriberMap = Arc<RwLock<HashMap<TradingPair, Vec<mpsc::UnboundedSender<OrderBook>>>>>;
type PairSet = Arc<RwLock<HashSet<TradingPair>>>;

/// Transport mode for the feed.
#[derive(Debug, Clone)]
pub enum FeedMode {
    /// WebSocket book channel with REST snapshot bootstrap.
    Streaming(SocketConfig),
    /// REST Depth polling at a fixed interval.
    Polling {
        /// Time between polls.
        interval: Duration,
    },
}

enum PairPhase {
    /// Deltas are queued until a snapshot lands.
    AwaitingSnapshot { buffered: Vec<BookMessage> },
    /// Snapshot applied; deltas apply directly.
    Live,
}

enum FeedInternal {
    RestSnapshot {
        pair: TradingPair,
        bids: Vec<(rust_decimal::Decimal, rust_decimal::Decimal)>,
        asks: Vec<(rust_decimal::Decimal, rust_decimal::Decimal)>,
        fetched_at: DateTime<Utc>,
    },
    SnapshotFailed {
        pair: TradingPair,
        error: String,
    },
}

/// Book feed for one Kraken connection.
#[derive(Clone)]
pub struct KrakenFeed {
    exchange_id: String,
    api_url: String,
    http: reqwest::Client,
    socket: Option<ManagedSocket>,
    internal_tx: mpsc::UnboundedSender<FeedInternal>,
    books: BookMap,
    subscribers: SubscriberMap,
    subscribed: PairSet,
    phases: Arc<RwLock<HashMap<TradingPair, PairPhaseTag>>>,
}

/// Externally visible phase, for tests and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPhaseTag {
    /// Waiting for a snapshot.
    AwaitingSnapshot,
    /// Applying deltas directly.
    Live,
}

impl KrakenFeed {
    /// Spawns the feed.
    ///
    /// # Errors
    /// Returns `Config` when the HTTP client cannot be constructed.
    pub fn spawn(
        exchange_id: impl Into<String>,
        api_url: impl Into<String>,
        mode: FeedMode,
    ) -> Result<Self> {
        let exchange_id = exchange_id.into();
        let api_url = api_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ExchangeError::Config(format!("http client: {e}")))?;

        let books: BookMap = Arc::new(RwLock::new(HashMap::new()));
        let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));
        let subscribed: PairSet = Arc::new(RwLock::new(HashSet::new()));
        let phases = Arc::new(RwLock::new(HashMap::new()));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let (socket, events) = match &mode {
            FeedMode::Streaming(socket_config) => {
                let (socket, events) = ManagedSocket::spawn(socket_config.clone());
                (Some(socket), Some(events))
            }
            FeedMode::Polling { .. } => (None, None),
        };

        let feed = Self {
            exchange_id,
            api_url,
            http,
            socket,
            internal_tx,
            books,
            subscribers,
            subscribed,
            phases,
        };

        match mode {
            FeedMode::Streaming(_) => {
                tokio::spawn(run_streaming(
                    feed.clone(),
                    events.expect("streaming mode has events"),
                    internal_rx,
                ));
            }
            FeedMode::Polling { interval } => {
                tokio::spawn(run_polling(feed.clone(), interval));
            }
        }

        Ok(feed)
    }

    /// Subscribes the pair. Idempotent.
    ///
    /// # Errors
    /// Returns `Transport` if the subscribe cannot be queued.
    pub async fn subscribe(&self, pair: &TradingPair) -> Result<()> {
        if !self.subscribed.write().insert(pair.clone()) {
            return Ok(());
        }
        self.books
            .write()
            .entry(pair.clone())
            .or_insert_with(|| OrderBook::new(self.exchange_id.clone(), pair.clone()));
        self.phases
            .write()
            .insert(pair.clone(), PairPhaseTag::AwaitingSnapshot);

        if let Some(socket) = &self.socket {
            let msg = BookSubscription::subscribe(vec![ws_pair_name(pair)], BOOK_DEPTH).to_json();
            socket.add_on_connect(msg.clone());
            socket.send(msg).await?;
            self.spawn_snapshot_fetch(pair.clone());
        }
        Ok(())
    }

    /// Unsubscribes the pair, ending its update streams. Idempotent.
    ///
    /// # Errors
    /// Returns `Transport` if the unsubscribe cannot be queued.
    pub async fn unsubscribe(&self, pair: &TradingPair) -> Result<()> {
        if !self.subscribed.write().remove(pair) {
            return Ok(());
        }
        self.books.write().remove(pair);
        self.subscribers.write().remove(pair);
        self.phases.write().remove(pair);

        if let Some(socket) = &self.socket {
            socket.remove_on_connect(
                &BookSubscription::subscribe(vec![ws_pair_name(pair)], BOOK_DEPTH).to_json(),
            );
            socket
                .send(
                    BookSubscription::unsubscribe(vec![ws_pair_name(pair)], BOOK_DEPTH).to_json(),
                )
                .await?;
        }
        Ok(())
    }

    /// Opens a snapshot stream for a subscribed pair.
    ///
    /// # Errors
    /// Returns `Config` when the pair has not been subscribed.
    pub fn updates(&self, pair: &TradingPair) -> Result<mpsc::UnboundedReceiver<OrderBook>> {
        if !self.subscribed.read().contains(pair) {
            return Err(ExchangeError::Config(format!("{pair} is not subscribed")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().entry(pair.clone()).or_default().push(tx);
        Ok(rx)
    }

    /// Current book for the pair, if one is held.
    #[must_use]
    pub fn book(&self, pair: &TradingPair) -> Option<OrderBook> {
        self.books.read().get(pair).cloned()
    }

    /// Reconstruction phase for the pair.
    #[must_use]
    pub fn phase(&self, pair: &TradingPair) -> Option<PairPhaseTag> {
        self.phases.read().get(pair).copied()
    }

    /// Health of the underlying connection. Polling mode reports a synthetic
    /// connected state based on the last successful poll.
    #[must_use]
    pub fn health(&self) -> ConnectionHealth {
        match &self.socket {
            Some(socket) => socket.health(),
            None => {
                let last = self
                    .books
                    .read()
                    .values()
                    .map(|b| b.timestamp)
                    .max();
                ConnectionHealth {
                    connected: last.is_some(),
                    last_message_at: last,
                    ..Default::default()
                }
            }
        }
    }

    /// Stops the feed and ends all update streams.
    pub async fn stop(&self) {
        if let Some(socket) = &self.socket {
            socket.shutdown().await;
        }
        self.subscribed.write().clear();
        self.subscribers.write().clear();
    }

    /// Fetches a Depth snapshot with retries.
    ///
    /// # Errors
    /// Returns the last fetch error after exhausting retries.
    pub async fn fetch_depth(
        &self,
        pair: &TradingPair,
        depth: usize,
    ) -> Result<OrderBook> {
        let url = format!(
            "{}/0/public/Depth?pair={}&count={}",
            self.api_url,
            rest_pair_name(pair),
            depth
        );
        let mut last_error = None;

        for attempt in 0..SNAPSHOT_RETRIES {
            match self.fetch_depth_once(&url, pair).await {
                Ok(book) => return Ok(book),
                Err(e) if e.is_retryable() => {
                    warn!(
                        exchange = %self.exchange_id,
                        pair = %pair,
                        attempt,
                        error = %e,
                        "Depth fetch failed, retrying"
                    );
                    last_error = Some(e);
                    sleep(Duration::from_millis(200 * u64::from(attempt + 1))).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| ExchangeError::transport("depth fetch exhausted retries")))
    }

    async fn fetch_depth_once(&self, url: &str, pair: &TradingPair) -> Result<OrderBook> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ExchangeError::transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExchangeError::transport(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let envelope: RestResponse<HashMap<String, DepthEntry>> = response
            .json()
            .await
            .map_err(|e| ExchangeError::Serialization(e.to_string()))?;
        let result = envelope.into_result()?;
        let entry = result
            .values()
            .next()
            .ok_or_else(|| ExchangeError::protocol("Depth result empty"))?;
        let (bids, asks) = entry.levels()?;

        let mut book = OrderBook::new(self.exchange_id.clone(), pair.clone());
        book.apply_snapshot(bids, asks, Utc::now());
        Ok(book)
    }

    fn spawn_snapshot_fetch(&self, pair: TradingPair) {
        let feed = self.clone();
        tokio::spawn(async move {
            match feed.fetch_depth(&pair, BOOK_DEPTH).await {
                Ok(book) => {
                    let bids = book.bids().map(|l| (l.price, l.quantity)).collect();
                    let asks = book.asks().map(|l| (l.price, l.quantity)).collect();
                    let _ = feed.internal_tx.send(FeedInternal::RestSnapshot {
                        pair,
                        bids,
                        asks,
                        fetched_at: book.timestamp,
                    });
                }
                Err(e) => {
                    let _ = feed.internal_tx.send(FeedInternal::SnapshotFailed {
                        pair,
                        error: e.to_string(),
                    });
                }
            }
        });
    }
}

// =============================================================================
// Streaming Loop
// =============================================================================

async fn run_streaming(
    feed: KrakenFeed,
    mut events: mpsc::Receiver<SocketEvent>,
    mut internal_rx: mpsc::UnboundedReceiver<FeedInternal>,
) {
    // Per-pair reconstruction state lives in the feed task, mutated nowhere
    // else.
    let mut phases: HashMap<TradingPair, PairPhase> = HashMap::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { return };
                match event {
                    SocketEvent::Connected => {
                        info!(exchange = %feed.exchange_id, "Book feed connected");
                        // Reconnect is a full resync: requeue every pair.
                        for pair in feed.subscribed.read().iter() {
                            phases.insert(
                                pair.clone(),
                                PairPhase::AwaitingSnapshot { buffered: Vec::new() },
                            );
                            feed.phases
                                .write()
                                .insert(pair.clone(), PairPhaseTag::AwaitingSnapshot);
                        }
                        for pair in feed.subscribed.read().iter() {
                            feed.spawn_snapshot_fetch(pair.clone());
                        }
                    }
                    SocketEvent::Disconnected { reason } => {
                        warn!(exchange = %feed.exchange_id, reason = %reason, "Book feed disconnected");
                    }
                    SocketEvent::Message(text) => {
                        handle_frame(&feed, &mut phases, &text).await;
                    }
                }
            }

            internal = internal_rx.recv() => {
                let Some(internal) = internal else { return };
                match internal {
                    FeedInternal::RestSnapshot { pair, bids, asks, fetched_at } => {
                        apply_rest_snapshot(&feed, &mut phases, pair, bids, asks, fetched_at);
                    }
                    FeedInternal::SnapshotFailed { pair, error } => {
                        warn!(
                            exchange = %feed.exchange_id,
                            pair = %pair,
                            error = %error,
                            "Snapshot bootstrap failed"
                        );
                    }
                }
            }
        }
    }
}

async fn handle_frame(
    feed: &KrakenFeed,
    phases: &mut HashMap<TradingPair, PairPhase>,
    text: &str,
) {
    let message = match crate::models::parse_ws_message(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(exchange = %feed.exchange_id, error = %e, "Dropping unparseable frame");
            return;
        }
    };

    match message {
        KrakenWsMessage::Heartbeat | KrakenWsMessage::SystemStatus => {}
        KrakenWsMessage::SubscriptionStatus { status, error_message } => {
            if status == "error" {
                warn!(
                    exchange = %feed.exchange_id,
                    error = error_message.as_deref().unwrap_or("unknown"),
                    "Subscription failed"
                );
            } else {
                debug!(exchange = %feed.exchange_id, status = %status, "Subscription status");
            }
        }
        KrakenWsMessage::Unknown(kind) => {
            debug!(exchange = %feed.exchange_id, kind = %kind, "Dropping unknown frame kind");
        }
        KrakenWsMessage::Book(book_msg) => {
            if !feed.subscribed.read().contains(&book_msg.pair) {
                return;
            }
            if book_msg.is_snapshot {
                apply_ws_snapshot(feed, phases, &book_msg);
            } else {
                apply_deltas(feed, phases, book_msg).await;
            }
        }
    }
}

fn apply_ws_snapshot(
    feed: &KrakenFeed,
    phases: &mut HashMap<TradingPair, PairPhase>,
    msg: &BookMessage,
) {
    let pair = msg.pair.clone();
    let timestamp = msg
        .bids
        .iter()
        .chain(&msg.asks)
        .map(|e| e.timestamp)
        .max()
        .unwrap_or_else(Utc::now);

    let published = {
        let mut map = feed.books.write();
        let book = map
            .entry(pair.clone())
            .or_insert_with(|| OrderBook::new(feed.exchange_id.clone(), pair.clone()));
        book.apply_snapshot(
            msg.bids.iter().map(|e| (e.price, e.volume)).collect(),
            msg.asks.iter().map(|e| (e.price, e.volume)).collect(),
            timestamp,
        );
        if book.is_crossed() {
            warn!(exchange = %feed.exchange_id, pair = %pair, "Crossed snapshot, discarding");
            book.clear();
            return;
        }
        book.clone()
    };

    // The channel snapshot supersedes any pending REST bootstrap.
    phases.insert(pair.clone(), PairPhase::Live);
    feed.phases.write().insert(pair.clone(), PairPhaseTag::Live);
    debug!(exchange = %feed.exchange_id, pair = %pair, "Applied channel snapshot");
    publish(feed, &pair, published);
}

fn apply_rest_snapshot(
    feed: &KrakenFeed,
    phases: &mut HashMap<TradingPair, PairPhase>,
    pair: TradingPair,
    bids: Vec<(rust_decimal::Decimal, rust_decimal::Decimal)>,
    asks: Vec<(rust_decimal::Decimal, rust_decimal::Decimal)>,
    fetched_at: DateTime<Utc>,
) {
    if !feed.subscribed.read().contains(&pair) {
        return;
    }
    // Only apply while still bootstrapping; a live book is newer. A pair
    // with no recorded phase yet is still bootstrapping with nothing
    // buffered.
    let buffered = match phases.remove(&pair) {
        Some(PairPhase::AwaitingSnapshot { buffered }) => buffered,
        Some(PairPhase::Live) => {
            phases.insert(pair, PairPhase::Live);
            return;
        }
        None => Vec::new(),
    };

    let published = {
        let mut map = feed.books.write();
        let Some(book) = map.get_mut(&pair) else {
            return;
        };
        book.apply_snapshot(bids, asks, fetched_at);

        // Replay queued deltas, discarding anything older than the snapshot.
        let mut replayed = 0usize;
        let mut discarded = 0usize;
        for msg in buffered {
            let msg_time = msg
                .bids
                .iter()
                .chain(&msg.asks)
                .map(|e| e.timestamp)
                .max()
                .unwrap_or(fetched_at);
            if msg_time < fetched_at {
                discarded += 1;
                continue;
            }
            for entry in msg.bids {
                book.apply_delta(Side::Buy, entry.price, entry.volume, msg_time);
            }
            for entry in msg.asks {
                book.apply_delta(Side::Sell, entry.price, entry.volume, msg_time);
            }
            replayed += 1;
        }
        book.truncate_depth(MAX_BOOK_DEPTH);
        debug!(
            exchange = %feed.exchange_id,
            pair = %pair,
            replayed,
            discarded,
            "Applied REST snapshot with queued deltas"
        );
        book.clone()
    };

    phases.insert(pair.clone(), PairPhase::Live);
    feed.phases.write().insert(pair.clone(), PairPhaseTag::Live);
    if published.has_both_sides() && !published.is_crossed() {
        publish(feed, &pair, published);
    }
}

async fn apply_deltas(
    feed: &KrakenFeed,
    phases: &mut HashMap<TradingPair, PairPhase>,
    msg: BookMessage,
) {
    let pair = msg.pair.clone();

    // A pair subscribed after the connect event starts bootstrapping here.
    let phase = phases
        .entry(pair.clone())
        .or_insert_with(|| PairPhase::AwaitingSnapshot { buffered: Vec::new() });
    match phase {
        PairPhase::AwaitingSnapshot { buffered } => {
            buffered.push(msg);
            return;
        }
        PairPhase::Live => {}
    }

    let msg_time = msg
        .bids
        .iter()
        .chain(&msg.asks)
        .map(|e| e.timestamp)
        .max()
        .unwrap_or_else(Utc::now);

    enum Outcome {
        Publish(OrderBook),
        Crossed,
        Dropped,
    }

    let outcome = {
        let mut map = feed.books.write();
        let Some(book) = map.get_mut(&pair) else {
            return;
        };
        if msg_time < book.timestamp {
            debug!(exchange = %feed.exchange_id, pair = %pair, "Discarding out-of-order delta");
            return;
        }
        for entry in &msg.bids {
            book.apply_delta(Side::Buy, entry.price, entry.volume, msg_time);
        }
        for entry in &msg.asks {
            book.apply_delta(Side::Sell, entry.price, entry.volume, msg_time);
        }
        book.truncate_depth(MAX_BOOK_DEPTH);

        if book.is_crossed() {
            let bid = book.best_bid().map(|l| l.price.to_string()).unwrap_or_default();
            let ask = book.best_ask().map(|l| l.price.to_string()).unwrap_or_default();
            warn!(
                exchange = %feed.exchange_id,
                pair = %pair,
                bid = %bid,
                ask = %ask,
                "Crossed book, resyncing"
            );
            book.clear();
            Outcome::Crossed
        } else if book.has_both_sides() {
            Outcome::Publish(book.clone())
        } else {
            Outcome::Dropped
        }
    };

    match outcome {
        Outcome::Publish(book) => publish(feed, &pair, book),
        Outcome::Crossed => {
            phases.insert(
                pair.clone(),
                PairPhase::AwaitingSnapshot { buffered: Vec::new() },
            );
            feed.phases
                .write()
                .insert(pair.clone(), PairPhaseTag::AwaitingSnapshot);
            if let Some(socket) = &feed.socket {
                let _ = socket
                    .send(
                        BookSubscription::unsubscribe(vec![ws_pair_name(&pair)], BOOK_DEPTH)
                            .to_json(),
                    )
                    .await;
                let _ = socket
                    .send(
                        BookSubscription::subscribe(vec![ws_pair_name(&pair)], BOOK_DEPTH)
                            .to_json(),
                    )
                    .await;
            }
            feed.spawn_snapshot_fetch(pair);
        }
        Outcome::Dropped => {}
    }
}

fn publish(feed: &KrakenFeed, pair: &TradingPair, book: OrderBook) {
    let mut map = feed.subscribers.write();
    if let Some(senders) = map.get_mut(pair) {
        senders.retain(|tx| tx.send(book.clone()).is_ok());
    }
}

// =============================================================================
// Polling Loop
// =============================================================================

async fn run_polling(feed: KrakenFeed, interval: Duration) {
    info!(exchange = %feed.exchange_id, interval = ?interval, "Book feed polling");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let pairs: Vec<TradingPair> = feed.subscribed.read().iter().cloned().collect();
        if pairs.is_empty() {
            continue;
        }
        for pair in pairs {
            match feed.fetch_depth_once(
                &format!(
                    "{}/0/public/Depth?pair={}&count={}",
                    feed.api_url,
                    rest_pair_name(&pair),
                    BOOK_DEPTH
                ),
                &pair,
            )
            .await
            {
                Ok(book) => {
                    if book.is_crossed() {
                        warn!(exchange = %feed.exchange_id, pair = %pair, "Polled book crossed, skipping");
                        continue;
                    }
                    feed.books.write().insert(pair.clone(), book.clone());
                    feed.phases.write().insert(pair.clone(), PairPhaseTag::Live);
                    publish(&feed, &pair, book);
                }
                Err(e) => {
                    warn!(exchange = %feed.exchange_id, pair = %pair, error = %e, "Poll failed");
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cross_arb_core::BackoffPolicy;
    use futures_util::{SinkExt, StreamExt};
    use rust_decimal_macros::dec;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    fn depth_body() -> serde_json::Value {
        serde_json::json!({
            "error": [],
            "result": {
                "XXBTZUSDT": {
                    "bids": [["49990.00", "1.0", 1616663112], ["49980.00", "2.0", 1616663111]],
                    "asks": [["50000.00", "1.5", 1616663113]]
                }
            }
        })
    }

    async fn mock_depth_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/0/public/Depth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(depth_body()))
            .mount(&server)
            .await;
        server
    }

    /// WebSocket server that acks the subscription and plays scripted frames.
    async fn spawn_ws_server(outbound: Vec<String>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut write, mut read) = ws.split();

                if let Some(Ok(Message::Text(first))) = read.next().await {
                    let _ = inbound_tx.send(first);
                }
                let _ = write
                    .send(Message::Text(
                        r#"{"event":"subscriptionStatus","status":"subscribed","pair":"XBT/USDT"}"#
                            .to_string(),
                    ))
                    .await;
                for frame in &outbound {
                    let _ = write.send(Message::Text(frame.clone())).await;
                }
                while let Some(Ok(msg)) = read.next().await {
                    if let Message::Text(text) = msg {
                        let _ = inbound_tx.send(text);
                    }
                }
            }
        });

        (url, inbound_rx)
    }

    fn fast_socket(url: String) -> SocketConfig {
        let mut config = SocketConfig::new(url);
        config.backoff = BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter: 0.0,
            max_attempts: 10,
        };
        config
    }

    #[tokio::test]
    async fn test_streaming_channel_snapshot_goes_live() {
        let depth = mock_depth_server().await;
        let snapshot = r#"[0,
            {"as":[["50000.00","1.5","1700000001.000000"]],
             "bs":[["49990.00","1.0","1700000001.000000"]]},
            "book-100","XBT/USDT"]"#;
        let (ws_url, mut inbound) = spawn_ws_server(vec![snapshot.to_string()]).await;

        let feed = KrakenFeed::spawn(
            "kraken",
            depth.uri(),
            FeedMode::Streaming(fast_socket(ws_url)),
        )
        .unwrap();
        feed.subscribe(&pair()).await.unwrap();
        let mut updates = feed.updates(&pair()).unwrap();

        let book = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(49990.00));
        assert_eq!(book.best_ask().unwrap().price, dec!(50000.00));
        assert_eq!(feed.phase(&pair()), Some(PairPhaseTag::Live));

        let sub = inbound.recv().await.unwrap();
        assert!(sub.contains(r#""event":"subscribe""#));
        assert!(sub.contains("XBT/USDT"));

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_streaming_deltas_buffer_until_snapshot() {
        let depth = mock_depth_server().await;
        // A delta arrives before any snapshot; it must be buffered, then
        // replayed once the REST snapshot lands. Its timestamp (year 2100)
        // is newer than the fetch time, so it survives the replay filter.
        let delta = r#"[0,
            {"b":[["49995.00","0.7","4102444800.000000"]]},
            "book-100","XBT/USDT"]"#;
        let (ws_url, _inbound) = spawn_ws_server(vec![delta.to_string()]).await;

        let feed = KrakenFeed::spawn(
            "kraken",
            depth.uri(),
            FeedMode::Streaming(fast_socket(ws_url)),
        )
        .unwrap();
        feed.subscribe(&pair()).await.unwrap();
        let mut updates = feed.updates(&pair()).unwrap();

        let book = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        // REST snapshot plus the replayed buffered delta.
        assert_eq!(book.best_bid().unwrap().price, dec!(49995.00));
        assert_eq!(book.best_bid().unwrap().quantity, dec!(0.7));
        assert_eq!(feed.phase(&pair()), Some(PairPhaseTag::Live));

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_stale_buffered_deltas_discarded() {
        let depth = mock_depth_server().await;
        // Timestamp far in the past: older than the snapshot fetch time, so
        // it must be discarded during replay.
        let stale_delta = r#"[0,
            {"b":[["49995.00","0.7","1000000000.000000"]]},
            "book-100","XBT/USDT"]"#;
        let (ws_url, _inbound) = spawn_ws_server(vec![stale_delta.to_string()]).await;

        let feed = KrakenFeed::spawn(
            "kraken",
            depth.uri(),
            FeedMode::Streaming(fast_socket(ws_url)),
        )
        .unwrap();
        feed.subscribe(&pair()).await.unwrap();
        let mut updates = feed.updates(&pair()).unwrap();

        let book = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        // Snapshot only; the stale delta was dropped.
        assert_eq!(book.best_bid().unwrap().price, dec!(49990.00));

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_polling_mode_publishes_books() {
        let depth = mock_depth_server().await;
        let feed = KrakenFeed::spawn(
            "kraken",
            depth.uri(),
            FeedMode::Polling {
                interval: Duration::from_millis(50),
            },
        )
        .unwrap();
        feed.subscribe(&pair()).await.unwrap();
        let mut updates = feed.updates(&pair()).unwrap();

        let book = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(book.best_ask().unwrap().price, dec!(50000.00));
        assert_eq!(book.bid_depth(), 2);

        // Polls keep coming.
        let again = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.best_bid().unwrap().price, dec!(49990.00));

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_fetch_depth_surfaces_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/0/public/Depth"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let feed = KrakenFeed::spawn(
            "kraken",
            server.uri(),
            FeedMode::Polling {
                interval: Duration::from_secs(60),
            },
        )
        .unwrap();
        let err = feed.fetch_depth(&pair(), 10).await.unwrap_err();
        assert!(err.is_retryable());

        // All five attempts hit the endpoint.
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), SNAPSHOT_RETRIES as usize);
    }
}
