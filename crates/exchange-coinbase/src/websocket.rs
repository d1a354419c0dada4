//! Level2 book feed for Coinbase.
//!
//! Composes a [`ManagedSocket`] with the Coinbase `level2` channel codec.
//! The feed task owns the per-pair book map; readers get cloned snapshots.
//!
//! Coinbase sends a full `snapshot` message after subscribing, then
//! `l2update` deltas. A delta that crosses the book triggers a resync:
//! the book is cleared and the pair is unsubscribed and resubscribed, which
//! produces a fresh snapshot. Reconnects replay all subscriptions through
//! the socket's on-connect list, so every reconnect is also a full resync.

use crate::models::{ChannelMessage, L2UpdateMessage, SnapshotMessage, WsEnvelope};
use chrono::Utc;
use cross_arb_core::{
    ConnectionHealth, ExchangeError, ManagedSocket, OrderBook, Result, SocketConfig, SocketEvent,
    TradingPair,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type BookMap = Arc<RwLock<HashMap<TradingPair, OrderBook>>>;
type SubscriberMap = Arc<RwLock<HashMap<TradingPair, Vec<mpsc::UnboundedSender<OrderBook>>>>>;
type PairSet = Arc<RwLock<HashSet<TradingPair>>>;

/// Streaming book feed for one Coinbase connection.
#[derive(Clone)]
pub struct CoinbaseFeed {
    exchange_id: String,
    socket: ManagedSocket,
    books: BookMap,
    subscribers: SubscriberMap,
    subscribed: PairSet,
}

impl CoinbaseFeed {
    /// Spawns the feed over a managed socket.
    #[must_use]
    pub fn spawn(exchange_id: impl Into<String>, socket_config: SocketConfig) -> Self {
        let (socket, events) = ManagedSocket::spawn(socket_config);
        let exchange_id = exchange_id.into();
        let books: BookMap = Arc::new(RwLock::new(HashMap::new()));
        let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));
        let subscribed: PairSet = Arc::new(RwLock::new(HashSet::new()));

        tokio::spawn(run_feed(
            exchange_id.clone(),
            socket.clone(),
            events,
            Arc::clone(&books),
            Arc::clone(&subscribers),
            Arc::clone(&subscribed),
        ));

        Self {
            exchange_id,
            socket,
            books,
            subscribers,
            subscribed,
        }
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

        let msg = ChannelMessage::subscribe(&[pair]).to_json();
        self.socket.add_on_connect(msg.clone());
        self.socket.send(msg).await
    }

    /// Unsubscribes the pair, ending its update streams. Idempotent.
    ///
    /// # Errors
    /// Returns `Transport` if the unsubscribe cannot be queued.
    pub async fn unsubscribe(&self, pair: &TradingPair) -> Result<()> {
        if !self.subscribed.write().remove(pair) {
            return Ok(());
        }
        self.socket
            .remove_on_connect(&ChannelMessage::subscribe(&[pair]).to_json());
        self.books.write().remove(pair);
        // Dropping the senders ends subscriber streams.
        self.subscribers.write().remove(pair);
        self.socket
            .send(ChannelMessage::unsubscribe(&[pair]).to_json())
            .await
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

    /// Health of the underlying connection.
    #[must_use]
    pub fn health(&self) -> ConnectionHealth {
        self.socket.health()
    }

    /// Stops the feed and ends all update streams.
    pub async fn stop(&self) {
        self.socket.shutdown().await;
        self.subscribers.write().clear();
    }
}

async fn run_feed(
    exchange_id: String,
    socket: ManagedSocket,
    mut events: mpsc::Receiver<SocketEvent>,
    books: BookMap,
    subscribers: SubscriberMap,
    subscribed: PairSet,
) {
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Connected => {
                info!(exchange = %exchange_id, "Book feed connected");
            }
            SocketEvent::Disconnected { reason } => {
                // The last good book is kept for latest() readers; the
                // snapshot replayed on reconnect replaces it.
                warn!(exchange = %exchange_id, reason = %reason, "Book feed disconnected");
            }
            SocketEvent::Message(text) => {
                handle_message(&exchange_id, &socket, &text, &books, &subscribers, &subscribed)
                    .await;
            }
        }
    }
}

async fn handle_message(
    exchange_id: &str,
    socket: &ManagedSocket,
    text: &str,
    books: &BookMap,
    subscribers: &SubscriberMap,
    subscribed: &PairSet,
) {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(exchange = %exchange_id, error = %e, "Dropping unparseable message");
            return;
        }
    };

    match envelope.kind.as_str() {
        "snapshot" => {
            let msg: SnapshotMessage = match serde_json::from_value(envelope.data) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(exchange = %exchange_id, error = %e, "Dropping bad snapshot");
                    return;
                }
            };
            apply_snapshot(exchange_id, &msg, books, subscribers, subscribed);
        }
        "l2update" => {
            let msg: L2UpdateMessage = match serde_json::from_value(envelope.data) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(exchange = %exchange_id, error = %e, "Dropping bad l2update");
                    return;
                }
            };
            apply_update(exchange_id, socket, &msg, books, subscribers, subscribed).await;
        }
        "subscriptions" => {
            debug!(exchange = %exchange_id, "Subscription ack");
        }
        "error" => {
            warn!(exchange = %exchange_id, payload = %envelope.data, "Feed error message");
        }
        other => {
            debug!(exchange = %exchange_id, kind = %other, "Dropping unknown message kind");
        }
    }
}

fn apply_snapshot(
    exchange_id: &str,
    msg: &SnapshotMessage,
    books: &BookMap,
    subscribers: &SubscriberMap,
    subscribed: &PairSet,
) {
    let Ok(pair) = crate::models::parse_product_id(&msg.product_id) else {
        warn!(exchange = %exchange_id, product = %msg.product_id, "Snapshot for bad product id");
        return;
    };
    if !subscribed.read().contains(&pair) {
        return;
    }
    let (bids, asks) = match (msg.bid_levels(), msg.ask_levels()) {
        (Ok(bids), Ok(asks)) => (bids, asks),
        (Err(e), _) | (_, Err(e)) => {
            warn!(exchange = %exchange_id, error = %e, "Dropping snapshot with bad levels");
            return;
        }
    };

    let published = {
        let mut map = books.write();
        let book = map
            .entry(pair.clone())
            .or_insert_with(|| OrderBook::new(exchange_id, pair.clone()));
        book.apply_snapshot(bids, asks, Utc::now());
        if book.is_crossed() {
            warn!(exchange = %exchange_id, pair = %pair, "Crossed snapshot, discarding");
            book.clear();
            return;
        }
        debug!(
            exchange = %exchange_id,
            pair = %pair,
            bid_depth = book.bid_depth(),
            ask_depth = book.ask_depth(),
            "Applied book snapshot"
        );
        book.clone()
    };
    publish(&pair, published, subscribers);
}

async fn apply_update(
    exchange_id: &str,
    socket: &ManagedSocket,
    msg: &L2UpdateMessage,
    books: &BookMap,
    subscribers: &SubscriberMap,
    subscribed: &PairSet,
) {
    let Ok(pair) = crate::models::parse_product_id(&msg.product_id) else {
        return;
    };
    if !subscribed.read().contains(&pair) {
        return;
    }
    let deltas = match msg.deltas() {
        Ok(deltas) => deltas,
        Err(e) => {
            warn!(exchange = %exchange_id, error = %e, "Dropping l2update with bad changes");
            return;
        }
    };

    enum Outcome {
        Publish(OrderBook),
        Crossed,
        Dropped,
    }

    let outcome = {
        let mut map = books.write();
        let Some(book) = map.get_mut(&pair) else {
            return;
        };
        // Updates are totally ordered by exchange timestamp; anything older
        // than the book is discarded.
        if let Some(time) = msg.time {
            if time < book.timestamp {
                debug!(exchange = %exchange_id, pair = %pair, "Discarding out-of-order l2update");
                return;
            }
        }
        let timestamp = msg.time.unwrap_or_else(Utc::now);
        for (side, price, size) in deltas {
            book.apply_delta(side, price, size, timestamp);
        }
        book.truncate_depth(cross_arb_core::MAX_BOOK_DEPTH);

        if book.is_crossed() {
            let bid = book.best_bid().map(|l| l.price.to_string()).unwrap_or_default();
            let ask = book.best_ask().map(|l| l.price.to_string()).unwrap_or_default();
            warn!(
                exchange = %exchange_id,
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
        Outcome::Publish(book) => publish(&pair, book, subscribers),
        Outcome::Crossed => {
            // Unsubscribe and resubscribe; the fresh snapshot replaces the
            // cleared book. Nothing is published for the crossed interval.
            let unsub_text = ChannelMessage::unsubscribe(&[&pair]).to_json();
            eprintln!("DEBUG sending unsubscribe text={unsub_text}");
            let r1 = socket.send(unsub_text).await;
            eprintln!("DEBUG unsubscribe send result={r1:?}");
            let sub_text = ChannelMessage::subscribe(&[&pair]).to_json();
            eprintln!("DEBUG sending subscribe text={sub_text}");
            let r2 = socket.send(sub_text).await;
            eprintln!("DEBUG subscribe send result={r2:?}");
        }
        Outcome::Dropped => {}
    }
}

fn publish(pair: &TradingPair, book: OrderBook, subscribers: &SubscriberMap) {
    let mut map = subscribers.write();
    if let Some(senders) = map.get_mut(pair) {
        senders.retain(|tx| tx.send(book.clone()).is_ok());
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
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Scripted feed server: records inbound messages, plays outbound frames
    /// as soon as the subscription arrives.
    async fn spawn_server(
        outbound: Vec<String>,
    ) -> (String, mpsc::UnboundedReceiver<String>) {
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

                // Wait for the subscribe before scripting the feed.
                if let Some(Ok(Message::Text(first))) = read.next().await {
                    let _ = inbound_tx.send(first);
                }
                for frame in &outbound {
                    let _ = write.send(Message::Text(frame.clone())).await;
                }
                // Keep recording inbound until the client goes away.
                while let Some(Ok(msg)) = read.next().await {
                    if let Message::Text(text) = msg {
                        let _ = inbound_tx.send(text);
                    }
                }
            }
        });

        (url, inbound_rx)
    }

    fn fast_config(url: String) -> SocketConfig {
        let mut config = SocketConfig::new(url);
        config.backoff = BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter: 0.0,
            max_attempts: 10,
        };
        config
    }

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    fn snapshot_frame() -> String {
        r#"{"type":"snapshot","product_id":"BTC-USDT",
            "bids":[["49990.00","1.0"],["49980.00","2.0"]],
            "asks":[["50000.00","1.5"]]}"#
            .to_string()
    }

    #[tokio::test]
    async fn test_snapshot_publishes_book() {
        let (url, mut inbound) = spawn_server(vec![snapshot_frame()]).await;
        let feed = CoinbaseFeed::spawn("coinbase", fast_config(url));

        feed.subscribe(&pair()).await.unwrap();
        let mut updates = feed.updates(&pair()).unwrap();

        let book = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(49990.00));
        assert_eq!(book.best_ask().unwrap().price, dec!(50000.00));
        assert_eq!(book.exchange_id, "coinbase");

        // The server saw the level2 subscribe.
        let first = inbound.recv().await.unwrap();
        assert!(first.contains(r#""type":"subscribe""#));
        assert!(first.contains("BTC-USDT"));

        assert_eq!(feed.book(&pair()).unwrap().bid_depth(), 2);
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_zero_size_delta_removes_level() {
        let frames = vec![
            snapshot_frame(),
            r#"{"type":"l2update","product_id":"BTC-USDT",
                "changes":[["buy","49990.00","0"]]}"#
                .to_string(),
            r#"{"type":"l2update","product_id":"BTC-USDT",
                "changes":[["buy","49990.00","0.4"]]}"#
                .to_string(),
        ];
        let (url, _inbound) = spawn_server(frames).await;
        let feed = CoinbaseFeed::spawn("coinbase", fast_config(url));
        feed.subscribe(&pair()).await.unwrap();
        let mut updates = feed.updates(&pair()).unwrap();

        // Snapshot.
        let book = updates.recv().await.unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(49990.00));

        // Removal drops the level.
        let book = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(49980.00));

        // Re-insert at the same price brings it back.
        let book = updates.recv().await.unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(49990.00));
        assert_eq!(book.best_bid().unwrap().quantity, dec!(0.4));

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_crossed_update_triggers_resync() {
        let frames = vec![
            snapshot_frame(),
            // Bid at 50005 crosses the 50000 ask.
            r#"{"type":"l2update","product_id":"BTC-USDT",
                "changes":[["buy","50005.00","1.0"]]}"#
                .to_string(),
        ];
        let (url, mut inbound) = spawn_server(frames).await;
        let feed = CoinbaseFeed::spawn("coinbase", fast_config(url));
        feed.subscribe(&pair()).await.unwrap();
        let mut updates = feed.updates(&pair()).unwrap();

        // Snapshot arrives, then the crossed update must NOT be published.
        let book = updates.recv().await.unwrap();
        assert!(!book.is_crossed());

        // Server sees subscribe, then the resync unsubscribe + subscribe.
        let first = inbound.recv().await.unwrap();
        eprintln!("DEBUG first={first}");
        assert!(first.contains("subscribe"));
        let unsub = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        eprintln!("DEBUG unsub={unsub}");
        assert!(unsub.contains(r#""type":"unsubscribe""#));
        let resub = inbound.recv().await.unwrap();
        assert!(resub.contains(r#""type":"subscribe""#));

        // The held book was cleared pending the fresh snapshot.
        let held = feed.book(&pair()).unwrap();
        assert!(!held.has_both_sides());

        // No crossed book was ever delivered.
        let pending = tokio::time::timeout(Duration::from_millis(200), updates.recv()).await;
        assert!(pending.is_err(), "crossed interval must not publish");

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent_and_updates_requires_subscription() {
        let (url, _inbound) = spawn_server(vec![snapshot_frame()]).await;
        let feed = CoinbaseFeed::spawn("coinbase", fast_config(url));

        assert!(feed.updates(&pair()).is_err());
        feed.subscribe(&pair()).await.unwrap();
        feed.subscribe(&pair()).await.unwrap();
        assert!(feed.updates(&pair()).is_ok());

        feed.unsubscribe(&pair()).await.unwrap();
        feed.unsubscribe(&pair()).await.unwrap();
        assert!(feed.updates(&pair()).is_err());
        assert!(feed.book(&pair()).is_none());

        feed.stop().await;
    }
}
