//! Capability traits implemented by exchange integrations.
//!
//! Each exchange crate provides the wire-specific pieces; shared behavior
//! (reconnect, backoff, circuit breaking) lives in
//! [`crate::connection::ManagedSocket`], which implementations compose.

use crate::connection::ConnectionHealth;
use crate::error::Result;
use crate::types::{Balance, FeeSchedule, Order, OrderBook, Side, TradingPair};
use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::SecretString;
use tokio::sync::mpsc;

/// API credentials for an exchange.
///
/// The credential shape is exchange-specific: Coinbase-style exchanges
/// require a passphrase in addition to key and secret, Kraken-style ones do
/// not. Missing auxiliary credentials surface as `ExchangeError::Config`.
#[derive(Clone)]
pub struct Credentials {
    /// API key identifier.
    pub api_key: String,
    /// API secret (base64-encoded on both supported exchanges).
    pub api_secret: SecretString,
    /// Auxiliary passphrase, where the exchange requires one.
    pub passphrase: Option<SecretString>,
}

impl Credentials {
    /// Creates key/secret credentials.
    #[must_use]
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: SecretString::from(api_secret.into()),
            passphrase: None,
        }
    }

    /// Adds a passphrase.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(SecretString::from(passphrase.into()));
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// A market data and trading client for one exchange.
///
/// Implementations normalize all outputs to the canonical domain types and
/// retry transport errors transparently; authentication and order errors are
/// surfaced to the caller.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Stable identifier, e.g. `"coinbase"`.
    fn exchange_id(&self) -> &str;

    /// Establishes the streaming transport. Idempotent.
    ///
    /// # Errors
    /// Returns `Transport` after the circuit breaker is exhausted.
    async fn connect(&self) -> Result<()>;

    /// Supplies credentials for balance and order operations.
    ///
    /// # Errors
    /// Returns `Config` when required auxiliary credentials are missing.
    async fn authenticate(&self, credentials: Credentials) -> Result<()>;

    /// Starts maintaining an L2 book for the pair. Idempotent.
    ///
    /// # Errors
    /// Returns `Transport` when the snapshot cannot be fetched after retries.
    async fn subscribe_order_book(&self, pair: &TradingPair) -> Result<()>;

    /// Stops maintaining the book for the pair. Idempotent.
    ///
    /// # Errors
    /// Returns `Transport` if the unsubscribe cannot be sent.
    async fn unsubscribe_order_book(&self, pair: &TradingPair) -> Result<()>;

    /// Returns a stream of book snapshots for the pair.
    ///
    /// The sequence is not restartable; it ends when the client stops.
    ///
    /// # Errors
    /// Returns `Config` when the pair is not subscribed.
    async fn order_book_updates(
        &self,
        pair: &TradingPair,
    ) -> Result<mpsc::UnboundedReceiver<OrderBook>>;

    /// Current book for the pair, or a fresh REST fetch.
    ///
    /// # Errors
    /// Returns `Transport` when no book is held and the fetch fails.
    async fn get_order_book_snapshot(&self, pair: &TradingPair, depth: usize)
        -> Result<OrderBook>;

    /// Places a market order.
    ///
    /// # Errors
    /// Returns `OrderRejected`, `InsufficientBalance`, or `Auth`.
    async fn place_market_order(
        &self,
        pair: &TradingPair,
        side: Side,
        quantity: Decimal,
    ) -> Result<Order>;

    /// Places a limit order.
    ///
    /// # Errors
    /// Returns `OrderRejected`, `InsufficientBalance`, or `Auth`.
    async fn place_limit_order(
        &self,
        pair: &TradingPair,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order>;

    /// Cancels a live order and returns its final state.
    ///
    /// # Errors
    /// Returns `OrderNotFound` when the exchange does not know the ID.
    async fn cancel_order(&self, pair: &TradingPair, order_id: &str) -> Result<Order>;

    /// Fetches the current status of an order.
    ///
    /// # Errors
    /// Returns `OrderNotFound` when the exchange does not know the ID.
    async fn get_order(&self, pair: &TradingPair, order_id: &str) -> Result<Order>;

    /// Fetches all balances. Requires authentication.
    ///
    /// # Errors
    /// Returns `Auth` when not authenticated.
    async fn get_balances(&self) -> Result<Vec<Balance>>;

    /// Fetches the fee schedule.
    ///
    /// # Errors
    /// Returns `Transport` on network failure.
    async fn get_fee_schedule(&self) -> Result<FeeSchedule>;

    /// Health snapshot of the streaming connection.
    fn health(&self) -> ConnectionHealth;

    /// Tears the client down, ending all update streams.
    async fn stop(&self);
}
