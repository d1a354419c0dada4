//! Coinbase exchange client.
//!
//! Implements [`ExchangeClient`] by combining the REST API (snapshots,
//! balances, fees, orders) with the streaming [`CoinbaseFeed`]. REST calls
//! are rate limited with the governor crate.

use crate::auth::CoinbaseAuth;
use crate::models::{
    product_id, AccountResponse, FeesResponse, OrderResponse, PlaceOrderRequest, RestBookResponse,
};
use crate::websocket::CoinbaseFeed;
use async_trait::async_trait;
use chrono::Utc;
use cross_arb_core::{
    Balance, ConnectionHealth, Credentials, ExchangeClient, ExchangeConfig, ExchangeError,
    FeeSchedule, Order, OrderBook, Result, Side, SocketConfig, TradingPair,
};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Attempts made to fetch a REST book snapshot before surfacing the error.
const SNAPSHOT_RETRIES: u32 = 5;

/// Configuration for the Coinbase client.
#[derive(Debug, Clone)]
pub struct CoinbaseClientConfig {
    /// Exchange identifier used on all emitted records.
    pub exchange_id: String,
    /// REST base URL.
    pub api_url: String,
    /// WebSocket URL.
    pub ws_url: String,
    /// REST rate limit.
    pub requests_per_second: NonZeroU32,
    /// REST request timeout.
    pub timeout: Duration,
}

impl CoinbaseClientConfig {
    /// Builds a client config from the shared exchange configuration.
    #[must_use]
    pub fn from_exchange_config(config: &ExchangeConfig) -> Self {
        Self {
            exchange_id: config.exchange_id.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            ws_url: config.ws_url.clone(),
            requests_per_second: NonZeroU32::new(config.max_requests_per_second)
                .unwrap_or(nonzero!(10u32)),
            timeout: Duration::from_millis(config.api_timeout_ms),
        }
    }
}

/// Coinbase exchange client.
pub struct CoinbaseClient {
    config: CoinbaseClientConfig,
    http: reqwest::Client,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    auth: Arc<RwLock<Option<CoinbaseAuth>>>,
    feed: CoinbaseFeed,
}

impl CoinbaseClient {
    /// Creates the client and spawns its streaming feed.
    ///
    /// # Errors
    /// Returns `Config` when the HTTP client cannot be constructed.
    pub fn new(config: CoinbaseClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExchangeError::Config(format!("http client: {e}")))?;

        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(
            config.requests_per_second,
        )));

        let feed = CoinbaseFeed::spawn(config.exchange_id.clone(), SocketConfig::new(&config.ws_url));

        Ok(Self {
            config,
            http,
            limiter,
            auth: Arc::new(RwLock::new(None)),
            feed,
        })
    }

    /// The streaming feed, exposed for tests.
    #[must_use]
    pub fn feed(&self) -> &CoinbaseFeed {
        &self.feed
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.limiter.until_ready().await;
        let url = format!("{}{}", self.config.api_url, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::transport(e.to_string()))?;
        Self::decode(response).await
    }

    async fn request_signed<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<String>,
    ) -> Result<T> {
        self.limiter.until_ready().await;

        let headers = {
            let auth = self.auth.read();
            let auth = auth
                .as_ref()
                .ok_or_else(|| ExchangeError::Auth("not authenticated".into()))?;
            auth.sign_now(method.as_str(), path, body.as_deref().unwrap_or(""))
        };

        let url = format!("{}{}", self.config.api_url, path);
        let mut request = self.http.request(method, &url);
        for (name, value) in headers.as_tuples() {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::transport(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ExchangeError::Serialization(e.to_string()));
        }

        let text = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => ExchangeError::Auth(text),
            404 => ExchangeError::OrderNotFound { order_id: text },
            429 => ExchangeError::RateLimit {
                retry_after_secs: 1,
            },
            code if (400..500).contains(&code) => ExchangeError::OrderRejected(text),
            code => ExchangeError::transport(format!("HTTP {code}: {text}")),
        })
    }

    async fn fetch_book_snapshot(&self, pair: &TradingPair, depth: usize) -> Result<OrderBook> {
        let path = format!("/products/{}/book?level=2", product_id(pair));
        let mut last_error = None;

        for attempt in 0..SNAPSHOT_RETRIES {
            match self.get_public::<RestBookResponse>(&path).await {
                Ok(response) => {
                    let (bids, asks) = response.levels()?;
                    let mut book = OrderBook::new(self.config.exchange_id.clone(), pair.clone());
                    book.apply_snapshot(bids, asks, Utc::now());
                    book.truncate_depth(depth);
                    return Ok(book);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        exchange = %self.config.exchange_id,
                        pair = %pair,
                        attempt,
                        error = %e,
                        "Snapshot fetch failed, retrying"
                    );
                    last_error = Some(e);
                    sleep(Duration::from_millis(200 * u64::from(attempt + 1))).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| ExchangeError::transport("snapshot fetch exhausted retries")))
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<Order> {
        let body = serde_json::to_string(request)?;
        debug!(exchange = %self.config.exchange_id, body = %body, "Placing order");
        let response: OrderResponse = self
            .request_signed(reqwest::Method::POST, "/orders", Some(body))
            .await?;
        response.to_order(&self.config.exchange_id)
    }
}

#[async_trait]
impl ExchangeClient for CoinbaseClient {
    fn exchange_id(&self) -> &str {
        &self.config.exchange_id
    }

    async fn connect(&self) -> Result<()> {
        // The managed socket supervises itself from construction; connect
        // only reports a breaker that is currently open.
        let health = self.feed.health();
        if health.breaker_open {
            return Err(ExchangeError::CircuitOpen { remaining_secs: 0 });
        }
        Ok(())
    }

    async fn authenticate(&self, credentials: Credentials) -> Result<()> {
        let auth = CoinbaseAuth::from_credentials(&credentials)?;
        *self.auth.write() = Some(auth);
        Ok(())
    }

    async fn subscribe_order_book(&self, pair: &TradingPair) -> Result<()> {
        self.feed.subscribe(pair).await
    }

    async fn unsubscribe_order_book(&self, pair: &TradingPair) -> Result<()> {
        self.feed.unsubscribe(pair).await
    }

    async fn order_book_updates(
        &self,
        pair: &TradingPair,
    ) -> Result<tokio::sync::mpsc::UnboundedReceiver<OrderBook>> {
        self.feed.updates(pair)
    }

    async fn get_order_book_snapshot(
        &self,
        pair: &TradingPair,
        depth: usize,
    ) -> Result<OrderBook> {
        if let Some(mut book) = self.feed.book(pair) {
            if book.has_both_sides() {
                book.truncate_depth(depth);
                return Ok(book);
            }
        }
        self.fetch_book_snapshot(pair, depth).await
    }

    async fn place_market_order(
        &self,
        pair: &TradingPair,
        side: Side,
        quantity: Decimal,
    ) -> Result<Order> {
        self.place_order(&PlaceOrderRequest {
            product_id: product_id(pair),
            side: side.to_string(),
            order_type: "market".to_string(),
            size: quantity.to_string(),
            price: None,
        })
        .await
    }

    async fn place_limit_order(
        &self,
        pair: &TradingPair,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order> {
        self.place_order(&PlaceOrderRequest {
            product_id: product_id(pair),
            side: side.to_string(),
            order_type: "limit".to_string(),
            size: quantity.to_string(),
            price: Some(price.to_string()),
        })
        .await
    }

    async fn cancel_order(&self, pair: &TradingPair, order_id: &str) -> Result<Order> {
        let path = format!("/orders/{order_id}");
        // Coinbase returns only the id on DELETE; fetch the final state.
        let _: serde_json::Value = self
            .request_signed(reqwest::Method::DELETE, &path, None)
            .await?;
        self.get_order(pair, order_id).await
    }

    async fn get_order(&self, _pair: &TradingPair, order_id: &str) -> Result<Order> {
        let path = format!("/orders/{order_id}");
        let response: OrderResponse = self
            .request_signed(reqwest::Method::GET, &path, None)
            .await?;
        response.to_order(&self.config.exchange_id)
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        let accounts: Vec<AccountResponse> = self
            .request_signed(reqwest::Method::GET, "/accounts", None)
            .await?;

        let now = Utc::now();
        accounts
            .into_iter()
            .map(|account| {
                Ok(Balance {
                    exchange_id: self.config.exchange_id.clone(),
                    currency: account.currency.to_uppercase(),
                    total: crate::models::parse_decimal(&account.balance)?,
                    available: crate::models::parse_decimal(&account.available)?,
                    reserved: crate::models::parse_decimal(&account.hold)?,
                    timestamp: now,
                })
            })
            .collect()
    }

    async fn get_fee_schedule(&self) -> Result<FeeSchedule> {
        let fees: FeesResponse = self
            .request_signed(reqwest::Method::GET, "/fees", None)
            .await?;
        Ok(FeeSchedule {
            exchange_id: self.config.exchange_id.clone(),
            maker_rate: crate::models::parse_decimal(&fees.maker_fee_rate)?,
            taker_rate: crate::models::parse_decimal(&fees.taker_fee_rate)?,
            withdrawal_rate: None,
        })
    }

    fn health(&self) -> ConnectionHealth {
        self.feed.health()
    }

    async fn stop(&self) {
        self.feed.stop().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
