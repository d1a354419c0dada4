//! Kraken exchange client.
//!
//! Implements [`ExchangeClient`] over the Kraken REST API and the streaming
//! [`KrakenFeed`]. Private calls are form-encoded with a millisecond nonce
//! and signed per [`crate::auth`]. Asset codes are normalized through
//! [`crate::symbols`] so `XXBT`/`ZUSD` never leak into the domain.

use crate::auth::KrakenAuth;
use crate::models::{
    parse_decimal, AddOrderResult, BalanceExEntry, CancelOrderResult, OrderInfo, RestResponse,
    TradeVolumeResult,
};
use crate::symbols::{rest_pair_name, to_canonical};
use crate::websocket::{FeedMode, KrakenFeed};
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
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// Tier-0 public rates, used when TradeVolume reports no pair fees.
const DEFAULT_MAKER_RATE: &str = "0.0016";
const DEFAULT_TAKER_RATE: &str = "0.0026";

/// Configuration for the Kraken client.
#[derive(Debug, Clone)]
pub struct KrakenClientConfig {
    /// Exchange identifier used on all emitted records.
    pub exchange_id: String,
    /// REST base URL.
    pub api_url: String,
    /// WebSocket URL; empty selects REST polling.
    pub ws_url: String,
    /// REST rate limit.
    pub requests_per_second: NonZeroU32,
    /// REST request timeout.
    pub timeout: Duration,
    /// Poll cadence when streaming is unavailable.
    pub polling_interval: Duration,
}

impl KrakenClientConfig {
    /// Builds a client config from the shared exchange configuration.
    #[must_use]
    pub fn from_exchange_config(config: &ExchangeConfig, polling_interval_ms: u64) -> Self {
        Self {
            exchange_id: config.exchange_id.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            ws_url: config.ws_url.clone(),
            requests_per_second: NonZeroU32::new(config.max_requests_per_second)
                .unwrap_or(nonzero!(10u32)),
            timeout: Duration::from_millis(config.api_timeout_ms),
            polling_interval: Duration::from_millis(polling_interval_ms),
        }
    }
}

/// Kraken exchange client.
pub struct KrakenClient {
    config: KrakenClientConfig,
    http: reqwest::Client,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    auth: Arc<RwLock<Option<Arc<KrakenAuth>>>>,
    feed: KrakenFeed,
}

impl KrakenClient {
    /// Creates the client and spawns its book feed.
    ///
    /// # Errors
    /// Returns `Config` when the HTTP client cannot be constructed.
    pub fn new(config: KrakenClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExchangeError::Config(format!("http client: {e}")))?;

        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(
            config.requests_per_second,
        )));

        let mode = if config.ws_url.is_empty() {
            FeedMode::Polling {
                interval: config.polling_interval,
            }
        } else {
            FeedMode::Streaming(SocketConfig::new(&config.ws_url))
        };
        let feed = KrakenFeed::spawn(config.exchange_id.clone(), config.api_url.clone(), mode)?;

        Ok(Self {
            config,
            http,
            limiter,
            auth: Arc::new(RwLock::new(None)),
            feed,
        })
    }

    /// The book feed, exposed for tests.
    #[must_use]
    pub fn feed(&self) -> &KrakenFeed {
        &self.feed
    }

    async fn private<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        self.limiter.until_ready().await;

        let auth = self
            .auth
            .read()
            .clone()
            .ok_or_else(|| ExchangeError::Auth("not authenticated".into()))?;

        let nonce = KrakenAuth::nonce();
        let mut postdata = format!("nonce={nonce}");
        for (key, value) in params {
            postdata.push('&');
            postdata.push_str(key);
            postdata.push('=');
            postdata.push_str(value);
        }

        let path = format!("/0/private/{endpoint}");
        let headers = auth.sign(&path, &nonce, &postdata);
        let url = format!("{}{}", self.config.api_url, path);

        debug!(exchange = %self.config.exchange_id, endpoint = %endpoint, "Private call");
        let response = self
            .http
            .post(&url)
            .header("API-Key", &headers.api_key)
            .header("API-Sign", &headers.signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await
            .map_err(|e| ExchangeError::transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExchangeError::transport(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let envelope: RestResponse<T> = response
            .json()
            .await
            .map_err(|e| ExchangeError::Serialization(e.to_string()))?;
        envelope.into_result()
    }

    async fn query_order(&self, pair: &TradingPair, order_id: &str) -> Result<Order> {
        let result: HashMap<String, OrderInfo> = self
            .private("QueryOrders", &[("txid", order_id.to_string())])
            .await?;
        let info = result.get(order_id).ok_or_else(|| ExchangeError::OrderNotFound {
            order_id: order_id.to_string(),
        })?;
        info.to_order(&self.config.exchange_id, order_id, pair)
    }

    async fn add_order(
        &self,
        pair: &TradingPair,
        side: Side,
        ordertype: &str,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<Order> {
        let mut params = vec![
            ("pair", rest_pair_name(pair)),
            ("type", side.to_string()),
            ("ordertype", ordertype.to_string()),
            ("volume", quantity.to_string()),
        ];
        if let Some(price) = price {
            params.push(("price", price.to_string()));
        }

        let result: AddOrderResult = self.private("AddOrder", &params).await?;
        let txid = result
            .txid
            .first()
            .ok_or_else(|| ExchangeError::protocol("AddOrder returned no txid"))?
            .clone();

        self.query_order(pair, &txid).await
    }
}

#[async_trait]
impl ExchangeClient for KrakenClient {
    fn exchange_id(&self) -> &str {
        &self.config.exchange_id
    }

    async fn connect(&self) -> Result<()> {
        let health = self.feed.health();
        if health.breaker_open {
            return Err(ExchangeError::CircuitOpen { remaining_secs: 0 });
        }
        Ok(())
    }

    async fn authenticate(&self, credentials: Credentials) -> Result<()> {
        let auth = KrakenAuth::from_credentials(&credentials)?;
        *self.auth.write() = Some(Arc::new(auth));
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
        self.feed.fetch_depth(pair, depth).await
    }

    async fn place_market_order(
        &self,
        pair: &TradingPair,
        side: Side,
        quantity: Decimal,
    ) -> Result<Order> {
        self.add_order(pair, side, "market", quantity, None).await
    }

    async fn place_limit_order(
        &self,
        pair: &TradingPair,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order> {
        self.add_order(pair, side, "limit", quantity, Some(price)).await
    }

    async fn cancel_order(&self, pair: &TradingPair, order_id: &str) -> Result<Order> {
        let _: CancelOrderResult = self
            .private("CancelOrder", &[("txid", order_id.to_string())])
            .await?;
        self.query_order(pair, order_id).await
    }

    async fn get_order(&self, pair: &TradingPair, order_id: &str) -> Result<Order> {
        self.query_order(pair, order_id).await
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        let result: HashMap<String, BalanceExEntry> = self.private("BalanceEx", &[]).await?;
        let now = Utc::now();

        result
            .into_iter()
            .map(|(asset, entry)| {
                let total = parse_decimal(&entry.balance)?;
                let hold = match &entry.hold_trade {
                    Some(hold) => parse_decimal(hold)?,
                    None => Decimal::ZERO,
                };
                Ok(Balance {
                    exchange_id: self.config.exchange_id.clone(),
                    currency: to_canonical(&asset),
                    total,
                    available: (total - hold).max(Decimal::ZERO),
                    reserved: hold,
                    timestamp: now,
                })
            })
            .collect()
    }

    async fn get_fee_schedule(&self) -> Result<FeeSchedule> {
        let result: TradeVolumeResult = self
            .private("TradeVolume", &[("fee-info", "true".to_string())])
            .await?;

        let taker = result
            .fees
            .as_ref()
            .and_then(|fees| fees.values().next())
            .map(|info| info.fee.clone())
            .unwrap_or_else(|| DEFAULT_TAKER_RATE.to_string());
        let maker = result
            .fees_maker
            .as_ref()
            .and_then(|fees| fees.values().next())
            .map(|info| info.fee.clone())
            .unwrap_or_else(|| DEFAULT_MAKER_RATE.to_string());

        // TradeVolume reports percents; the schedule stores fractions.
        let to_fraction = |s: &str| -> Result<Decimal> {
            Ok(parse_decimal(s)? / Decimal::ONE_HUNDRED)
        };

        Ok(FeeSchedule {
            exchange_id: self.config.exchange_id.clone(),
            maker_rate: if result.fees_maker.is_some() {
                to_fraction(&maker)?
            } else {
                parse_decimal(&maker)?
            },
            taker_rate: if result.fees.is_some() {
                to_fraction(&taker)?
            } else {
                parse_decimal(&taker)?
            },
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
