//! Coinbase exchange integration.
//!
//! Provides a streaming level2 order book feed and a signed REST client,
//! normalized to the engine's canonical domain types.
//!
//! # Modules
//!
//! - [`auth`]: HMAC-SHA256 request signing
//! - [`client`]: [`CoinbaseClient`], the [`cross_arb_core::ExchangeClient`] implementation
//! - [`models`]: wire types for the WebSocket feed and REST API
//! - [`websocket`]: level2 book maintenance over a managed socket

pub mod auth;
pub mod client;
pub mod models;
pub mod websocket;

pub use auth::CoinbaseAuth;
pub use client::{CoinbaseClient, CoinbaseClientConfig};
pub use websocket::CoinbaseFeed;
