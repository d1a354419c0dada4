//! Kraken exchange integration.
//!
//! Provides a `book-100` streaming feed with REST snapshot bootstrap, a
//! REST polling fallback, and a signed private API client, normalized to
//! the engine's canonical domain types.
//!
//! # Modules
//!
//! - [`auth`]: SHA-256 + HMAC-SHA512 request signing
//! - [`client`]: [`KrakenClient`], the [`cross_arb_core::ExchangeClient`] implementation
//! - [`models`]: wire types for the WebSocket feed and REST API
//! - [`symbols`]: `XXBT`/`ZUSD`-style asset code normalization
//! - [`websocket`]: book maintenance with delta queueing and resync

pub mod auth;
pub mod client;
pub mod models;
pub mod symbols;
pub mod websocket;

pub use auth::KrakenAuth;
pub use client::{KrakenClient, KrakenClientConfig};
pub use websocket::{FeedMode, KrakenFeed};
