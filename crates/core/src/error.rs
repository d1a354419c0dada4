//! Error taxonomy for exchange interactions.
//!
//! Transport-level failures are retryable; authentication and configuration
//! failures are fatal to the calling operation and must be surfaced.

use thiserror::Error;

/// Result alias for exchange operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Errors produced by exchange clients and the managed connection.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network-level failure: connect, send, receive.
    #[error("transport error: {0}")]
    Transport(String),

    /// An operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Bad or missing credentials. Fatal to the calling operation.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Malformed or unexpected exchange message. The message is dropped,
    /// the stream continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The local book violated `best_bid < best_ask`; a resync is required.
    #[error("crossed book for {pair}: bid {bid} >= ask {ask}")]
    CrossedBook {
        /// Pair whose book crossed.
        pair: String,
        /// Offending best bid.
        bid: String,
        /// Offending best ask.
        ask: String,
    },

    /// Missing or invalid configuration. Prevents component start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Exchange rate limit hit.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimit {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Pre-trade balance guard failed.
    #[error("insufficient balance: need {required} {currency}, have {available}")]
    InsufficientBalance {
        /// Currency that was short.
        currency: String,
        /// Amount needed.
        required: String,
        /// Amount available.
        available: String,
    },

    /// The exchange rejected an order.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Order placement or lookup referenced an unknown order.
    #[error("order not found: {order_id}")]
    OrderNotFound {
        /// Order ID that was not found.
        order_id: String,
    },

    /// The circuit breaker is open; reconnects are suspended.
    #[error("circuit breaker open, {remaining_secs}s remaining")]
    CircuitOpen {
        /// Seconds until the breaker may close.
        remaining_secs: u64,
    },

    /// Serialization or deserialization failure on the wire.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ExchangeError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates a crossed-book error from the offending levels.
    pub fn crossed_book(
        pair: impl ToString,
        bid: impl ToString,
        ask: impl ToString,
    ) -> Self {
        Self::CrossedBook {
            pair: pair.to_string(),
            bid: bid.to_string(),
            ask: ask.to_string(),
        }
    }

    /// Creates an insufficient-balance error.
    pub fn insufficient_balance(
        currency: impl Into<String>,
        required: impl ToString,
        available: impl ToString,
    ) -> Self {
        Self::InsufficientBalance {
            currency: currency.into(),
            required: required.to_string(),
            available: available.to_string(),
        }
    }

    /// Returns true if the operation may be retried transparently.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimit { .. }
        )
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::transport("reset").is_retryable());
        assert!(ExchangeError::Timeout("connect".to_string()).is_retryable());
        assert!(ExchangeError::RateLimit { retry_after_secs: 2 }.is_retryable());

        assert!(!ExchangeError::Auth("bad key".to_string()).is_retryable());
        assert!(!ExchangeError::Config("missing passphrase".to_string()).is_retryable());
        assert!(!ExchangeError::OrderRejected("post only".to_string()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = ExchangeError::crossed_book("BTC/USDT", "50010", "50000");
        assert!(err.to_string().contains("crossed book"));

        let err = ExchangeError::insufficient_balance("USDT", "100", "40");
        assert!(err.to_string().contains("USDT"));

        let err = ExchangeError::CircuitOpen { remaining_secs: 300 };
        assert!(err.to_string().contains("300"));
    }
}
