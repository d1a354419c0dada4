pub mod config;
pub mod connection;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{AppConfig, DatabaseConfig, ExchangeConfig, RiskProfile};
pub use connection::{
    BackoffPolicy, CircuitBreaker, ConnectionHealth, ManagedSocket, SocketConfig, SocketEvent,
};
pub use error::{ExchangeError, Result};
pub use traits::{Credentials, ExchangeClient};
pub use types::{
    Balance, FeeSchedule, Order, OrderBook, OrderBookLevel, OrderStatus, OrderType, PriceQuote,
    Side, TradeExecution, TradeResult, TradingPair, BALANCE_EPSILON, MAX_BOOK_DEPTH,
};
