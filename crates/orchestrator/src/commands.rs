//! Commands and status types for the engine supervisor.
//!
//! These are the boundary to any outer control plane: an admin API or CLI
//! sends commands over the handle and watches the status channel.

use cross_arb_core::AppConfig;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::oneshot;

/// Commands accepted by the supervisor actor.
pub enum EngineCommand {
    /// Start the pipeline. Idempotent.
    Start {
        /// Completion signal.
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },
    /// Stop the pipeline, draining in-flight work. Idempotent.
    Stop {
        /// Completion signal.
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },
    /// Fetch a fresh status snapshot.
    GetStatus {
        /// Response channel.
        respond_to: oneshot::Sender<EngineStatus>,
    },
    /// Replace the configuration atomically. Thresholds apply on the next
    /// detection tick; exchange auth changes on the next reconnect.
    UpdateConfig {
        /// New configuration.
        config: Box<AppConfig>,
        /// Completion signal.
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },
    /// Stop everything and end the actor.
    Shutdown,
}

/// Coarse engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Pipeline not running.
    Stopped,
    /// Pipeline running.
    Running,
    /// Pipeline restarts suspended after repeated failures.
    CircuitOpen,
}

/// Health of one exchange connection, surfaced through `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeStatus {
    /// Exchange identifier.
    pub exchange_id: String,
    /// Transport established.
    pub connected: bool,
    /// Reconnect circuit breaker open.
    pub breaker_open: bool,
    /// Overall health per the idle-limit rule.
    pub healthy: bool,
    /// Last error string, if any.
    pub last_error: Option<String>,
    /// Inbound message count.
    pub messages_in: u64,
    /// Outbound message count.
    pub messages_out: u64,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
}

/// Full status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Engine state.
    pub state: EngineState,
    /// Paper trading active.
    pub paper_trading: bool,
    /// Trades currently in flight.
    pub open_trades: usize,
    /// Realized P&L since UTC midnight.
    pub realized_pnl_today: Decimal,
    /// Per-exchange connection health.
    pub exchanges: Vec<ExchangeStatus>,
    /// Opportunities dropped to queue overflow.
    pub dropped_opportunities: u64,
    /// Books dropped as stale by the aggregator.
    pub stale_books_dropped: u64,
    /// Pipeline restarts since start.
    pub pipeline_restarts: u32,
}

impl EngineStatus {
    /// A stopped snapshot with no exchange data.
    #[must_use]
    pub fn stopped() -> Self {
        Self {
            state: EngineState::Stopped,
            paper_trading: false,
            open_trades: 0,
            realized_pnl_today: Decimal::ZERO,
            exchanges: Vec::new(),
            dropped_opportunities: 0,
            stale_books_dropped: 0,
            pipeline_restarts: 0,
        }
    }
}
