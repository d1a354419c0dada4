//! Cross-exchange arbitrage engine: aggregation, detection, risk, and
//! execution.
//!
//! Data flows aggregator → detector → risk → executor. The aggregator owns
//! the merged per-pair book view; detection is a pure function per tick;
//! the risk manager gates on capital, concurrency, and daily loss; the
//! executor places both legs concurrently and reconciles fills, against
//! either live exchange clients or the paper venue.
//!
//! # Modules
//!
//! - [`aggregator`]: merged per-pair book view with broadcast fan-out
//! - [`detector`]: pure cross-exchange opportunity detection
//! - [`risk`]: ordered risk checks and execution counters
//! - [`executor`]: paired-leg execution and reconciliation
//! - [`paper`]: simulated venue over internal balances
//! - [`pipeline`]: the task wiring with bounded backpressure
//! - [`types`]: opportunity model and the repository surface

pub mod aggregator;
pub mod detector;
pub mod executor;
pub mod paper;
pub mod pipeline;
pub mod risk;
pub mod types;

pub use aggregator::{AggregatorConfig, BookTick, MarketDataAggregator};
pub use detector::{DetectorConfig, OpportunityDetector};
pub use executor::{ExecutionVenue, ExecutorConfig, LiveVenue, TradeExecutor};
pub use paper::{PaperBalance, PaperVenue, PaperVenueConfig};
pub use pipeline::{DetectionPipeline, PipelineConfig};
pub use risk::{RiskManager, RiskRejection};
pub use types::{ArbitrageOpportunity, NullStore, OpportunityStatus, OpportunityStore};
