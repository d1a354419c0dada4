//! Lifecycle supervision for the arbitrage engine.
//!
//! The [`Supervisor`] actor owns start/stop ordering, pipeline restarts
//! with backoff and circuit breaking, the status surface, and atomic
//! configuration replacement. Control planes hold an [`EngineHandle`].

pub mod commands;
pub mod handle;
pub mod supervisor;

pub use commands::{EngineCommand, EngineState, EngineStatus, ExchangeStatus};
pub use handle::EngineHandle;
pub use supervisor::Supervisor;
