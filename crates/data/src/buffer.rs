//! Write-behind buffering for repository outages.
//!
//! The pipeline must never stall on persistence: a failed write is retried
//! in the background with backoff for up to 30 seconds of accumulated delay
//! per flush cycle, and records wait in a bounded in-memory buffer
//! (capacity 10 000) that drops its oldest entry on overflow. Each drop and
//! each failed flush emits a structured warning.

use crate::PgStore;
use async_trait::async_trait;
use cross_arb_core::TradeResult;
use cross_arb_engine::{ArbitrageOpportunity, OpportunityStore};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Default buffer capacity.
pub const BUFFER_CAPACITY: usize = 10_000;

/// Maximum accumulated retry delay per flush cycle.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone)]
enum PendingWrite {
    Opportunity(ArbitrageOpportunity, Option<String>),
    Trade(TradeResult),
}

/// A store wrapper that absorbs persistence failures into a bounded buffer.
pub struct BufferedStore<S: OpportunityStore> {
    inner: Arc<S>,
    buffer: Arc<Mutex<VecDeque<PendingWrite>>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl<S: OpportunityStore + 'static> BufferedStore<S> {
    /// Wraps a store with the default buffer capacity and spawns the
    /// background flusher.
    #[must_use]
    pub fn spawn(inner: S) -> Arc<Self> {
        Self::spawn_with_capacity(inner, BUFFER_CAPACITY)
    }

    /// Wraps a store with an explicit buffer capacity.
    #[must_use]
    pub fn spawn_with_capacity(inner: S, capacity: usize) -> Arc<Self> {
        let store = Arc::new(Self {
            inner: Arc::new(inner),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        });
        tokio::spawn(run_flusher(Arc::clone(&store)));
        store
    }

    /// Records currently waiting for the repository to recover.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Records dropped to buffer overflow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, write: PendingWrite) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "Write buffer full, dropping oldest record");
        }
        buffer.push_back(write);
    }

    async fn write(&self, write: &PendingWrite) -> anyhow::Result<()> {
        match write {
            PendingWrite::Opportunity(opportunity, reason) => {
                self.inner
                    .save_opportunity(opportunity, reason.as_deref())
                    .await
            }
            PendingWrite::Trade(trade) => self.inner.save_trade(trade).await,
        }
    }

    /// Drains the buffer front-to-back, stopping at the first failure so
    /// ordering is preserved.
    async fn flush(&self) {
        loop {
            let next = self.buffer.lock().front().cloned();
            let Some(write) = next else { return };
            match self.write(&write).await {
                Ok(()) => {
                    self.buffer.lock().pop_front();
                }
                Err(e) => {
                    debug!(error = %e, pending = self.pending(), "Flush attempt failed");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl<S: OpportunityStore + 'static> OpportunityStore for BufferedStore<S> {
    async fn save_opportunity(
        &self,
        opportunity: &ArbitrageOpportunity,
        reason: Option<&str>,
    ) -> anyhow::Result<()> {
        // Buffer behind any earlier failures so writes stay ordered.
        if self.buffer.lock().is_empty() {
            match self.inner.save_opportunity(opportunity, reason).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "Opportunity write failed, buffering");
                }
            }
        }
        self.enqueue(PendingWrite::Opportunity(
            opportunity.clone(),
            reason.map(String::from),
        ));
        Ok(())
    }

    async fn save_trade(&self, trade: &TradeResult) -> anyhow::Result<()> {
        if self.buffer.lock().is_empty() {
            match self.inner.save_trade(trade).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "Trade write failed, buffering");
                }
            }
        }
        self.enqueue(PendingWrite::Trade(trade.clone()));
        Ok(())
    }
}

async fn run_flusher<S: OpportunityStore + 'static>(store: Arc<BufferedStore<S>>) {
    let mut delay = Duration::from_secs(1);
    loop {
        sleep(delay).await;
        let before = store.pending();
        if before == 0 {
            delay = Duration::from_secs(1);
            continue;
        }
        store.flush().await;
        let after = store.pending();
        if after == 0 {
            info!(flushed = before, "Write buffer drained");
            delay = Duration::from_secs(1);
        } else {
            delay = (delay * 2).min(MAX_RETRY_DELAY);
            warn!(pending = after, retry_in = ?delay, "Repository still unavailable");
        }
    }
}

/// Convenience alias for the production stack.
pub type BufferedPgStore = BufferedStore<PgStore>;

// =============================================================================
// Tests
// =============================================================================
