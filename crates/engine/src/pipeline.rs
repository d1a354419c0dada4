//! Detection pipeline: aggregator ticks through detection, risk, and the
//! execution worker pool.
//!
//! Backpressure: the opportunity queue is bounded at
//! `max_concurrent_executions × 4`; on overflow the oldest undelivered
//! opportunity is dropped, counted, and persisted as `Missed`. Risk
//! rejections are persisted as `Missed` with their reason code in every
//! path.

use crate::aggregator::MarketDataAggregator;
use crate::detector::OpportunityDetector;
use crate::executor::TradeExecutor;
use crate::risk::RiskManager;
use crate::types::{ArbitrageOpportunity, OpportunityStatus, OpportunityStore};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Hand approved opportunities to the executor.
    pub auto_execute: bool,
    /// Execution worker pool size.
    pub max_concurrent_executions: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_execute: true,
            max_concurrent_executions: 4,
        }
    }
}

/// Bounded opportunity queue with drop-oldest overflow.
pub(crate) struct OpportunityQueue {
    inner: Mutex<VecDeque<ArbitrageOpportunity>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OpportunityQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes an opportunity, returning the oldest one when full.
    pub(crate) fn push(&self, opportunity: ArbitrageOpportunity) -> Option<ArbitrageOpportunity> {
        let dropped = {
            let mut queue = self.inner.lock();
            let dropped = if queue.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(opportunity);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub(crate) fn try_pop(&self) -> Option<ArbitrageOpportunity> {
        let item = self.inner.lock().pop_front();
        if item.is_some() && !self.inner.lock().is_empty() {
            // Wake another worker for the remainder.
            self.notify.notify_one();
        }
        item
    }

    pub(crate) async fn pop(&self) -> ArbitrageOpportunity {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Running pipeline: one detector task plus the execution worker pool.
pub struct DetectionPipeline {
    detector_task: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    queue: Arc<OpportunityQueue>,
}

impl DetectionPipeline {
    /// Spawns the pipeline over a running aggregator.
    ///
    /// The detector is shared so threshold updates apply on the next tick.
    #[must_use]
    pub fn spawn(
        aggregator: &MarketDataAggregator,
        detector: Arc<parking_lot::RwLock<OpportunityDetector>>,
        risk: Arc<RiskManager>,
        executor: Arc<TradeExecutor>,
        store: Arc<dyn OpportunityStore>,
        config: PipelineConfig,
    ) -> Self {
        let queue = Arc::new(OpportunityQueue::new(config.max_concurrent_executions * 4));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let detector_task = tokio::spawn(run_detector(
            aggregator.subscribe(),
            detector,
            Arc::clone(&risk),
            executor.planned_limit_offset_pct(),
            Arc::clone(&store),
            Arc::clone(&queue),
            config.auto_execute,
            shutdown_rx.clone(),
        ));

        let workers = (0..config.max_concurrent_executions.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&executor),
                    Arc::clone(&queue),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        Self {
            detector_task,
            workers,
            shutdown_tx,
            queue,
        }
    }

    /// Opportunities dropped to queue overflow.
    #[must_use]
    pub fn dropped_opportunities(&self) -> u64 {
        self.queue.dropped()
    }

    /// True when the detector task has exited; the supervisor restarts the
    /// pipeline when this happens outside of a stop.
    #[must_use]
    pub fn detector_finished(&self) -> bool {
        self.detector_task.is_finished()
    }

    /// Signals shutdown, stops detection, drains queued work, and waits for
    /// in-flight executions up to `grace`.
    pub async fn stop(self, grace: Duration) {
        info!("Stopping detection pipeline");
        let _ = self.shutdown_tx.send(true);
        self.detector_task.abort();
        let _ = self.detector_task.await;

        let drain = async {
            for worker in self.workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Pipeline drain exceeded grace period");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_detector(
    mut ticks: tokio::sync::broadcast::Receiver<crate::aggregator::BookTick>,
    detector: Arc<parking_lot::RwLock<OpportunityDetector>>,
    risk: Arc<RiskManager>,
    planned_limit_offset_pct: Option<rust_decimal::Decimal>,
    store: Arc<dyn OpportunityStore>,
    queue: Arc<OpportunityQueue>,
    auto_execute: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(auto_execute, "Detector task running");
    loop {
        let tick = tokio::select! {
            _ = shutdown_rx.changed() => break,
            tick = ticks.recv() => tick,
        };
        let tick = match tick {
            Ok(tick) => tick,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Detector lagged the aggregator");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        let Some(opportunity) = detector.read().detect(&tick, Utc::now()) else {
            continue;
        };
        debug!(
            opportunity_id = %opportunity.id,
            buy = %opportunity.buy_exchange,
            sell = %opportunity.sell_exchange,
            net = %opportunity.est_profit_quote,
            "Opportunity detected"
        );

        match risk.approve(&opportunity, planned_limit_offset_pct, Utc::now()) {
            Ok(()) => {
                if let Err(e) = store.save_opportunity(&opportunity, None).await {
                    warn!(error = %e, "Failed to persist detected opportunity");
                }
                if auto_execute {
                    if let Some(mut evicted) = queue.push(opportunity) {
                        evicted.status = OpportunityStatus::Missed;
                        warn!(opportunity_id = %evicted.id, "Queue overflow, dropping oldest");
                        if let Err(e) = store
                            .save_opportunity(&evicted, Some("queue_overflow"))
                            .await
                        {
                            warn!(error = %e, "Failed to persist overflow miss");
                        }
                    }
                }
            }
            Err(rejection) => {
                let mut missed = opportunity;
                missed.status = OpportunityStatus::Missed;
                info!(
                    opportunity_id = %missed.id,
                    reason = rejection.reason_code(),
                    "Opportunity rejected by risk"
                );
                if let Err(e) = store
                    .save_opportunity(&missed, Some(rejection.reason_code()))
                    .await
                {
                    warn!(error = %e, "Failed to persist missed opportunity");
                }
            }
        }
    }
    info!("Detector task stopped");
}

async fn run_worker(
    worker: usize,
    executor: Arc<TradeExecutor>,
    queue: Arc<OpportunityQueue>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker, "Execution worker running");
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            opportunity = queue.pop() => {
                let _ = executor.execute(opportunity).await;
            }
        }
    }
    // Drain whatever was already queued before the shutdown signal.
    while let Some(opportunity) = queue.try_pop() {
        let _ = executor.execute(opportunity).await;
    }
    debug!(worker, "Execution worker stopped");
}

// =============================================================================
// Tests
// =============================================================================
