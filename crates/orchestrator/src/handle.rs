//! Client handle for the supervisor actor.

use crate::commands::{EngineCommand, EngineStatus};
use cross_arb_core::AppConfig;
use tokio::sync::{mpsc, oneshot, watch};

/// Handle held by control planes to drive the engine.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) command_tx: mpsc::Sender<EngineCommand>,
    pub(crate) status_rx: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    /// Starts the pipeline.
    ///
    /// # Errors
    /// Returns the supervisor's startup error, or an error if the actor is
    /// gone.
    pub async fn start(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::Start { respond_to: tx })
            .await
            .map_err(|_| anyhow::anyhow!("supervisor stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("supervisor stopped"))?
    }

    /// Stops the pipeline, draining in-flight work.
    ///
    /// # Errors
    /// Returns an error if the actor is gone.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::Stop { respond_to: tx })
            .await
            .map_err(|_| anyhow::anyhow!("supervisor stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("supervisor stopped"))?
    }

    /// Fetches a fresh status snapshot.
    ///
    /// # Errors
    /// Returns an error if the actor is gone.
    pub async fn status(&self) -> anyhow::Result<EngineStatus> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::GetStatus { respond_to: tx })
            .await
            .map_err(|_| anyhow::anyhow!("supervisor stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("supervisor stopped"))
    }

    /// Replaces the configuration atomically.
    ///
    /// # Errors
    /// Returns the validation error, or an error if the actor is gone.
    pub async fn update_config(&self, config: AppConfig) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::UpdateConfig {
                config: Box::new(config),
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("supervisor stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("supervisor stopped"))?
    }

    /// Stops everything and ends the actor.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(EngineCommand::Shutdown).await;
    }

    /// The most recently published status, without a round trip.
    #[must_use]
    pub fn latest_status(&self) -> EngineStatus {
        self.status_rx.borrow().clone()
    }
}
