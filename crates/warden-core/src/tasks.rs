//! Background reconciliation and expiry loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::Orchestrator;

/// Handles to the periodic loops; dropping without calling
/// [`BackgroundTasks::shutdown`] aborts them with the runtime.
pub struct BackgroundTasks {
    reconcile: JoinHandle<()>,
    expiry: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl BackgroundTasks {
    /// Spawns the reconciliation and expiry loops. Each fires on its own
    /// interval; per-sandbox locks inside the orchestrator serialize the
    /// loops against user requests.
    pub fn spawn(
        orchestrator: Arc<Orchestrator>,
        reconcile_every: Duration,
        expiry_every: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        let reconcile = {
            let orchestrator = orchestrator.clone();
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(reconcile_every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => orchestrator.reconcile_once().await,
                        _ = stop.changed() => break,
                    }
                }
                info!("reconciliation loop stopped");
            })
        };

        let expiry = {
            let mut stop = stop_rx;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(expiry_every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => { orchestrator.expire_once().await; }
                        _ = stop.changed() => break,
                    }
                }
                info!("expiry loop stopped");
            })
        };

        Self {
            reconcile,
            expiry,
            stop_tx,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.reconcile.await;
        let _ = self.expiry.await;
    }
}
