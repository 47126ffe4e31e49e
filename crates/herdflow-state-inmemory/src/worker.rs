//! Background worker driving timers, module deliveries and deadlines.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use herdflow_core::WorkflowRuntime;

/// Handle of a running worker
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop the worker after its current pass and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::error!("Workflow worker panicked: {}", e);
        }
    }
}

/// Periodically runs one scheduler pass of the runtime
pub struct WorkflowWorker {
    runtime: WorkflowRuntime,
    interval: Duration,
}

impl WorkflowWorker {
    /// Worker ticking at the runtime's configured interval
    pub fn new(runtime: WorkflowRuntime) -> Self {
        let interval = runtime.manager().config().worker_interval();
        Self { runtime, interval }
    }

    /// Override the tick interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the worker loop
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            tracing::info!(
                interval_ms = self.interval.as_millis() as u64,
                "Workflow worker started"
            );
            let mut interval = tokio::time::interval(self.interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Workflow worker stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        match self.runtime.tick(Utc::now()).await {
                            Ok((timers, dispatch)) => {
                                if timers.fired + dispatch.delivered + dispatch.failed > 0 {
                                    tracing::debug!(
                                        timers_fired = timers.fired,
                                        timers_stale = timers.stale,
                                        delivered = dispatch.delivered,
                                        retrying = dispatch.retrying,
                                        failed = dispatch.failed,
                                        escalated = dispatch.escalated,
                                        "Worker pass finished"
                                    );
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Worker pass failed");
                            }
                        }
                    }
                }
            }
        });

        WorkerHandle { shutdown_tx, join }
    }
}
