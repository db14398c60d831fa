//! Cycle boundary shared by every background worker.

use std::future::Future;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::export::health::HealthMetrics;

/// A long-lived background worker.
pub trait Worker: Send {
    /// Returns the worker's name for logging.
    fn name(&self) -> &'static str;

    /// Spawn the worker loop.
    fn start(
        &mut self,
        ctx: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Ask the loop to exit at its next cycle boundary and wait for it.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Spawned loop plus the token that stops it.
#[derive(Default)]
pub struct WorkerTask {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerTask {
    /// Spawns `body` with a child of `ctx`.
    pub fn spawn<F>(
        &mut self,
        name: &'static str,
        ctx: &CancellationToken,
        body: impl FnOnce(CancellationToken) -> F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.handle.is_some() {
            bail!("{name} worker already started");
        }

        let cancel = ctx.child_token();
        self.handle = Some(tokio::spawn(body(cancel.clone())));
        self.cancel = Some(cancel);

        info!(worker = name, "worker started");

        Ok(())
    }

    /// Cancels the loop and waits for it to return.
    pub async fn stop(&mut self, name: &'static str) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .with_context(|| format!("{name} worker task failed"))?;
            info!(worker = name, "worker stopped");
        }

        Ok(())
    }
}

/// How one cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResult {
    Completed,
    Failed,
    Panicked,
}

/// Runs one worker cycle as its own task.
///
/// Errors and panics are logged and counted; they never reach the worker
/// loop, which simply moves on to the next cycle.
pub async fn run_cycle<F>(worker: &'static str, health: &HealthMetrics, cycle: F) -> CycleResult
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    match tokio::spawn(cycle).await {
        Ok(Ok(())) => CycleResult::Completed,
        Ok(Err(e)) => {
            health.cycle_errors.with_label_values(&[worker]).inc();
            let chain = format!("{e:#}");
            error!(worker, error = %chain, "cycle failed");
            CycleResult::Failed
        }
        Err(e) => {
            health.cycle_panics.with_label_values(&[worker]).inc();
            error!(worker, error = %e, "cycle panicked");
            CycleResult::Panicked
        }
    }
}
