use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::FingerprintConfig;
use crate::export::health::HealthMetrics;
use crate::remote::{Fingerprint, RemoteService};
use crate::state::RunState;
use crate::worker::{run_cycle, Worker, WorkerTask};

const WORKER: &str = "fingerprint";

/// Histogram of the whitelisted device ids, normalized to sum to 1.
///
/// Each id lands in bucket `sha256(id)[0] % dimensions`, so the vector says
/// how many devices are inspected without naming any of them.
pub fn summary_vector(device_ids: &[String], dimensions: usize) -> Vec<f64> {
    let dimensions = dimensions.max(1);
    let mut buckets = vec![0.0; dimensions];

    for id in device_ids {
        let digest = Sha256::digest(id.as_bytes());
        buckets[usize::from(digest[0]) % dimensions] += 1.0;
    }

    let total = device_ids.len() as f64;
    if total > 0.0 {
        for b in &mut buckets {
            *b /= total;
        }
    }

    buckets
}

struct FingerprintContext<R> {
    state: Arc<RunState>,
    remote: Arc<R>,
    cfg: FingerprintConfig,
    health: Arc<HealthMetrics>,
}

impl<R: RemoteService> FingerprintContext<R> {
    fn build(&self) -> Fingerprint {
        let host_id = self.state.identity().device_id(&self.state.network().host_mac);

        Fingerprint {
            name: format!("fp_{host_id}"),
            fingerprint: summary_vector(&self.state.device_whitelist(), self.cfg.dimensions),
        }
    }

    /// One best-effort submission; failures are logged and not retried.
    async fn submit(&self) -> Result<()> {
        let fingerprint = self.build();

        match self
            .remote
            .submit_fingerprint(self.state.user_key(), &fingerprint)
            .await
        {
            Ok(()) => {
                self.health.fingerprints.with_label_values(&["success"]).inc();
                debug!(name = %fingerprint.name, "fingerprint submitted");
            }
            Err(e) => {
                self.health.fingerprints.with_label_values(&["error"]).inc();
                warn!(error = %e, "fingerprint submission failed");
            }
        }

        Ok(())
    }
}

/// Periodically submits the fingerprint summary vector.
pub struct FingerprintWorker<R> {
    ctx: Arc<FingerprintContext<R>>,
    task: WorkerTask,
}

impl<R: RemoteService + 'static> FingerprintWorker<R> {
    pub fn new(
        state: Arc<RunState>,
        remote: Arc<R>,
        cfg: FingerprintConfig,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            ctx: Arc::new(FingerprintContext {
                state,
                remote,
                cfg,
                health,
            }),
            task: WorkerTask::default(),
        }
    }

    async fn run(ctx: Arc<FingerprintContext<R>>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(ctx.cfg.interval) => {}
            }

            if !ctx.state.is_inspecting() {
                continue;
            }

            let cycle_ctx = Arc::clone(&ctx);
            run_cycle(WORKER, &ctx.health, async move { cycle_ctx.submit().await }).await;
        }
    }
}

impl<R: RemoteService + 'static> Worker for FingerprintWorker<R> {
    fn name(&self) -> &'static str {
        WORKER
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let fp_ctx = Arc::clone(&self.ctx);
        self.task
            .spawn(WORKER, &ctx, move |cancel| Self::run(fp_ctx, cancel))
    }

    async fn stop(&mut self) -> Result<()> {
        self.task.stop(WORKER).await
    }
}
