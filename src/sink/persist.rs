use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::export::health::HealthMetrics;
use crate::worker::{run_cycle, CycleResult, Worker, WorkerTask};

use super::rows::RowBatch;
use super::snapshot::Snapshot;
use super::SnapshotStore;

const WORKER: &str = "persistence";

struct SinkContext<S> {
    store: S,
    user_key: String,
    health: Arc<HealthMetrics>,
}

/// Consumes the snapshot queue and writes each snapshot to the store.
///
/// The schema is created (with retries) before the first write; once it
/// exists the sink publishes a ready signal. Receiving uses a timeout so
/// cancellation is noticed promptly, and anything still queued at stop is
/// written before the task exits.
pub struct PersistenceSink<S> {
    ctx: Arc<SinkContext<S>>,
    cfg: PersistenceConfig,
    rx: Option<mpsc::Receiver<Snapshot>>,
    ready_tx: Arc<watch::Sender<bool>>,
    task: WorkerTask,
}

impl<S: SnapshotStore + 'static> PersistenceSink<S> {
    pub fn new(
        store: S,
        cfg: PersistenceConfig,
        user_key: String,
        rx: mpsc::Receiver<Snapshot>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);

        Self {
            ctx: Arc::new(SinkContext {
                store,
                user_key,
                health,
            }),
            cfg,
            rx: Some(rx),
            ready_tx: Arc::new(ready_tx),
            task: WorkerTask::default(),
        }
    }

    /// Resolves to `true` once the store schema exists.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    async fn run(
        ctx: Arc<SinkContext<S>>,
        cfg: PersistenceConfig,
        mut rx: mpsc::Receiver<Snapshot>,
        ready_tx: Arc<watch::Sender<bool>>,
        cancel: CancellationToken,
    ) {
        loop {
            let cycle_ctx = Arc::clone(&ctx);
            let result = run_cycle(WORKER, &ctx.health, async move {
                cycle_ctx.store.ensure_schema().await
            })
            .await;

            if result == CycleResult::Completed {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(cfg.init_retry_interval) => {}
            }
        }

        ready_tx.send_replace(true);
        ctx.health.store_ready.set(1.0);
        info!(store = ctx.store.name(), "persistence sink ready");

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout(cfg.receive_timeout, rx.recv()) => received,
            };

            match received {
                Ok(Some(snapshot)) => Self::persist(&ctx, snapshot).await,
                Ok(None) => {
                    info!("snapshot queue closed");
                    return;
                }
                Err(_) => debug!("no snapshot within receive timeout"),
            }
        }

        rx.close();
        let mut drained = 0usize;
        while let Some(snapshot) = rx.recv().await {
            Self::persist(&ctx, snapshot).await;
            drained += 1;
        }

        if drained > 0 {
            info!(drained, "drained snapshot queue");
        }
    }

    async fn persist(ctx: &Arc<SinkContext<S>>, snapshot: Snapshot) {
        let cycle_ctx = Arc::clone(ctx);
        run_cycle(WORKER, &ctx.health, async move {
            write_snapshot(&cycle_ctx, snapshot).await
        })
        .await;
    }
}

async fn write_snapshot<S: SnapshotStore>(ctx: &SinkContext<S>, snapshot: Snapshot) -> Result<()> {
    let health = &ctx.health;

    let decoded = match snapshot.decode() {
        Ok(decoded) => decoded,
        Err(e) => {
            health.snapshot_errors.with_label_values(&["decode"]).inc();
            return Err(e).context("decoding snapshot");
        }
    };

    let batch = RowBatch::from_snapshot(&ctx.user_key, &decoded);

    for rejected in &batch.rejected {
        health
            .rows_rejected
            .with_label_values(&[rejected.table()])
            .inc();
        warn!(table = rejected.table(), error = %rejected, "skipping malformed row");
    }

    if batch.is_empty() {
        debug!("snapshot has no rows");
        return Ok(());
    }

    let start = Instant::now();
    let summary = match ctx.store.write_batch(&batch).await {
        Ok(summary) => summary,
        Err(e) => {
            health.snapshot_errors.with_label_values(&["write"]).inc();
            return Err(e).context("writing snapshot rows");
        }
    };

    health
        .snapshot_write_duration
        .observe(start.elapsed().as_secs_f64());
    health.snapshots_written.inc();
    for (table, rows) in [
        ("devices", summary.devices),
        ("dns", summary.dns),
        ("flows", summary.flows),
        ("tls", summary.tls),
    ] {
        health
            .rows_written
            .with_label_values(&[table])
            .inc_by(rows as f64);
    }

    debug!(
        rows = summary.total(),
        rejected = batch.rejected.len(),
        "snapshot written",
    );

    Ok(())
}

impl<S: SnapshotStore + 'static> Worker for PersistenceSink<S> {
    fn name(&self) -> &'static str {
        WORKER
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let rx = self
            .rx
            .take()
            .context("persistence sink already started")?;

        let sink_ctx = Arc::clone(&self.ctx);
        let cfg = self.cfg.clone();
        let ready_tx = Arc::clone(&self.ready_tx);

        self.task.spawn(WORKER, &ctx, move |cancel| {
            Self::run(sink_ctx, cfg, rx, ready_tx, cancel)
        })
    }

    async fn stop(&mut self) -> Result<()> {
        self.task.stop(WORKER).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::measure::{DnsKey, Measurements};
    use crate::sink::snapshot::{WindowMeta, FLOW_FIELD};
    use crate::sink::tests::MemoryStore;
    use crate::sink::{snapshot_queue, SnapshotSender};

    fn snapshot_with_dns(hosts: &[&str]) -> Snapshot {
        let mut m = Measurements::default();
        for host in hosts {
            m.record_dns(
                &DnsKey("s1".into(), (*host).into(), "1.1.1.1".into(), 53),
                "dns",
            );
        }
        Snapshot::encode(
            &WindowMeta {
                client_version: "test".into(),
                duration: 5.0,
                client_ts: 1_700_000_000,
                client_status_text: String::new(),
            },
            &m,
        )
        .expect("encode")
    }

    fn sink(
        store: MemoryStore,
    ) -> (
        PersistenceSink<Arc<MemoryStore>>,
        Arc<MemoryStore>,
        SnapshotSender,
        Arc<HealthMetrics>,
    ) {
        let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics"));
        let store = Arc::new(store);
        let (tx, rx) = snapshot_queue(8, Arc::clone(&health));
        let sink = PersistenceSink::new(
            Arc::clone(&store),
            PersistenceConfig::default(),
            "uk".to_string(),
            rx,
            Arc::clone(&health),
        );
        (sink, store, tx, health)
    }

    async fn wait_for_writes(store: &MemoryStore, n: usize) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while store.written.lock().len() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("writes landed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_schema_retried_until_ready() {
        let store = MemoryStore::default();
        *store.schema_failures.lock() = 2;
        let (mut sink, store, _tx, health) = sink(store);
        let mut ready = sink.ready_signal();

        sink.start(CancellationToken::new()).await.expect("start");

        tokio::time::timeout(Duration::from_secs(30), ready.wait_for(|r| *r))
            .await
            .expect("ready in time")
            .expect("signal open");

        assert_eq!(*store.schema_calls.lock(), 3);
        assert_eq!(health.store_ready.get(), 1.0);
        assert_eq!(
            health.cycle_errors.with_label_values(&[WORKER]).get(),
            2.0
        );

        sink.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_rows_written() {
        let (mut sink, store, tx, health) = sink(MemoryStore::default());
        sink.start(CancellationToken::new()).await.expect("start");

        assert!(tx.enqueue(snapshot_with_dns(&["a.com", "b.com"])).await);
        wait_for_writes(&store, 1).await;

        assert_eq!(store.written.lock()[0].dns, 2);
        assert_eq!(health.snapshots_written.get(), 1.0);
        assert_eq!(health.rows_written.with_label_values(&["dns"]).get(), 2.0);

        sink.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_row_skipped_rest_written() {
        let (mut sink, store, tx, health) = sink(MemoryStore::default());
        sink.start(CancellationToken::new()).await.expect("start");

        let mut snapshot = snapshot_with_dns(&["a.com"]);
        snapshot.insert(FLOW_FIELD, r#"{"[\"broken\"]":{"internal_flow_ts_min":1.0}}"#);
        assert!(tx.enqueue(snapshot).await);
        wait_for_writes(&store, 1).await;

        assert_eq!(store.written.lock()[0].dns, 1);
        assert_eq!(store.written.lock()[0].flows, 0);
        assert_eq!(
            health.rows_rejected.with_label_values(&["flows"]).get(),
            1.0
        );

        sink.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_snapshot_does_not_stop_sink() {
        let (mut sink, store, tx, health) = sink(MemoryStore::default());
        sink.start(CancellationToken::new()).await.expect("start");

        let mut bad = snapshot_with_dns(&["a.com"]);
        bad.insert(FLOW_FIELD, "{oops");
        assert!(tx.enqueue(bad).await);
        assert!(tx.enqueue(snapshot_with_dns(&["b.com"])).await);
        wait_for_writes(&store, 1).await;

        assert_eq!(
            health.snapshot_errors.with_label_values(&["decode"]).get(),
            1.0
        );
        assert_eq!(store.written.lock().len(), 1);

        sink.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_panic_contained() {
        let store = MemoryStore::default();
        store.panic_on_write.store(true, Ordering::SeqCst);
        let (mut sink, store, tx, health) = sink(store);
        sink.start(CancellationToken::new()).await.expect("start");

        assert!(tx.enqueue(snapshot_with_dns(&["a.com"])).await);
        assert!(tx.enqueue(snapshot_with_dns(&["b.com"])).await);
        wait_for_writes(&store, 1).await;

        assert_eq!(health.cycle_panics.with_label_values(&[WORKER]).get(), 1.0);

        sink.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_queue_keeps_waiting() {
        let (mut sink, store, tx, _health) = sink(MemoryStore::default());
        let mut ready = sink.ready_signal();
        sink.start(CancellationToken::new()).await.expect("start");
        ready.wait_for(|r| *r).await.expect("ready");

        // Several receive timeouts elapse without a snapshot.
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(store.written.lock().is_empty());

        assert!(tx.enqueue(snapshot_with_dns(&["a.com"])).await);
        wait_for_writes(&store, 1).await;

        sink.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_queue() {
        let (mut sink, store, tx, _health) = sink(MemoryStore::default());
        let mut ready = sink.ready_signal();
        sink.start(CancellationToken::new()).await.expect("start");
        ready.wait_for(|r| *r).await.expect("ready");

        for host in ["a.com", "b.com", "c.com"] {
            assert!(tx.try_enqueue(snapshot_with_dns(&[host])));
        }
        sink.stop().await.expect("stop");

        assert_eq!(store.written.lock().len(), 3);
    }
}
