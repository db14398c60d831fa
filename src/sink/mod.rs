pub mod clickhouse;
pub mod persist;
pub mod rows;
pub mod snapshot;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::export::health::HealthMetrics;

use rows::RowBatch;
use snapshot::Snapshot;

/// Rows accepted by the store, per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub devices: usize,
    pub dns: usize,
    pub flows: usize,
    pub tls: usize,
}

impl WriteSummary {
    pub fn total(&self) -> usize {
        self.devices + self.dns + self.flows + self.tls
    }
}

/// Durable destination of snapshot rows.
pub trait SnapshotStore: Send + Sync {
    /// Returns the store's name for logging.
    fn name(&self) -> &str;

    /// Creates the schema if missing. Safe to call on every startup.
    fn ensure_schema(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Writes one snapshot's rows; each table's rows commit as one unit.
    fn write_batch(
        &self,
        batch: &RowBatch,
    ) -> impl std::future::Future<Output = Result<WriteSummary>> + Send;
}

impl<T: SnapshotStore> SnapshotStore for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn ensure_schema(&self) -> Result<()> {
        (**self).ensure_schema().await
    }

    async fn write_batch(&self, batch: &RowBatch) -> Result<WriteSummary> {
        (**self).write_batch(batch).await
    }
}

/// Producer side of the bounded snapshot queue.
#[derive(Clone)]
pub struct SnapshotSender {
    tx: mpsc::Sender<Snapshot>,
    health: Arc<HealthMetrics>,
}

/// Creates the bounded snapshot queue.
pub fn snapshot_queue(
    capacity: usize,
    health: Arc<HealthMetrics>,
) -> (SnapshotSender, mpsc::Receiver<Snapshot>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SnapshotSender { tx, health }, rx)
}

impl SnapshotSender {
    /// Enqueues a snapshot, waiting for space. Returns false once the sink is gone.
    pub async fn enqueue(&self, snapshot: Snapshot) -> bool {
        match self.tx.send(snapshot).await {
            Ok(()) => {
                self.health.snapshots_enqueued.inc();
                true
            }
            Err(_) => {
                self.health.snapshots_dropped.inc();
                false
            }
        }
    }

    /// Enqueues without waiting; a full or closed queue drops the snapshot.
    pub fn try_enqueue(&self, snapshot: Snapshot) -> bool {
        match self.tx.try_send(snapshot) {
            Ok(()) => {
                self.health.snapshots_enqueued.inc();
                true
            }
            Err(_) => {
                self.health.snapshots_dropped.inc();
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;

    /// In-memory store recording every batch it was asked to write.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub schema_failures: Mutex<u32>,
        pub schema_calls: Mutex<u32>,
        pub write_failures: Mutex<u32>,
        pub written: Mutex<Vec<WriteSummary>>,
        pub panic_on_write: std::sync::atomic::AtomicBool,
    }

    impl SnapshotStore for MemoryStore {
        fn name(&self) -> &str {
            "memory"
        }

        async fn ensure_schema(&self) -> Result<()> {
            *self.schema_calls.lock() += 1;
            let mut failures = self.schema_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("store unavailable");
            }
            Ok(())
        }

        async fn write_batch(&self, batch: &RowBatch) -> Result<WriteSummary> {
            if self
                .panic_on_write
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                panic!("store exploded");
            }

            {
                let mut failures = self.write_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    anyhow::bail!("write failed");
                }
            }

            let summary = WriteSummary {
                devices: batch.devices.len(),
                dns: batch.dns.len(),
                flows: batch.flows.len(),
                tls: batch.tls.len(),
            };
            self.written.lock().push(summary);
            Ok(summary)
        }
    }

    fn health() -> Arc<HealthMetrics> {
        Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics"))
    }

    #[tokio::test]
    async fn test_try_enqueue_drops_when_full() {
        let health = health();
        let (tx, mut rx) = snapshot_queue(1, Arc::clone(&health));

        assert!(tx.try_enqueue(Snapshot::default()));
        assert!(!tx.try_enqueue(Snapshot::default()));
        assert_eq!(health.snapshots_enqueued.get(), 1.0);
        assert_eq!(health.snapshots_dropped.get(), 1.0);

        assert!(rx.recv().await.is_some());
        assert!(tx.try_enqueue(Snapshot::default()));
    }

    #[tokio::test]
    async fn test_enqueue_after_close_reports_failure() {
        let health = health();
        let (tx, rx) = snapshot_queue(4, Arc::clone(&health));
        drop(rx);

        assert!(!tx.enqueue(Snapshot::default()).await);
        assert_eq!(health.snapshots_dropped.get(), 1.0);
    }

    #[test]
    fn test_write_summary_total() {
        let s = WriteSummary {
            devices: 1,
            dns: 2,
            flows: 3,
            tls: 4,
        };
        assert_eq!(s.total(), 10);
    }
}
