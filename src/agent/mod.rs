use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::compute::{Orchestrator, ProcessEngine, RoleMarkers};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::fingerprint::FingerprintWorker;
use crate::identity::{self, Identity};
use crate::netinfo;
use crate::remote;
use crate::sink::clickhouse::ClickHouseStore;
use crate::sink::persist::PersistenceSink;
use crate::sink::{snapshot_queue, SnapshotSender};
use crate::state::RunState;
use crate::upload::UploadWorker;
use crate::worker::Worker;

/// Agent wires the run state, the remote client and every background worker.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    state: Option<Arc<RunState>>,
    queue: Option<SnapshotSender>,
    sink: Option<PersistenceSink<ClickHouseStore>>,
    upload: Option<UploadWorker<remote::Client>>,
    orchestrator: Option<Orchestrator<remote::Client, ProcessEngine>>,
    fingerprint: Option<FingerprintWorker<remote::Client>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate().context("validating config")?;

        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            state: None,
            queue: None,
            sink: None,
            upload: None,
            orchestrator: None,
            fingerprint: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Resolves identity and network context, then starts every worker.
    /// Returns the shared run state.
    pub async fn start(&mut self) -> Result<Arc<RunState>> {
        // 1. Remote client and identity.
        let remote = Arc::new(self.create_remote_client()?);

        let identity = Identity::load_or_register(&self.cfg.identity_path(), remote.as_ref())
            .await
            .context("loading client identity")?;
        info!(
            user_key = %identity::pretty_user_key(&identity.user_key),
            "client identity loaded",
        );

        // 2. Network context, resolved once.
        let network = netinfo::resolve(&self.cfg.network).context("resolving network context")?;
        info!(
            interface = %network.interface,
            gateway = %network.gateway_ip,
            host = %network.host_ip,
            "network context resolved",
        );

        let state = Arc::new(RunState::new(
            identity,
            network,
            self.cfg.raspberry_pi_mode,
            self.cfg.start_inspecting,
        ));
        let writer = state
            .take_directive_writer()
            .context("directive writer already taken")?;

        // 3. Status and metrics server.
        self.health
            .inspecting
            .set(if state.is_inspecting() { 1.0 } else { 0.0 });
        let addr = self
            .health
            .start(Arc::clone(&state))
            .await
            .context("starting status server")?;
        info!(%addr, "status server started");

        // 4. Persistence sink.
        let (queue, rx) = snapshot_queue(
            self.cfg.persistence.queue_capacity,
            Arc::clone(&self.health),
        );
        let mut sink = PersistenceSink::new(
            ClickHouseStore::new(&self.cfg.persistence.clickhouse),
            self.cfg.persistence.clone(),
            state.user_key().to_string(),
            rx,
            Arc::clone(&self.health),
        );
        let store_ready = sink.ready_signal();
        sink.start(self.cancel.clone()).await?;
        self.sink = Some(sink);

        // 5. Upload worker, the only directive writer.
        let mut upload = UploadWorker::new(
            writer,
            Arc::clone(&remote),
            self.cfg.upload.clone(),
            queue.clone(),
            Arc::clone(&self.health),
        );
        upload.start(self.cancel.clone()).await?;
        self.upload = Some(upload);

        // 6. Secure-computation orchestrator.
        if self.cfg.secure_compute.enabled {
            let markers = RoleMarkers::new(&self.cfg.marker_root(), std::process::id());
            let mut orchestrator = Orchestrator::new(
                Arc::clone(&state),
                Arc::clone(&remote),
                ProcessEngine::new(self.cfg.secure_compute.engine.clone()),
                markers,
                self.cfg.secure_compute.clone(),
                store_ready,
                Arc::clone(&self.health),
            )
            .context("creating secure-computation orchestrator")?;
            orchestrator.start(self.cancel.clone()).await?;
            self.orchestrator = Some(orchestrator);
        } else {
            info!("secure computation disabled");
        }

        // 7. Fingerprint reporter.
        if self.cfg.fingerprint.enabled {
            let mut fingerprint = FingerprintWorker::new(
                Arc::clone(&state),
                Arc::clone(&remote),
                self.cfg.fingerprint.clone(),
                Arc::clone(&self.health),
            );
            fingerprint.start(self.cancel.clone()).await?;
            self.fingerprint = Some(fingerprint);
        }

        self.queue = Some(queue);
        self.state = Some(Arc::clone(&state));

        info!(
            raspberry_pi_mode = self.cfg.raspberry_pi_mode,
            inspecting = state.is_inspecting(),
            "agent fully started",
        );

        Ok(state)
    }

    /// Producer handle for snapshots from packet processing.
    pub fn snapshot_sender(&self) -> Option<SnapshotSender> {
        self.queue.clone()
    }

    pub fn state(&self) -> Option<&Arc<RunState>> {
        self.state.as_ref()
    }

    /// Stops every worker, producers first so the sink drains last.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut fingerprint) = self.fingerprint.take() {
            stop_worker(&mut fingerprint).await;
        }
        if let Some(mut orchestrator) = self.orchestrator.take() {
            stop_worker(&mut orchestrator).await;
        }
        if let Some(mut upload) = self.upload.take() {
            stop_worker(&mut upload).await;
        }
        if let Some(mut sink) = self.sink.take() {
            stop_worker(&mut sink).await;
        }

        self.cancel.cancel();
        self.queue = None;

        self.health.stop().await?;

        Ok(())
    }

    /// Create the coordination service client with a metrics callback.
    fn create_remote_client(&self) -> Result<remote::Client> {
        let client =
            remote::Client::new(&self.cfg.server).context("creating coordination client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |endpoint, status, duration| {
            health.record_remote_request(endpoint, status, duration.as_secs_f64());
        }));

        Ok(client)
    }
}

async fn stop_worker<W: Worker>(worker: &mut W) {
    if let Err(e) = worker.stop().await {
        error!(worker = worker.name(), error = %e, "error stopping worker");
    }
}
