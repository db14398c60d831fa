pub mod engine;
pub mod marker;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PeerMarkerPolicy, SecureComputeConfig};
use crate::export::health::HealthMetrics;
use crate::remote::{PeerAssignment, RemoteService};
use crate::state::RunState;
use crate::worker::{run_cycle, Worker, WorkerTask};

pub use engine::{ComputationSession, ComputeEngine, ProcessEngine, WORLD_SIZE};
pub use marker::{designate, Role, RoleMarkers};

const WORKER: &str = "secure_compute";

/// Payload file written into the marker directory while initiating.
const MODEL_FILE: &str = "model.bin";

/// How one orchestrator cycle ended for the active role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The engine ran to completion.
    Completed,
    /// The engine failed, panicked, or could not be started.
    EngineFailed,
    /// Fewer than two partners were available.
    NoPartners,
    /// The computation payload could not be fetched.
    PayloadUnavailable,
    /// No peer assignment this cycle.
    Unassigned,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::EngineFailed => "engine_failed",
            Self::NoPartners => "no_partners",
            Self::PayloadUnavailable => "payload_unavailable",
            Self::Unassigned => "unassigned",
        }
    }
}

struct OrchestratorContext<R, E> {
    state: Arc<RunState>,
    remote: Arc<R>,
    engine: E,
    markers: RoleMarkers,
    cfg: SecureComputeConfig,
    health: Arc<HealthMetrics>,
}

impl<R, E> OrchestratorContext<R, E>
where
    R: RemoteService + 'static,
    E: ComputeEngine + 'static,
{
    /// HEARTBEAT, then at most one computation for whichever marker is set.
    async fn cycle(self: &Arc<Self>) -> Result<()> {
        let assignment = self.heartbeat().await;

        if self.markers.is_present(Role::Initiator) {
            let outcome = self.initiate().await;
            self.record(Role::Initiator, outcome);
        } else if self.markers.is_present(Role::Peer) {
            let outcome = self.assist(assignment).await;
            self.record(Role::Peer, outcome);
        } else {
            debug!("no role marker, idle");
        }

        Ok(())
    }

    /// Any heartbeat failure counts as no assignment.
    async fn heartbeat(&self) -> Option<PeerAssignment> {
        match self.remote.heartbeat(self.state.user_key()).await {
            Ok(resp) => {
                let assignment = resp.assignment().cloned();
                let outcome = if assignment.is_some() {
                    "assigned"
                } else {
                    "unassigned"
                };
                self.health.heartbeats.with_label_values(&[outcome]).inc();
                assignment
            }
            Err(e) => {
                self.health.heartbeats.with_label_values(&["failed"]).inc();
                warn!(error = %e, "heartbeat failed");
                None
            }
        }
    }

    async fn initiate(self: &Arc<Self>) -> CycleOutcome {
        let marker = self.markers.guard(Role::Initiator);
        let outcome = self.run_initiator().await;
        drop(marker);

        self.separate().await;
        outcome
    }

    async fn run_initiator(self: &Arc<Self>) -> CycleOutcome {
        let user_key = self.state.user_key();

        for n in 1..=2 {
            match self.remote.request_partner(user_key).await {
                Ok(partner) if partner.success => {
                    info!(
                        partner = n,
                        address = partner.address.as_deref().unwrap_or("-"),
                        "partner found",
                    );
                }
                Ok(_) => {
                    warn!(partner = n, "partner unavailable, computation aborted");
                    return CycleOutcome::NoPartners;
                }
                Err(e) => {
                    warn!(partner = n, error = %e, "partner request failed, computation aborted");
                    return CycleOutcome::NoPartners;
                }
            }
        }

        let model_path = self.markers.dir().join(MODEL_FILE);
        match self.remote.fetch_model(&model_path).await {
            Ok(bytes) => info!(bytes, "computation payload fetched"),
            Err(e) => {
                warn!(error = %e, "computation payload unavailable");
                return CycleOutcome::PayloadUnavailable;
            }
        }

        let outcome = self
            .run_engine(ComputationSession {
                role: Role::Initiator,
                party_index: 0,
                rendezvous_addr: self.cfg.initiator_address.clone(),
                rendezvous_port: self.cfg.rendezvous_port,
                world_size: WORLD_SIZE,
                model_path: Some(model_path.clone()),
            })
            .await;

        if let Err(e) = tokio::fs::remove_file(&model_path).await {
            debug!(error = %e, "model file not removed");
        }

        outcome
    }

    async fn assist(self: &Arc<Self>, assignment: Option<PeerAssignment>) -> CycleOutcome {
        let outcome = match assignment {
            None => {
                debug!("peer marker set but no assignment yet");
                CycleOutcome::Unassigned
            }
            Some(peer) => {
                let consumed = (self.cfg.peer_marker == PeerMarkerPolicy::ConsumeOnAssignment)
                    .then(|| self.markers.guard(Role::Peer));
                let outcome = self.run_peer(&peer).await;
                drop(consumed);
                outcome
            }
        };

        self.separate().await;
        outcome
    }

    async fn run_peer(self: &Arc<Self>, peer: &PeerAssignment) -> CycleOutcome {
        let Some(party_index) = u32::try_from(peer.index)
            .ok()
            .filter(|index| *index < WORLD_SIZE)
        else {
            warn!(index = peer.index, "assigned party index out of range");
            return CycleOutcome::EngineFailed;
        };

        info!(
            address = %peer.address,
            index = party_index,
            "assisting computation",
        );

        self.run_engine(ComputationSession {
            role: Role::Peer,
            party_index,
            rendezvous_addr: peer.address.clone(),
            rendezvous_port: peer.port.unwrap_or(self.cfg.rendezvous_port),
            world_size: WORLD_SIZE,
            model_path: None,
        })
        .await
    }

    /// Runs the engine in its own task so a panic inside it is reported as a
    /// failure and never skips the caller's cleanup.
    async fn run_engine(self: &Arc<Self>, session: ComputationSession) -> CycleOutcome {
        let ctx = Arc::clone(self);
        let role = session.role;
        let start = Instant::now();

        let result = tokio::spawn(async move { ctx.engine.run_session(&session).await })
            .await
            .unwrap_or_else(|e| Err(anyhow!("engine panicked: {e}")));

        self.health
            .computation_duration
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                info!(%role, "computation finished");
                CycleOutcome::Completed
            }
            Err(e) => {
                warn!(%role, error = %e, "computation failed");
                CycleOutcome::EngineFailed
            }
        }
    }

    async fn separate(&self) {
        match self.remote.separate(self.state.user_key()).await {
            Ok(()) => debug!("separation notice sent"),
            Err(e) => warn!(error = %e, "separation notice failed"),
        }
    }

    fn record(&self, role: Role, outcome: CycleOutcome) {
        self.health
            .computations
            .with_label_values(&[role.as_str(), outcome.as_str()])
            .inc();
    }
}

/// Secure-computation orchestrator.
///
/// Waits for the snapshot store to become ready, then on every interval
/// sends a heartbeat and acts on this process's role markers: initiate a
/// three-party computation, assist one as a peer, or stay idle.
pub struct Orchestrator<R, E> {
    ctx: Arc<OrchestratorContext<R, E>>,
    store_ready: watch::Receiver<bool>,
    task: WorkerTask,
}

impl<R, E> Orchestrator<R, E>
where
    R: RemoteService + 'static,
    E: ComputeEngine + 'static,
{
    /// Builds the orchestrator and creates its marker directory.
    pub fn new(
        state: Arc<RunState>,
        remote: Arc<R>,
        engine: E,
        markers: RoleMarkers,
        cfg: SecureComputeConfig,
        store_ready: watch::Receiver<bool>,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        markers.create_dir()?;

        info!(dir = %markers.dir().display(), "role marker directory ready");

        Ok(Self {
            ctx: Arc::new(OrchestratorContext {
                state,
                remote,
                engine,
                markers,
                cfg,
                health,
            }),
            store_ready,
            task: WorkerTask::default(),
        })
    }

    pub fn markers(&self) -> &RoleMarkers {
        &self.ctx.markers
    }

    async fn run(
        ctx: Arc<OrchestratorContext<R, E>>,
        store_ready: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) {
        while !*store_ready.borrow() {
            debug!("waiting for snapshot store");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(ctx.cfg.store_poll_interval) => {}
            }
        }

        info!("snapshot store ready, orchestrator running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(ctx.cfg.interval) => {}
            }

            let cycle_ctx = Arc::clone(&ctx);
            run_cycle(WORKER, &ctx.health, async move { cycle_ctx.cycle().await }).await;
        }
    }
}

impl<R, E> Worker for Orchestrator<R, E>
where
    R: RemoteService + 'static,
    E: ComputeEngine + 'static,
{
    fn name(&self) -> &'static str {
        WORKER
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let orchestrator_ctx = Arc::clone(&self.ctx);
        let store_ready = self.store_ready.clone();
        self.task.spawn(WORKER, &ctx, move |cancel| {
            Self::run(orchestrator_ctx, store_ready, cancel)
        })
    }

    /// Stops the loop, then removes both markers and their directory.
    async fn stop(&mut self) -> Result<()> {
        self.task.stop(WORKER).await?;
        self.ctx.markers.remove_all()
    }
}
