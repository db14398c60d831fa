use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::EngineConfig;

use super::marker::Role;

/// Parties in every session.
pub const WORLD_SIZE: u32 = 3;

/// Rendezvous parameters of one computation. Lives for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputationSession {
    pub role: Role,
    pub party_index: u32,
    pub rendezvous_addr: String,
    pub rendezvous_port: u16,
    pub world_size: u32,
    /// Downloaded payload; only the initiator has one.
    pub model_path: Option<PathBuf>,
}

impl ComputationSession {
    pub fn rendezvous_uri(&self) -> String {
        format!("tcp://{}:{}", self.rendezvous_addr, self.rendezvous_port)
    }
}

/// Runs one secure-computation session to completion.
///
/// The engine either completes or fails; nothing about partial results is
/// interpreted.
pub trait ComputeEngine: Send + Sync {
    fn run_session(
        &self,
        session: &ComputationSession,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Engine launched as an external process per session.
pub struct ProcessEngine {
    cfg: EngineConfig,
}

impl ProcessEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        Self { cfg }
    }

    fn command(&self, session: &ComputationSession) -> Command {
        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.args)
            .env("WORLD_SIZE", session.world_size.to_string())
            .env("RANK", session.party_index.to_string())
            .env("RENDEZVOUS", session.rendezvous_uri())
            .env("DISTRIBUTED_BACKEND", &self.cfg.backend)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(model) = &session.model_path {
            cmd.env("MODEL_PATH", model);
        }

        cmd
    }
}

impl ComputeEngine for ProcessEngine {
    async fn run_session(&self, session: &ComputationSession) -> Result<()> {
        info!(
            program = %self.cfg.program,
            role = %session.role,
            rank = session.party_index,
            rendezvous = %session.rendezvous_uri(),
            "launching computation engine",
        );

        let mut child = self
            .command(session)
            .spawn()
            .with_context(|| format!("spawning engine {}", self.cfg.program))?;

        let status = match tokio::time::timeout(self.cfg.session_timeout, child.wait()).await {
            Ok(status) => status.context("waiting for engine")?,
            Err(_) => {
                // Reap the timed-out child.
                let _ = child.kill().await;
                bail!("engine session exceeded {:?}", self.cfg.session_timeout);
            }
        };

        if !status.success() {
            bail!("engine exited with {status}");
        }

        debug!(rank = session.party_index, "engine session finished");

        Ok(())
    }
}
