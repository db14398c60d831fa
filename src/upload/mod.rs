pub mod window;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::export::health::HealthMetrics;
use crate::remote::{RemoteService, ReportResponse, ACTION_FAST_ARP_DISCOVERY, ACTION_QUIT};
use crate::sink::snapshot::Snapshot;
use crate::sink::SnapshotSender;
use crate::state::{ClientStatus, DirectiveWriter, Directives, RunState};
use crate::worker::{run_cycle, Worker, WorkerTask};

pub use window::UploadWindow;

const WORKER: &str = "upload";

/// Acknowledgement text of the UTC offset handshake.
const UTC_OFFSET_ACK: &str = "SUCCESS";

/// Backoff after the 0-indexed attempt `attempt`: `unit * (attempt+1)^2`.
pub fn backoff(unit: Duration, attempt: u32) -> Duration {
    let n = attempt.saturating_add(1);
    unit.saturating_mul(n.saturating_mul(n))
}

/// Derives the state changes one report reply asks for.
///
/// Quit comes from an explicit action or from a UI that has been silent
/// for longer than `ui_timeout`. The whitelist only changes on success.
pub fn directives_from(resp: &ReportResponse, now_ts: f64, ui_timeout: Duration) -> Directives {
    let action = resp.client_action.as_deref();

    let ui_stale = resp
        .ui_last_active_ts
        .filter(|ts| *ts != 0.0)
        .is_some_and(|ts| now_ts - ts > ui_timeout.as_secs_f64());

    Directives {
        quit: action == Some(ACTION_QUIT) || ui_stale,
        fast_arp_scan: action == Some(ACTION_FAST_ARP_DISCOVERY),
        whitelist: resp.whitelist().map(<[String]>::to_vec),
    }
}

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

struct UploadContext<R> {
    writer: DirectiveWriter,
    remote: Arc<R>,
    cfg: UploadConfig,
    queue: SnapshotSender,
    health: Arc<HealthMetrics>,
}

impl<R: RemoteService> UploadContext<R> {
    fn state(&self) -> &Arc<RunState> {
        self.writer.state()
    }

    /// Pushes the UTC offset until the server acknowledges it. Returns false
    /// if cancelled first.
    async fn handshake(&self, cancel: &CancellationToken) -> bool {
        let offset = Local::now().offset().local_minus_utc();

        loop {
            match self
                .remote
                .submit_utc_offset(self.state().user_key(), offset)
                .await
            {
                Ok(reply) if reply == UTC_OFFSET_ACK => {
                    info!(offset_seconds = offset, "UTC offset acknowledged");
                    return true;
                }
                Ok(reply) => warn!(reply = %reply, "UTC offset not acknowledged"),
                Err(e) => warn!(error = %e, "UTC offset submission failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.cfg.init_retry_interval) => {}
            }
        }
    }

    async fn report_cycle(&self) -> Result<()> {
        let status_text = self.state().status().to_string();

        let Some(drained) = self.state().take_window(self.cfg.min_window) else {
            self.health.windows_skipped.inc();
            debug!("window too short, skipping report");
            return Ok(());
        };

        let window = UploadWindow::new(drained, status_text);
        let report = window.to_snapshot().context("encoding report window")?;

        if !self.queue.try_enqueue(report.clone()) {
            warn!("snapshot queue full, window not persisted");
        }

        let delivered = self.submit_with_retry(&report).await;

        let bytes = self.state().take_byte_count();
        let rate = bytes.bytes_per_sec();
        self.health.bytes_observed.inc_by(bytes.bytes as f64);
        self.health.throughput_bytes_per_second.set(rate);
        self.writer
            .set_status(ClientStatus::Analyzing { bytes_per_sec: rate });

        info!(
            bytes = bytes.bytes,
            kb_per_sec = rate / 1000.0,
            window_secs = window.meta.duration,
            delivered,
            "upload cycle finished",
        );

        Ok(())
    }

    /// Submits one report with bounded retries. Returns true once the
    /// server accepts it.
    async fn submit_with_retry(&self, report: &Snapshot) -> bool {
        let user_key = self.state().user_key();

        for attempt in 0..self.cfg.max_attempts {
            match self.remote.submit_report(user_key, report).await {
                Ok(resp) => {
                    let directives =
                        directives_from(&resp, now_ts(), self.cfg.ui_inactivity_timeout);
                    if self.writer.apply(&directives) {
                        warn!("quit directive recorded");
                    }
                    if directives.fast_arp_scan {
                        info!("fast ARP discovery requested");
                    }

                    if let Some(whitelist) = resp.whitelist() {
                        self.health
                            .report_attempts
                            .with_label_values(&["success"])
                            .inc();
                        self.health.reports_submitted.inc();
                        debug!(
                            attempt = attempt + 1,
                            whitelisted = whitelist.len(),
                            "report accepted",
                        );
                        return true;
                    }

                    if resp.is_success() {
                        self.health
                            .report_attempts
                            .with_label_values(&["malformed"])
                            .inc();
                        warn!(
                            attempt = attempt + 1,
                            "success reply without inspected_devices",
                        );
                    } else {
                        self.health
                            .report_attempts
                            .with_label_values(&["rejected"])
                            .inc();
                        warn!(
                            attempt = attempt + 1,
                            status = resp.status.as_deref().unwrap_or("<missing>"),
                            "report not accepted",
                        );
                    }
                }
                Err(e) => {
                    self.health
                        .report_attempts
                        .with_label_values(&["error"])
                        .inc();
                    warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "report submission failed",
                    );
                }
            }

            self.writer.set_status(ClientStatus::Retrying {
                attempt: attempt + 1,
            });
            tokio::time::sleep(backoff(self.cfg.backoff_unit, attempt)).await;
        }

        self.health.reports_abandoned.inc();
        warn!(attempts = self.cfg.max_attempts, "report abandoned");

        false
    }
}

/// Periodically reports the drained measurement window to the coordination
/// service and applies the directives it sends back.
///
/// Holds the only [`DirectiveWriter`]. Cancellation is observed at cycle
/// boundaries, so stopping waits for an in-flight report and its retries.
pub struct UploadWorker<R> {
    ctx: Arc<UploadContext<R>>,
    task: WorkerTask,
}

impl<R: RemoteService + 'static> UploadWorker<R> {
    pub fn new(
        writer: DirectiveWriter,
        remote: Arc<R>,
        cfg: UploadConfig,
        queue: SnapshotSender,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            ctx: Arc::new(UploadContext {
                writer,
                remote,
                cfg,
                queue,
                health,
            }),
            task: WorkerTask::default(),
        }
    }

    async fn run(ctx: Arc<UploadContext<R>>, cancel: CancellationToken) {
        if !ctx.handshake(&cancel).await {
            return;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(ctx.cfg.interval) => {}
            }

            if !ctx.state().is_inspecting() {
                ctx.writer.set_status(ClientStatus::Paused);
                ctx.state().clear_pending();
                debug!("inspection paused, pending data cleared");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ctx.cfg.pause_poll_interval) => {}
                }
                continue;
            }

            let cycle_ctx = Arc::clone(&ctx);
            run_cycle(WORKER, &ctx.health, async move {
                cycle_ctx.report_cycle().await
            })
            .await;
        }
    }
}

impl<R: RemoteService + 'static> Worker for UploadWorker<R> {
    fn name(&self) -> &'static str {
        WORKER
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let upload_ctx = Arc::clone(&self.ctx);
        self.task
            .spawn(WORKER, &ctx, move |cancel| Self::run(upload_ctx, cancel))
    }

    async fn stop(&mut self) -> Result<()> {
        self.task.stop(WORKER).await
    }
}
