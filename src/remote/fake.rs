//! Scripted coordination service for worker tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;

use super::{
    Fingerprint, HeartbeatResponse, PartnerResponse, RemoteService, ReportResponse,
};
use crate::sink::snapshot::Snapshot;

/// A request the fake observed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    GenerateUserKey,
    UtcOffset(i32),
    Report,
    Fingerprint,
    Heartbeat,
    Partner,
    FetchModel,
    Separate,
}

/// Replies are popped from per-endpoint queues. An empty queue falls back
/// to: UTC offset `SUCCESS`, report error, empty heartbeat, unsuccessful
/// partner, empty model.
#[derive(Default)]
pub(crate) struct FakeRemote {
    pub user_keys: Mutex<VecDeque<Result<String>>>,
    pub utc_replies: Mutex<VecDeque<Result<String>>>,
    pub report_replies: Mutex<VecDeque<Result<ReportResponse>>>,
    pub heartbeat_replies: Mutex<VecDeque<Result<HeartbeatResponse>>>,
    pub partner_replies: Mutex<VecDeque<Result<PartnerResponse>>>,
    pub model: Mutex<Vec<u8>>,
    pub fail_fingerprint: AtomicBool,
    pub fail_separate: AtomicBool,
    pub calls: Mutex<Vec<Call>>,
    pub reports: Mutex<Vec<Snapshot>>,
    pub fingerprints: Mutex<Vec<Fingerprint>>,
}

impl FakeRemote {
    pub fn count(&self, call: &Call) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| std::mem::discriminant(*c) == std::mem::discriminant(call))
            .count()
    }

    pub fn push_report(&self, reply: Result<ReportResponse>) {
        self.report_replies.lock().push_back(reply);
    }

    pub fn push_heartbeat(&self, reply: Result<HeartbeatResponse>) {
        self.heartbeat_replies.lock().push_back(reply);
    }

    pub fn push_partner(&self, reply: Result<PartnerResponse>) {
        self.partner_replies.lock().push_back(reply);
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl RemoteService for FakeRemote {
    async fn generate_user_key(&self) -> Result<String> {
        self.record(Call::GenerateUserKey);
        self.user_keys
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no user key scripted")))
    }

    async fn submit_utc_offset(&self, _user_key: &str, offset_seconds: i32) -> Result<String> {
        self.record(Call::UtcOffset(offset_seconds));
        self.utc_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok("SUCCESS".to_string()))
    }

    async fn submit_report(&self, _user_key: &str, report: &Snapshot) -> Result<ReportResponse> {
        self.record(Call::Report);
        self.reports.lock().push(report.clone());
        self.report_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("connection refused")))
    }

    async fn submit_fingerprint(&self, _user_key: &str, fingerprint: &Fingerprint) -> Result<()> {
        self.record(Call::Fingerprint);
        if self.fail_fingerprint.load(Ordering::SeqCst) {
            bail!("fingerprint endpoint unavailable");
        }
        self.fingerprints.lock().push(fingerprint.clone());
        Ok(())
    }

    async fn heartbeat(&self, _user_key: &str) -> Result<HeartbeatResponse> {
        self.record(Call::Heartbeat);
        self.heartbeat_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(HeartbeatResponse::default()))
    }

    async fn request_partner(&self, _user_key: &str) -> Result<PartnerResponse> {
        self.record(Call::Partner);
        self.partner_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(PartnerResponse::default()))
    }

    async fn fetch_model(&self, dest: &Path) -> Result<u64> {
        self.record(Call::FetchModel);
        let model = self.model.lock().clone();
        tokio::fs::write(dest, &model).await?;
        Ok(model.len() as u64)
    }

    async fn separate(&self, _user_key: &str) -> Result<()> {
        self.record(Call::Separate);
        if self.fail_separate.load(Ordering::SeqCst) {
            bail!("separate rejected");
        }
        Ok(())
    }
}
