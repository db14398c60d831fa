use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::identity::Identity;
use crate::measure::Measurements;
use crate::netinfo::NetworkContext;

/// UI-visible client status.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientStatus {
    Starting,
    Paused,
    Analyzing { bytes_per_sec: f64 },
    Retrying { attempt: u32 },
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Paused => write!(f, "paused"),
            Self::Analyzing { bytes_per_sec } => {
                write!(f, "analyzing ({:.1} KB/s)", bytes_per_sec / 1000.0)
            }
            Self::Retrying { attempt } => write!(f, "retrying upload (attempt {attempt})"),
        }
    }
}

/// Bytes counted since the previous reset and the time they span.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteWindow {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl ByteWindow {
    /// Throughput over the window; zero for an empty span.
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Pending measurements drained for one upload window.
#[derive(Debug, Clone)]
pub struct DrainedWindow {
    pub measurements: Measurements,
    pub elapsed: Duration,
}

/// Server-directed changes applied in one critical section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directives {
    pub quit: bool,
    pub fast_arp_scan: bool,
    pub whitelist: Option<Vec<String>>,
}

/// Mutable fields, all guarded by one lock.
struct Inner {
    inspecting: bool,
    byte_count: u64,
    byte_window_start: Instant,
    device_whitelist: Vec<String>,
    quit: bool,
    fast_arp_scan: bool,
    status: ClientStatus,
    pending: Measurements,
    window_start: Instant,
}

/// Process-wide run state shared by every worker.
///
/// Identity and network context are fixed at construction. Everything else
/// lives behind a single mutex; any read that must be consistent with a write
/// happens inside one method, under one acquisition.
pub struct RunState {
    identity: Identity,
    network: NetworkContext,
    raspberry_pi_mode: bool,
    inner: Mutex<Inner>,
    quit_notify: Notify,
    writer_taken: AtomicBool,
}

impl RunState {
    pub fn new(
        identity: Identity,
        network: NetworkContext,
        raspberry_pi_mode: bool,
        inspecting: bool,
    ) -> Self {
        let now = Instant::now();

        Self {
            identity,
            network,
            raspberry_pi_mode,
            inner: Mutex::new(Inner {
                inspecting,
                byte_count: 0,
                byte_window_start: now,
                device_whitelist: Vec::new(),
                quit: false,
                fast_arp_scan: false,
                status: ClientStatus::Starting,
                pending: Measurements::default(),
                window_start: now,
            }),
            quit_notify: Notify::new(),
            writer_taken: AtomicBool::new(false),
        }
    }

    pub fn user_key(&self) -> &str {
        &self.identity.user_key
    }

    pub fn secret_salt(&self) -> &str {
        &self.identity.secret_salt
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn network(&self) -> &NetworkContext {
        &self.network
    }

    pub fn raspberry_pi_mode(&self) -> bool {
        self.raspberry_pi_mode
    }

    pub fn is_inspecting(&self) -> bool {
        self.inner.lock().inspecting
    }

    pub fn set_inspecting(&self, inspecting: bool) {
        self.inner.lock().inspecting = inspecting;
    }

    /// Counts bytes seen by packet processing.
    pub fn add_bytes(&self, n: u64) {
        let mut inner = self.inner.lock();
        inner.byte_count = inner.byte_count.saturating_add(n);
    }

    /// Reads and resets the byte counter and its window start together.
    pub fn take_byte_count(&self) -> ByteWindow {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let window = ByteWindow {
            bytes: inner.byte_count,
            elapsed: now.saturating_duration_since(inner.byte_window_start),
        };
        inner.byte_count = 0;
        inner.byte_window_start = now;
        window
    }

    /// Gives packet processing mutable access to the pending measurements.
    pub fn with_pending<R>(&self, f: impl FnOnce(&mut Measurements) -> R) -> R {
        f(&mut self.inner.lock().pending)
    }

    /// Drains pending measurements if the window spans at least `min`.
    ///
    /// A shorter window leaves the pending data in place for the next one.
    pub fn take_window(&self, min: Duration) -> Option<DrainedWindow> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let elapsed = now.saturating_duration_since(inner.window_start);
        if elapsed < min {
            return None;
        }

        inner.window_start = now;
        Some(DrainedWindow {
            measurements: std::mem::take(&mut inner.pending),
            elapsed,
        })
    }

    /// Drops pending measurements and the byte counter while paused.
    pub fn clear_pending(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.pending = Measurements::default();
        inner.window_start = now;
        inner.byte_count = 0;
        inner.byte_window_start = now;
    }

    pub fn device_whitelist(&self) -> Vec<String> {
        self.inner.lock().device_whitelist.clone()
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.lock().status.clone()
    }

    /// True while a quit directive is outstanding.
    pub fn quit_requested(&self) -> bool {
        self.inner.lock().quit
    }

    /// Observes and clears the quit flag.
    pub fn take_quit(&self) -> bool {
        std::mem::take(&mut self.inner.lock().quit)
    }

    /// Observes and clears the fast ARP scan flag.
    pub fn take_fast_arp_scan(&self) -> bool {
        std::mem::take(&mut self.inner.lock().fast_arp_scan)
    }

    /// Resolves once a quit directive has been applied.
    pub async fn quit_signalled(&self) {
        self.quit_notify.notified().await;
    }

    /// Hands out the only writer for server-directed fields.
    pub fn take_directive_writer(self: &Arc<Self>) -> Option<DirectiveWriter> {
        if self.writer_taken.swap(true, Ordering::AcqRel) {
            return None;
        }

        Some(DirectiveWriter {
            state: Arc::clone(self),
        })
    }
}

/// Exclusive writer of `quit`, `fast_arp_scan`, the device whitelist and
/// the client status. Not cloneable; at most one exists per [`RunState`].
pub struct DirectiveWriter {
    state: Arc<RunState>,
}

impl DirectiveWriter {
    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// Applies server directives. Quit is ignored in Raspberry Pi mode.
    /// Returns true when a quit was recorded.
    pub fn apply(&self, directives: &Directives) -> bool {
        let quit = directives.quit && !self.state.raspberry_pi_mode;

        {
            let mut inner = self.state.inner.lock();
            if quit {
                inner.quit = true;
            }
            if directives.fast_arp_scan {
                inner.fast_arp_scan = true;
            }
            if let Some(whitelist) = &directives.whitelist {
                inner.device_whitelist = whitelist.clone();
            }
        }

        if quit {
            self.state.quit_notify.notify_one();
        }

        quit
    }

    pub fn set_status(&self, status: ClientStatus) {
        self.state.inner.lock().status = status;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::measure::{DnsKey, FlowKey};

    pub(crate) fn test_state(raspberry_pi_mode: bool) -> Arc<RunState> {
        Arc::new(RunState::new(
            Identity {
                user_key: "abcd1234efgh5678".to_string(),
                secret_salt: "00112233445566778899aabbccddeeff".to_string(),
            },
            NetworkContext {
                interface: "eth0".to_string(),
                gateway_ip: Ipv4Addr::new(192, 168, 1, 1),
                host_ip: Ipv4Addr::new(192, 168, 1, 20),
                host_mac: "aa:bb:cc:dd:ee:ff".to_string(),
            },
            raspberry_pi_mode,
            true,
        ))
    }

    #[test]
    fn test_directive_writer_handed_out_once() {
        let state = test_state(false);
        assert!(state.take_directive_writer().is_some());
        assert!(state.take_directive_writer().is_none());
    }

    #[test]
    fn test_apply_quit_and_whitelist() {
        let state = test_state(false);
        let writer = state.take_directive_writer().expect("writer");

        let quit = writer.apply(&Directives {
            quit: true,
            fast_arp_scan: false,
            whitelist: Some(vec!["A".to_string(), "B".to_string()]),
        });

        assert!(quit);
        assert!(state.quit_requested());
        assert_eq!(state.device_whitelist(), vec!["A", "B"]);
    }

    #[test]
    fn test_raspberry_pi_mode_ignores_quit() {
        let state = test_state(true);
        let writer = state.take_directive_writer().expect("writer");

        let quit = writer.apply(&Directives {
            quit: true,
            fast_arp_scan: true,
            whitelist: Some(vec!["A".to_string()]),
        });

        assert!(!quit);
        assert!(!state.quit_requested());
        assert!(state.take_fast_arp_scan());
        assert_eq!(state.device_whitelist(), vec!["A"]);
    }

    #[test]
    fn test_take_flags_clear_them() {
        let state = test_state(false);
        let writer = state.take_directive_writer().expect("writer");
        writer.apply(&Directives {
            quit: true,
            fast_arp_scan: true,
            whitelist: None,
        });

        assert!(state.take_quit());
        assert!(!state.take_quit());
        assert!(state.take_fast_arp_scan());
        assert!(!state.take_fast_arp_scan());
    }

    #[test]
    fn test_whitelist_untouched_without_directive() {
        let state = test_state(false);
        let writer = state.take_directive_writer().expect("writer");
        writer.apply(&Directives {
            whitelist: Some(vec!["A".to_string()]),
            ..Default::default()
        });
        writer.apply(&Directives::default());
        assert_eq!(state.device_whitelist(), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_byte_count_resets_counter() {
        let state = test_state(false);
        state.add_bytes(1000);
        state.add_bytes(500);
        tokio::time::advance(Duration::from_secs(5)).await;

        let window = state.take_byte_count();
        assert_eq!(window.bytes, 1500);
        assert_eq!(window.elapsed, Duration::from_secs(5));
        assert_eq!(window.bytes_per_sec(), 300.0);

        state.add_bytes(7);
        assert_eq!(state.take_byte_count().bytes, 7);
    }

    #[test]
    fn test_byte_window_zero_elapsed() {
        let window = ByteWindow {
            bytes: 10,
            elapsed: Duration::ZERO,
        };
        assert_eq!(window.bytes_per_sec(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_window_keeps_pending() {
        let state = test_state(false);
        state.with_pending(|m| {
            m.record_dns(
                &DnsKey("s1".into(), "a.com".into(), "1.1.1.1".into(), 53),
                "dns",
            )
        });

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(state.take_window(Duration::from_secs(1)).is_none());

        tokio::time::advance(Duration::from_millis(600)).await;
        let window = state
            .take_window(Duration::from_secs(1))
            .expect("window long enough");
        assert_eq!(window.measurements.dns.len(), 1);
        assert_eq!(window.elapsed, Duration::from_millis(1100));
        assert!(state.with_pending(|m| m.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_pending_drops_data_and_bytes() {
        let state = test_state(false);
        state.add_bytes(42);
        state.with_pending(|m| {
            m.record_flow(
                &FlowKey("s1".into(), 1, "2.2.2.2".into(), 443, "tcp".into()),
                1,
                1,
                1.0,
            )
        });

        state.clear_pending();

        assert!(state.with_pending(|m| m.is_empty()));
        assert_eq!(state.take_byte_count().bytes, 0);
    }

    #[tokio::test]
    async fn test_quit_signalled_after_apply() {
        let state = test_state(false);
        let writer = state.take_directive_writer().expect("writer");
        writer.apply(&Directives {
            quit: true,
            ..Default::default()
        });

        tokio::time::timeout(Duration::from_secs(1), state.quit_signalled())
            .await
            .expect("quit notification");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ClientStatus::Paused.to_string(), "paused");
        assert_eq!(
            ClientStatus::Retrying { attempt: 2 }.to_string(),
            "retrying upload (attempt 2)"
        );
        assert_eq!(
            ClientStatus::Analyzing {
                bytes_per_sec: 2500.0
            }
            .to_string(),
            "analyzing (2.5 KB/s)"
        );
    }
}
