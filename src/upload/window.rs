use chrono::Utc;

use crate::measure::Measurements;
use crate::sink::snapshot::{Snapshot, WindowMeta};
use crate::state::DrainedWindow;
use crate::version;

/// One reporting window: the drained measurements plus the scalars that
/// describe them. Built once per cycle and consumed by the report.
#[derive(Debug, Clone)]
pub struct UploadWindow {
    pub meta: WindowMeta,
    pub measurements: Measurements,
}

impl UploadWindow {
    /// Closes a drained window at the current wall-clock time.
    pub fn new(drained: DrainedWindow, status_text: String) -> Self {
        Self::at(drained, status_text, Utc::now().timestamp())
    }

    pub fn at(drained: DrainedWindow, status_text: String, client_ts: i64) -> Self {
        Self {
            meta: WindowMeta {
                client_version: version::client_version(),
                duration: drained.elapsed.as_secs_f64(),
                client_ts,
                client_status_text: status_text,
            },
            measurements: drained.measurements,
        }
    }

    pub fn to_snapshot(&self) -> Result<Snapshot, serde_json::Error> {
        Snapshot::encode(&self.meta, &self.measurements)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::measure::DnsKey;
    use crate::sink::snapshot::{CLIENT_TS_FIELD, DNS_FIELD, DURATION_FIELD, STATUS_TEXT_FIELD};

    #[test]
    fn test_window_snapshot_carries_scalars() {
        let mut measurements = Measurements::default();
        measurements.record_dns(
            &DnsKey("s1".into(), "example.com".into(), "1.2.3.4".into(), 53),
            "dns",
        );

        let window = UploadWindow::at(
            DrainedWindow {
                measurements,
                elapsed: Duration::from_millis(5500),
            },
            "analyzing (1.0 KB/s)".to_string(),
            1_700_000_000,
        );
        let snapshot = window.to_snapshot().expect("encode");

        assert_eq!(snapshot.get(DURATION_FIELD), Some("5.5"));
        assert_eq!(snapshot.get(CLIENT_TS_FIELD), Some("1700000000"));
        assert_eq!(
            snapshot.get(STATUS_TEXT_FIELD),
            Some("analyzing (1.0 KB/s)")
        );
        assert!(snapshot
            .get(DNS_FIELD)
            .expect("dns field")
            .contains("example.com"));

        let decoded = snapshot.decode().expect("decode");
        assert_eq!(decoded.meta, window.meta);
        assert_eq!(decoded.measurements, window.measurements);
    }
}
