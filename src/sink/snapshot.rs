use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::measure::Measurements;

pub const DNS_FIELD: &str = "dns_dict";
pub const FLOW_FIELD: &str = "flow_dict";
pub const DEVICE_FIELD: &str = "device_dict";
pub const USER_AGENT_FIELD: &str = "ua_dict";
pub const DHCP_FIELD: &str = "dhcp_dict";
pub const RESOLVER_FIELD: &str = "resolver_dict";
pub const TLS_FIELD: &str = "tls_dict_list";
pub const SERVICE_FIELD: &str = "netdisco_dict";
pub const SYN_SCAN_FIELD: &str = "syn_scan_dict";

pub const CLIENT_VERSION_FIELD: &str = "client_version";
pub const DURATION_FIELD: &str = "duration";
pub const CLIENT_TS_FIELD: &str = "client_ts";
pub const STATUS_TEXT_FIELD: &str = "client_status_text";

/// A snapshot field could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("field {field} is not valid JSON: {source}")]
    InvalidJson {
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("field {field} has invalid value {value:?}")]
    InvalidScalar { field: &'static str, value: String },
}

/// Scalar fields describing the window a snapshot was taken from.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowMeta {
    pub client_version: String,
    /// Window length in seconds.
    pub duration: f64,
    /// Unix seconds when the window was closed.
    pub client_ts: i64,
    pub client_status_text: String,
}

/// One aggregated window in wire form: a flat string map whose `_dict` and
/// `_dict_list` fields hold JSON documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, String>);

/// A snapshot with every field decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSnapshot {
    pub meta: WindowMeta,
    pub measurements: Measurements,
}

/// Whether a field carries a JSON document.
pub fn is_json_field(key: &str) -> bool {
    key.ends_with("_dict") || key.ends_with("_dict_list")
}

impl Snapshot {
    /// Encodes a window into wire form.
    pub fn encode(meta: &WindowMeta, m: &Measurements) -> Result<Self, serde_json::Error> {
        let mut fields = BTreeMap::new();

        fields.insert(DNS_FIELD.to_string(), serde_json::to_string(&m.dns)?);
        fields.insert(FLOW_FIELD.to_string(), serde_json::to_string(&m.flows)?);
        fields.insert(DEVICE_FIELD.to_string(), serde_json::to_string(&m.devices)?);
        fields.insert(
            USER_AGENT_FIELD.to_string(),
            serde_json::to_string(&m.user_agents)?,
        );
        fields.insert(DHCP_FIELD.to_string(), serde_json::to_string(&m.dhcp)?);
        fields.insert(
            RESOLVER_FIELD.to_string(),
            serde_json::to_string(&m.resolvers)?,
        );
        fields.insert(TLS_FIELD.to_string(), serde_json::to_string(&m.tls)?);
        fields.insert(SERVICE_FIELD.to_string(), serde_json::to_string(&m.services)?);
        fields.insert(SYN_SCAN_FIELD.to_string(), serde_json::to_string(&m.syn_scan)?);

        fields.insert(
            CLIENT_VERSION_FIELD.to_string(),
            meta.client_version.clone(),
        );
        fields.insert(DURATION_FIELD.to_string(), meta.duration.to_string());
        fields.insert(CLIENT_TS_FIELD.to_string(), meta.client_ts.to_string());
        fields.insert(
            STATUS_TEXT_FIELD.to_string(),
            meta.client_status_text.clone(),
        );

        Ok(Self(fields))
    }

    pub fn from_fields(fields: BTreeMap<String, String>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes every field. Any undecodable JSON field rejects the snapshot;
    /// absent dictionaries decode as empty.
    pub fn decode(&self) -> Result<DecodedSnapshot, SnapshotError> {
        for (key, value) in &self.0 {
            if is_json_field(key) {
                serde_json::from_str::<serde_json::Value>(value).map_err(|source| {
                    SnapshotError::InvalidJson {
                        field: key.clone(),
                        source,
                    }
                })?;
            }
        }

        let measurements = Measurements {
            dns: self.json_field(DNS_FIELD)?,
            flows: self.json_field(FLOW_FIELD)?,
            devices: self.json_field(DEVICE_FIELD)?,
            user_agents: self.json_field(USER_AGENT_FIELD)?,
            dhcp: self.json_field(DHCP_FIELD)?,
            resolvers: self.json_field(RESOLVER_FIELD)?,
            tls: self.json_field(TLS_FIELD)?,
            services: self.json_field(SERVICE_FIELD)?,
            syn_scan: self.json_field(SYN_SCAN_FIELD)?,
        };

        let client_ts = self
            .get(CLIENT_TS_FIELD)
            .ok_or(SnapshotError::MissingField(CLIENT_TS_FIELD))?;
        let client_ts = parse_timestamp(client_ts).ok_or_else(|| SnapshotError::InvalidScalar {
            field: CLIENT_TS_FIELD,
            value: client_ts.to_string(),
        })?;

        let duration = match self.get(DURATION_FIELD) {
            Some(raw) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite() && *d >= 0.0)
                .ok_or_else(|| SnapshotError::InvalidScalar {
                    field: DURATION_FIELD,
                    value: raw.to_string(),
                })?,
            None => 0.0,
        };

        Ok(DecodedSnapshot {
            meta: WindowMeta {
                client_version: self.get(CLIENT_VERSION_FIELD).unwrap_or_default().to_string(),
                duration,
                client_ts,
                client_status_text: self.get(STATUS_TEXT_FIELD).unwrap_or_default().to_string(),
            },
            measurements,
        })
    }

    fn json_field<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, SnapshotError> {
        match self.get(key) {
            Some(raw) => serde_json::from_str(raw).map_err(|source| SnapshotError::InvalidJson {
                field: key.to_string(),
                source,
            }),
            None => Ok(T::default()),
        }
    }
}

/// Accepts integral or fractional unix seconds.
fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(ts) = raw.parse::<i64>() {
        return Some(ts);
    }

    raw.parse::<f64>()
        .ok()
        .filter(|ts| ts.is_finite() && *ts >= 0.0)
        .map(|ts| ts as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::{DnsKey, FlowKey};

    fn meta() -> WindowMeta {
        WindowMeta {
            client_version: "iotscope/0.1.0".to_string(),
            duration: 5.25,
            client_ts: 1_700_000_000,
            client_status_text: "analyzing".to_string(),
        }
    }

    #[test]
    fn test_encode_marks_dictionaries_as_json() {
        let mut m = Measurements::default();
        m.record_dns(
            &DnsKey("s1".into(), "a.com".into(), "1.1.1.1".into(), 5353),
            "mdns",
        );

        let snapshot = Snapshot::encode(&meta(), &m).expect("encode");
        assert_eq!(
            snapshot.get(DNS_FIELD),
            Some(r#"{"[\"s1\",\"a.com\",\"1.1.1.1\",5353]":["mdns"]}"#)
        );
        assert_eq!(snapshot.get(TLS_FIELD), Some("[]"));
        assert_eq!(snapshot.get(CLIENT_TS_FIELD), Some("1700000000"));
        assert_eq!(snapshot.get(DURATION_FIELD), Some("5.25"));
        assert!(is_json_field(TLS_FIELD));
        assert!(!is_json_field(CLIENT_TS_FIELD));
    }

    #[test]
    fn test_decode_restores_window() {
        let mut m = Measurements::default();
        m.record_flow(
            &FlowKey("s1".into(), 5000, "8.8.8.8".into(), 53, "udp".into()),
            64,
            32,
            1_700_000_001.5,
        );
        m.record_user_agent("s1", "curl/8.0");

        let decoded = Snapshot::encode(&meta(), &m)
            .expect("encode")
            .decode()
            .expect("decode");
        assert_eq!(decoded.meta, meta());
        assert_eq!(decoded.measurements, m);
    }

    #[test]
    fn test_decode_rejects_bad_json_field() {
        let mut snapshot = Snapshot::encode(&meta(), &Measurements::default()).expect("encode");
        snapshot.insert(FLOW_FIELD, "{not json");

        match snapshot.decode() {
            Err(SnapshotError::InvalidJson { field, .. }) => assert_eq!(field, FLOW_FIELD),
            other => panic!("expected InvalidJson, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_bad_dict_field() {
        let mut snapshot = Snapshot::encode(&meta(), &Measurements::default()).expect("encode");
        snapshot.insert("arp_cache_dict", "[[[");

        assert!(matches!(
            snapshot.decode(),
            Err(SnapshotError::InvalidJson { .. })
        ));
    }

    #[test]
    fn test_decode_requires_client_ts() {
        let mut fields = BTreeMap::new();
        fields.insert(DNS_FIELD.to_string(), "{}".to_string());
        let snapshot = Snapshot::from_fields(fields);

        assert!(matches!(
            snapshot.decode(),
            Err(SnapshotError::MissingField(CLIENT_TS_FIELD))
        ));
    }

    #[test]
    fn test_decode_missing_dictionaries_are_empty() {
        let mut fields = BTreeMap::new();
        fields.insert(CLIENT_TS_FIELD.to_string(), "1700000000.9".to_string());
        let decoded = Snapshot::from_fields(fields).decode().expect("decode");

        assert!(decoded.measurements.is_empty());
        assert_eq!(decoded.meta.client_ts, 1_700_000_000);
        assert_eq!(decoded.meta.duration, 0.0);
    }

    #[test]
    fn test_decode_rejects_negative_duration() {
        let mut snapshot = Snapshot::encode(&meta(), &Measurements::default()).expect("encode");
        snapshot.insert(DURATION_FIELD, "-1");

        assert!(matches!(
            snapshot.decode(),
            Err(SnapshotError::InvalidScalar {
                field: DURATION_FIELD,
                ..
            })
        ));
    }

    #[test]
    fn test_snapshot_serializes_as_flat_map() {
        let mut snapshot = Snapshot::default();
        snapshot.insert(CLIENT_TS_FIELD, "1");
        assert_eq!(
            serde_json::to_string(&snapshot).expect("serialize"),
            r#"{"client_ts":"1"}"#
        );
    }
}
