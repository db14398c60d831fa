//! Aggregated measurement dictionaries shared by the upload window, the
//! snapshot queue and the persistence rows.
//!
//! Composite keys are JSON arrays encoded as strings, so the dictionaries
//! serialize to plain JSON objects.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Key of a DNS observation: `[device_id, hostname, resolved_ip, device_port]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsKey(pub String, pub String, pub String, pub u16);

/// Key of a flow: `[device_id, device_port, remote_ip, remote_port, protocol]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowKey(pub String, pub u16, pub String, pub u16, pub String);

impl DnsKey {
    pub fn encode(&self) -> String {
        encode_key(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl FlowKey {
    pub fn encode(&self) -> String {
        encode_key(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

fn encode_key<T: Serialize>(key: &T) -> String {
    // Tuple structs of strings and integers always serialize.
    serde_json::to_string(key).unwrap_or_default()
}

/// Byte totals and time bounds of one flow within a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowStats {
    #[serde(default)]
    pub inbound_byte_count: u64,
    #[serde(default)]
    pub outbound_byte_count: u64,
    /// Unix seconds of the first packet.
    pub internal_flow_ts_min: f64,
    /// Unix seconds of the last packet.
    #[serde(default)]
    pub internal_flow_ts_max: f64,
}

/// One TLS client hello observed on the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsRecord {
    pub device_id: String,
    #[serde(default)]
    pub device_port: u16,
    pub remote_ip: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub sni: Option<String>,
    pub client_ts: i64,
}

/// A service announced by a device (UPnP/SSDP/mDNS discovery).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub upnp_device_type: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
}

/// Measurement dictionaries accumulated between two upload windows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    /// DNS observations, keyed by encoded [`DnsKey`], valued by data sources.
    pub dns: BTreeMap<String, BTreeSet<String>>,
    /// Flows keyed by encoded [`FlowKey`].
    pub flows: BTreeMap<String, FlowStats>,
    /// Device records by device id.
    pub devices: BTreeMap<String, serde_json::Value>,
    /// User-agent strings by device id.
    pub user_agents: BTreeMap<String, BTreeSet<String>>,
    /// DHCP hostname and vendor hints by device id.
    pub dhcp: BTreeMap<String, serde_json::Value>,
    /// OS resolver hints by device id.
    pub resolvers: BTreeMap<String, serde_json::Value>,
    /// TLS client hellos in arrival order.
    pub tls: Vec<TlsRecord>,
    /// Discovered services by device id.
    pub services: BTreeMap<String, Vec<ServiceRecord>>,
    /// Open ports found by SYN scanning, by device id.
    pub syn_scan: BTreeMap<String, BTreeSet<u16>>,
}

impl Measurements {
    pub fn is_empty(&self) -> bool {
        self.dns.is_empty()
            && self.flows.is_empty()
            && self.devices.is_empty()
            && self.user_agents.is_empty()
            && self.dhcp.is_empty()
            && self.resolvers.is_empty()
            && self.tls.is_empty()
            && self.services.is_empty()
            && self.syn_scan.is_empty()
    }

    pub fn record_dns(&mut self, key: &DnsKey, source: &str) {
        self.dns
            .entry(key.encode())
            .or_default()
            .insert(source.to_string());
    }

    /// Adds bytes to a flow, widening its time bounds to include `ts`.
    pub fn record_flow(&mut self, key: &FlowKey, inbound: u64, outbound: u64, ts: f64) {
        let stats = self.flows.entry(key.encode()).or_insert_with(|| FlowStats {
            internal_flow_ts_min: ts,
            internal_flow_ts_max: ts,
            ..Default::default()
        });
        stats.inbound_byte_count += inbound;
        stats.outbound_byte_count += outbound;
        stats.internal_flow_ts_min = stats.internal_flow_ts_min.min(ts);
        stats.internal_flow_ts_max = stats.internal_flow_ts_max.max(ts);
    }

    pub fn record_user_agent(&mut self, device_id: &str, user_agent: &str) {
        self.user_agents
            .entry(device_id.to_string())
            .or_default()
            .insert(user_agent.to_string());
    }

    pub fn record_service(&mut self, device_id: &str, service: ServiceRecord) {
        self.services
            .entry(device_id.to_string())
            .or_default()
            .push(service);
    }

    pub fn record_open_port(&mut self, device_id: &str, port: u16) {
        self.syn_scan
            .entry(device_id.to_string())
            .or_default()
            .insert(port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_key_encoding_is_json_array() {
        let key = DnsKey(
            "s0123456789".to_string(),
            "example.com".to_string(),
            "93.184.216.34".to_string(),
            53,
        );
        assert_eq!(
            key.encode(),
            r#"["s0123456789","example.com","93.184.216.34",53]"#
        );
        assert_eq!(DnsKey::decode(&key.encode()).expect("decode"), key);
    }

    #[test]
    fn test_flow_key_decode_rejects_wrong_arity() {
        assert!(FlowKey::decode(r#"["s1",443,"1.1.1.1"]"#).is_err());
        assert!(FlowKey::decode("not json").is_err());
    }

    #[test]
    fn test_record_flow_accumulates() {
        let key = FlowKey(
            "s1".to_string(),
            50000,
            "1.1.1.1".to_string(),
            443,
            "tcp".to_string(),
        );
        let mut m = Measurements::default();
        m.record_flow(&key, 100, 10, 1_700_000_010.0);
        m.record_flow(&key, 50, 5, 1_700_000_000.0);

        let stats = m.flows.get(&key.encode()).expect("flow recorded");
        assert_eq!(stats.inbound_byte_count, 150);
        assert_eq!(stats.outbound_byte_count, 15);
        assert_eq!(stats.internal_flow_ts_min, 1_700_000_000.0);
        assert_eq!(stats.internal_flow_ts_max, 1_700_000_010.0);
    }

    #[test]
    fn test_is_empty_tracks_every_dictionary() {
        let mut m = Measurements::default();
        assert!(m.is_empty());
        m.record_open_port("s1", 22);
        assert!(!m.is_empty());
    }

    #[test]
    fn test_tls_record_type_field_rename() {
        let json =
            r#"{"device_id":"s1","remote_ip":"1.2.3.4","type":"client_hello","client_ts":5}"#;
        let rec: TlsRecord = serde_json::from_str(json).expect("parse");
        assert_eq!(rec.kind, "client_hello");
        assert_eq!(rec.remote_port, 0);
        assert!(rec.sni.is_none());
    }
}
