use crate::measure::{DnsKey, FlowKey, ServiceRecord};

use super::snapshot::DecodedSnapshot;

/// A single measurement that cannot become a row.
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("{table}: undecodable key {key:?}: {source}")]
    BadKey {
        table: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{table}: {reason}")]
    Invalid { table: &'static str, reason: String },
}

impl RowError {
    pub fn table(&self) -> &'static str {
        match self {
            Self::BadKey { table, .. } | Self::Invalid { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRow {
    pub device_id: String,
    pub dhcp_hostname: String,
    pub device_ip: String,
    pub device_name: String,
    pub device_type: String,
    pub device_vendor: String,
    pub device_oui: String,
    /// User agents seen from the device, `|`-separated.
    pub user_agents: String,
    pub client_ts: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DnsRow {
    pub user_key: String,
    pub device_id: String,
    pub ts: i64,
    pub ip: String,
    pub hostname: String,
    pub device_port: u16,
    pub data_source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowRow {
    pub user_key: String,
    pub device_id: String,
    pub device_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub protocol: String,
    pub inbound_byte_count: u64,
    pub outbound_byte_count: u64,
    pub total_byte_count: u64,
    pub ts: i64,
    pub ts_min: f64,
    pub ts_mod10: i64,
    pub ts_mod60: i64,
    pub ts_mod600: i64,
    pub ts_mod3600: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsRow {
    pub user_key: String,
    pub device_id: String,
    pub device_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub kind: String,
    pub version: String,
    pub sni: String,
    pub client_ts: i64,
}

/// All rows of one snapshot, formatted before anything is written.
#[derive(Debug, Default)]
pub struct RowBatch {
    pub devices: Vec<DeviceRow>,
    pub dns: Vec<DnsRow>,
    pub flows: Vec<FlowRow>,
    pub tls: Vec<TlsRow>,
    pub rejected: Vec<RowError>,
}

impl RowBatch {
    /// Builds the rows of a snapshot. Malformed entries land in `rejected`
    /// and do not affect the others.
    pub fn from_snapshot(user_key: &str, snapshot: &DecodedSnapshot) -> Self {
        let m = &snapshot.measurements;
        let client_ts = snapshot.meta.client_ts;
        let mut batch = Self::default();

        for (device_id, services) in &m.services {
            for service in services {
                match device_row(device_id, service, snapshot) {
                    Ok(row) => batch.devices.push(row),
                    Err(e) => batch.rejected.push(e),
                }
            }
        }

        for (key, sources) in &m.dns {
            match DnsKey::decode(key) {
                Ok(DnsKey(device_id, hostname, ip, device_port)) => {
                    for source in sources {
                        batch.dns.push(DnsRow {
                            user_key: user_key.to_string(),
                            device_id: device_id.clone(),
                            ts: client_ts,
                            ip: ip.clone(),
                            hostname: hostname.clone(),
                            device_port,
                            data_source: source.clone(),
                        });
                    }
                }
                Err(source) => batch.rejected.push(RowError::BadKey {
                    table: "dns",
                    key: key.clone(),
                    source,
                }),
            }
        }

        for (key, stats) in &m.flows {
            let FlowKey(device_id, device_port, remote_ip, remote_port, protocol) =
                match FlowKey::decode(key) {
                    Ok(k) => k,
                    Err(source) => {
                        batch.rejected.push(RowError::BadKey {
                            table: "flows",
                            key: key.clone(),
                            source,
                        });
                        continue;
                    }
                };

            let ts_min = stats.internal_flow_ts_min;
            if !ts_min.is_finite() || ts_min < 0.0 {
                batch.rejected.push(RowError::Invalid {
                    table: "flows",
                    reason: format!("flow {key} has invalid start time {ts_min}"),
                });
                continue;
            }

            let ts = ts_min as i64;
            batch.flows.push(FlowRow {
                user_key: user_key.to_string(),
                device_id,
                device_port,
                remote_ip,
                remote_port,
                protocol,
                inbound_byte_count: stats.inbound_byte_count,
                outbound_byte_count: stats.outbound_byte_count,
                total_byte_count: stats
                    .inbound_byte_count
                    .saturating_add(stats.outbound_byte_count),
                ts,
                ts_min,
                ts_mod10: ts % 10,
                ts_mod60: ts % 60,
                ts_mod600: ts % 600,
                ts_mod3600: ts % 3600,
            });
        }

        for record in &m.tls {
            if record.device_id.is_empty() {
                batch.rejected.push(RowError::Invalid {
                    table: "tls",
                    reason: format!("record from {} has no device id", record.remote_ip),
                });
                continue;
            }

            batch.tls.push(TlsRow {
                user_key: user_key.to_string(),
                device_id: record.device_id.clone(),
                device_port: record.device_port,
                remote_ip: record.remote_ip.clone(),
                remote_port: record.remote_port,
                kind: record.kind.clone(),
                version: record.version.clone().unwrap_or_default(),
                sni: record.sni.clone().unwrap_or_default(),
                client_ts: record.client_ts,
            });
        }

        batch
    }

    /// Number of rows that will be written.
    pub fn row_count(&self) -> usize {
        self.devices.len() + self.dns.len() + self.flows.len() + self.tls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}

fn device_row(
    device_id: &str,
    service: &ServiceRecord,
    snapshot: &DecodedSnapshot,
) -> Result<DeviceRow, RowError> {
    if device_id.is_empty() {
        return Err(RowError::Invalid {
            table: "devices",
            reason: "service record without device id".to_string(),
        });
    }

    let m = &snapshot.measurements;
    let host = service.host.clone().unwrap_or_default();

    let dhcp_hostname = m
        .dhcp
        .get(device_id)
        .and_then(|d| d.get("hostname"))
        .and_then(|h| h.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| host.clone());

    let device_oui = m
        .devices
        .get(device_id)
        .and_then(|d| d.get("oui"))
        .and_then(|o| o.as_str())
        .unwrap_or_default()
        .to_string();

    let user_agents = m
        .user_agents
        .get(device_id)
        .map(|uas| uas.iter().cloned().collect::<Vec<_>>().join("|"))
        .unwrap_or_default();

    Ok(DeviceRow {
        device_id: device_id.to_string(),
        dhcp_hostname,
        device_ip: host,
        device_name: service.model_name.clone().unwrap_or_default(),
        device_type: service.upnp_device_type.clone().unwrap_or_default(),
        device_vendor: service.manufacturer.clone().unwrap_or_default(),
        device_oui,
        user_agents,
        client_ts: snapshot.meta.client_ts,
    })
}
