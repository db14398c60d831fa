use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Reply to a report submission.
///
/// Each field is decoded on its own: a mistyped field reads as absent
/// instead of discarding the directives carried next to it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReportResponse {
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub client_action: Option<String>,
    /// Unix seconds of the last UI interaction; zero when unknown.
    #[serde(default, deserialize_with = "lenient")]
    pub ui_last_active_ts: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub inspected_devices: Option<Vec<String>>,
}

impl ReportResponse {
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("success")
    }

    /// The replacement whitelist; only a successful reply carries one.
    pub fn whitelist(&self) -> Option<&[String]> {
        if self.is_success() {
            self.inspected_devices.as_deref()
        } else {
            None
        }
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

/// Client action asking the process to exit.
pub const ACTION_QUIT: &str = "quit";

/// Client action asking for an immediate ARP sweep.
pub const ACTION_FAST_ARP_DISCOVERY: &str = "start_fast_arp_discovery";

/// Reply to a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub has_peer: bool,
    #[serde(default)]
    pub peer: Option<PeerAssignment>,
}

impl HeartbeatResponse {
    /// The assigned peer, if the server says there is one.
    pub fn assignment(&self) -> Option<&PeerAssignment> {
        if self.has_peer {
            self.peer.as_ref()
        } else {
            None
        }
    }
}

/// Rendezvous descriptor of the session this client was assigned to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PeerAssignment {
    pub address: String,
    /// Party index; validated against the world size before use.
    pub index: i64,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Reply to a partner request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PartnerResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub user_key: Option<String>,
}

/// Summary vector submitted by the fingerprint worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fingerprint {
    pub name: String,
    pub fingerprint: Vec<f64>,
}
