use std::path::Path;

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::remote::RemoteService;

/// Stable client identity persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_key: String,
    pub secret_salt: String,
}

impl Identity {
    /// Loads the identity file, registering a new identity if it is absent.
    pub async fn load_or_register<R: RemoteService>(path: &Path, remote: &R) -> Result<Self> {
        if let Some(identity) = Self::load(path)? {
            return Ok(identity);
        }

        let user_key = remote
            .generate_user_key()
            .await
            .context("registering new user key")?
            .replace('-', "");

        let identity = Self {
            user_key,
            secret_salt: generate_salt(),
        };
        identity.save(path)?;

        info!(
            user_key = %pretty_user_key(&identity.user_key),
            path = %path.display(),
            "registered new identity",
        );

        Ok(identity)
    }

    /// Reads the identity file; `None` if it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading identity {}", path.display()))
            }
        };

        let mut identity: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing identity {}", path.display()))?;
        identity.user_key = identity.user_key.replace('-', "");

        Ok(Some(identity))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let data = serde_json::to_vec_pretty(self).context("serializing identity")?;
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
    }

    /// Pseudonymous id of a device as seen by this client.
    pub fn device_id(&self, mac: &str) -> String {
        device_id(mac, &self.secret_salt)
    }
}

/// `"s"` followed by the first 10 hex chars of sha256(normalized mac + salt).
pub fn device_id(mac: &str, salt: &str) -> String {
    let normalized = mac.to_lowercase().replace(':', "");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("s{}", &digest[..10])
}

/// User key grouped in blocks of four for display.
pub fn pretty_user_key(user_key: &str) -> String {
    let chars: Vec<char> = user_key.chars().collect();
    chars
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

fn generate_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
