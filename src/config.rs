use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the iotscope client.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the identity file and per-process role markers.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Never self-terminate on server quit directives or UI inactivity.
    #[serde(default)]
    pub raspberry_pi_mode: bool,

    /// Initial value of the inspecting flag. Default: true.
    #[serde(default = "default_true")]
    pub start_inspecting: bool,

    /// Remote coordination service connection.
    #[serde(default)]
    pub server: ServerConfig,

    /// Report upload worker.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Secure-computation orchestrator.
    #[serde(default)]
    pub secure_compute: SecureComputeConfig,

    /// Fingerprint reporter.
    #[serde(default)]
    pub fingerprint: FingerprintConfig,

    /// Snapshot persistence sink.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Network context overrides.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Local status and metrics server.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Remote coordination service connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the coordination service.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_server_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Report body encoding (none, gzip, zstd, zlib). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,
}

/// Upload worker timing and retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Reporting cadence. Default: 5s.
    #[serde(default = "default_upload_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Re-check interval while inspection is paused. Default: 2s.
    #[serde(default = "default_two_seconds", with = "humantime_serde")]
    pub pause_poll_interval: Duration,

    /// Retry interval of the UTC offset handshake. Default: 2s.
    #[serde(default = "default_two_seconds", with = "humantime_serde")]
    pub init_retry_interval: Duration,

    /// Attempts per report before the cycle is abandoned. Default: 5.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after attempt i is `backoff_unit * (i+1)^2`. Default: 1s.
    #[serde(default = "default_one_second", with = "humantime_serde")]
    pub backoff_unit: Duration,

    /// Windows shorter than this are not reported. Default: 1s.
    #[serde(default = "default_one_second", with = "humantime_serde")]
    pub min_window: Duration,

    /// UI staleness threshold that triggers a quit. Default: 120s.
    #[serde(default = "default_ui_inactivity_timeout", with = "humantime_serde")]
    pub ui_inactivity_timeout: Duration,
}

/// Which lifecycle the "peer" role marker follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerMarkerPolicy {
    /// Keep volunteering after an assisted computation.
    #[default]
    Persist,
    /// Delete the marker once an assignment has been attempted.
    ConsumeOnAssignment,
}

/// Secure-computation orchestrator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SecureComputeConfig {
    /// Run the orchestrator. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cycle interval. Default: 5s.
    #[serde(default = "default_upload_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Poll interval while waiting for the store to become ready. Default: 2s.
    #[serde(default = "default_two_seconds", with = "humantime_serde")]
    pub store_poll_interval: Duration,

    /// Rendezvous address announced when initiating. Default: 127.0.0.1.
    #[serde(default = "default_initiator_address")]
    pub initiator_address: String,

    /// Agreed rendezvous port. Default: 47072.
    #[serde(default = "default_rendezvous_port")]
    pub rendezvous_port: u16,

    /// Peer marker lifecycle. Default: persist.
    #[serde(default)]
    pub peer_marker: PeerMarkerPolicy,

    /// External computation engine.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// External computation engine launch parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Executable implementing one party of the computation.
    #[serde(default)]
    pub program: String,

    /// Extra arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,

    /// Communication backend handed to the engine. Default: gloo.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Upper bound on one session. Default: 10m.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,
}

/// Fingerprint worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintConfig {
    /// Run the fingerprint worker. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Submission cadence. Default: 5s.
    #[serde(default = "default_upload_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Summary vector length. Default: 32.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

/// Snapshot persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Bounded snapshot queue capacity. Default: 256.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Consumer receive timeout. Default: 10s.
    #[serde(default = "default_receive_timeout", with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// Retry interval for schema creation. Default: 2s.
    #[serde(default = "default_two_seconds", with = "humantime_serde")]
    pub init_retry_interval: Duration,

    /// ClickHouse connection.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Native protocol address (host:port). Default: localhost:9000.
    #[serde(default = "default_clickhouse_endpoint")]
    pub endpoint: String,

    /// Target database. Default: "iotscope".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,
}

/// Network context overrides; unset fields are discovered at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    /// Interface carrying the default route.
    #[serde(default)]
    pub interface: Option<String>,

    /// Gateway address.
    #[serde(default)]
    pub gateway_ip: Option<Ipv4Addr>,

    /// Address of this host on the local network.
    #[serde(default)]
    pub host_ip: Option<Ipv4Addr>,

    /// MAC address of the default-route interface.
    #[serde(default)]
    pub host_mac: Option<String>,
}

/// Local status and metrics server.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: "127.0.0.1:9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".iotscope"),
        None => PathBuf::from(".iotscope"),
    }
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_server_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_upload_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_one_second() -> Duration {
    Duration::from_secs(1)
}

fn default_two_seconds() -> Duration {
    Duration::from_secs(2)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_ui_inactivity_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_initiator_address() -> String {
    "127.0.0.1".to_string()
}

fn default_rendezvous_port() -> u16 {
    47072
}

fn default_backend() -> String {
    "gloo".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_dimensions() -> usize {
    32
}

fn default_queue_capacity() -> usize {
    256
}

fn default_receive_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_clickhouse_endpoint() -> String {
    "localhost:9000".to_string()
}

fn default_database() -> String {
    "iotscope".to_string()
}

fn default_health_addr() -> String {
    "127.0.0.1:9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            raspberry_pi_mode: false,
            start_inspecting: true,
            server: ServerConfig::default(),
            upload: UploadConfig::default(),
            secure_compute: SecureComputeConfig::default(),
            fingerprint: FingerprintConfig::default(),
            persistence: PersistenceConfig::default(),
            network: NetworkConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_server_timeout(),
            compression: default_compression(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            interval: default_upload_interval(),
            pause_poll_interval: default_two_seconds(),
            init_retry_interval: default_two_seconds(),
            max_attempts: default_max_attempts(),
            backoff_unit: default_one_second(),
            min_window: default_one_second(),
            ui_inactivity_timeout: default_ui_inactivity_timeout(),
        }
    }
}

impl Default for SecureComputeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_upload_interval(),
            store_poll_interval: default_two_seconds(),
            initiator_address: default_initiator_address(),
            rendezvous_port: default_rendezvous_port(),
            peer_marker: PeerMarkerPolicy::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            backend: default_backend(),
            session_timeout: default_session_timeout(),
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_upload_interval(),
            dimensions: default_dimensions(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            receive_timeout: default_receive_timeout(),
            init_retry_interval: default_two_seconds(),
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: default_clickhouse_endpoint(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server.base_url.is_empty() {
            bail!("server.base_url is required");
        }

        if !self.server.base_url.starts_with("http://")
            && !self.server.base_url.starts_with("https://")
        {
            bail!("server.base_url must be an http(s) URL");
        }

        match self.server.compression.as_str() {
            "none" | "gzip" | "zstd" | "zlib" => {}
            other => bail!("invalid server.compression: {other}"),
        }

        if self.upload.interval.is_zero() {
            bail!("upload.interval must be positive");
        }

        if self.upload.max_attempts == 0 {
            bail!("upload.max_attempts must be positive");
        }

        if self.secure_compute.enabled {
            if self.secure_compute.interval.is_zero() {
                bail!("secure_compute.interval must be positive");
            }

            if self.secure_compute.engine.program.is_empty() {
                bail!("secure_compute.engine.program is required when enabled");
            }

            if self.secure_compute.rendezvous_port == 0 {
                bail!("secure_compute.rendezvous_port must be non-zero");
            }
        }

        if self.fingerprint.enabled {
            if self.fingerprint.interval.is_zero() {
                bail!("fingerprint.interval must be positive");
            }

            if self.fingerprint.dimensions == 0 {
                bail!("fingerprint.dimensions must be positive");
            }
        }

        if self.persistence.queue_capacity == 0 {
            bail!("persistence.queue_capacity must be positive");
        }

        if self.persistence.receive_timeout.is_zero() {
            bail!("persistence.receive_timeout must be positive");
        }

        if self.persistence.clickhouse.endpoint.is_empty() {
            bail!("persistence.clickhouse.endpoint is required");
        }

        Ok(())
    }

    /// Path of the persisted identity file.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }

    /// Root directory holding one role-marker directory per client process.
    pub fn marker_root(&self) -> PathBuf {
        self.data_dir.join("configs")
    }
}

impl ClickHouseConfig {
    /// Builds a clickhouse-rs compatible TCP DSN.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    pub fn dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.username.is_empty() {
            dsn.push_str(&self.username);
            if !self.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.endpoint);
        dsn.push('/');
        dsn.push_str(&self.database);
        dsn.push_str("?compression=lz4&pool_min=1&pool_max=3");

        dsn
    }
}
