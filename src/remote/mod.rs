#[cfg(test)]
pub(crate) mod fake;
pub mod types;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::ServerConfig;
use crate::sink::snapshot::Snapshot;

pub use types::{
    Fingerprint, HeartbeatResponse, PartnerResponse, PeerAssignment, ReportResponse,
    ACTION_FAST_ARP_DISCOVERY, ACTION_QUIT,
};

/// Callback type for recording remote request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Coordination service API.
pub trait RemoteService: Send + Sync {
    /// Request a fresh user key.
    fn generate_user_key(&self) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Push the client's UTC offset; returns the trimmed acknowledgement text.
    fn submit_utc_offset(
        &self,
        user_key: &str,
        offset_seconds: i32,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Submit one report window.
    fn submit_report(
        &self,
        user_key: &str,
        report: &Snapshot,
    ) -> impl std::future::Future<Output = Result<ReportResponse>> + Send;

    /// Submit a fingerprint vector. The reply is not interpreted.
    fn submit_fingerprint(
        &self,
        user_key: &str,
        fingerprint: &Fingerprint,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Announce availability for secure computation.
    fn heartbeat(
        &self,
        user_key: &str,
    ) -> impl std::future::Future<Output = Result<HeartbeatResponse>> + Send;

    /// Ask the server for one computation partner.
    fn request_partner(
        &self,
        user_key: &str,
    ) -> impl std::future::Future<Output = Result<PartnerResponse>> + Send;

    /// Stream the computation payload into `dest`; returns the byte count.
    fn fetch_model(&self, dest: &Path) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Tell the server this client is ready for reassignment.
    fn separate(&self, user_key: &str) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// HTTP client for the coordination service.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    compression: String,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new coordination service client.
    pub fn new(cfg: &ServerConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            compression: cfg.compression.clone(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (endpoint_name, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and fail on transport errors or non-2xx replies.
    async fn send(
        &self,
        endpoint: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let start = Instant::now();

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.record_request(endpoint, "error", start.elapsed());
                return Err(e).with_context(|| format!("requesting {endpoint}"));
            }
        };

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            bail!(
                "unexpected status {} from {}: {}",
                status_code,
                endpoint,
                body.trim()
            );
        }

        self.record_request(endpoint, "success", start.elapsed());

        Ok(response)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
    ) -> Result<T> {
        let request = self
            .http
            .post(self.url(path))
            .header("Accept", "application/json");

        self.send(endpoint, request)
            .await?
            .json()
            .await
            .with_context(|| format!("decoding response from {endpoint}"))
    }

    async fn get_text(&self, endpoint: &'static str, path: &str) -> Result<String> {
        let text = self
            .send(endpoint, self.http.get(self.url(path)))
            .await?
            .text()
            .await
            .with_context(|| format!("reading response from {endpoint}"))?;

        Ok(text.trim().to_string())
    }
}

impl RemoteService for Client {
    async fn generate_user_key(&self) -> Result<String> {
        debug!("requesting new user key");

        let key = self
            .get_text("generate_user_key", "/generate_user_key")
            .await?;

        if key.is_empty() {
            bail!("empty user key from server");
        }

        Ok(key)
    }

    async fn submit_utc_offset(&self, user_key: &str, offset_seconds: i32) -> Result<String> {
        self.get_text(
            "submit_utc_offset",
            &format!("/submit_utc_offset/{user_key}/{offset_seconds}"),
        )
        .await
    }

    async fn submit_report(&self, user_key: &str, report: &Snapshot) -> Result<ReportResponse> {
        let body = serde_json::to_vec(report).context("serializing report")?;
        let (body, encoding) = encode_body(body, &self.compression)?;

        let mut request = self
            .http
            .post(self.url(&format!("/submit_data/{user_key}")))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(body);

        if let Some(encoding) = encoding {
            request = request.header("Content-Encoding", encoding);
        }

        self.send("submit_data", request)
            .await?
            .json()
            .await
            .context("decoding report response")
    }

    async fn submit_fingerprint(&self, user_key: &str, fingerprint: &Fingerprint) -> Result<()> {
        let request = self
            .http
            .post(self.url(&format!("/submit_fingerprint/{user_key}")))
            .json(fingerprint);

        let response = self.send("submit_fingerprint", request).await?;
        // Drain body for connection reuse.
        let _ = response.bytes().await;

        Ok(())
    }

    async fn heartbeat(&self, user_key: &str) -> Result<HeartbeatResponse> {
        debug!("submitting heartbeat");
        self.post_json("heartbeat", &format!("/heartbeat/{user_key}"))
            .await
    }

    async fn request_partner(&self, user_key: &str) -> Result<PartnerResponse> {
        self.post_json("partner", &format!("/partner/{user_key}"))
            .await
    }

    async fn fetch_model(&self, dest: &Path) -> Result<u64> {
        let mut response = self.send("model", self.http.get(self.url("/model"))).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.context("reading model stream")? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing {}", dest.display()))?;
            written += chunk.len() as u64;
        }

        file.flush().await.context("flushing model file")?;

        Ok(written)
    }

    async fn separate(&self, user_key: &str) -> Result<()> {
        let request = self.http.post(self.url(&format!("/separate/{user_key}")));
        let response = self.send("separate", request).await?;
        let _ = response.bytes().await;

        Ok(())
    }
}

/// Compresses a report body, returning it with its `Content-Encoding`.
fn encode_body(body: Vec<u8>, algorithm: &str) -> Result<(Vec<u8>, Option<&'static str>)> {
    use std::io::Write;

    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    match algorithm {
        "none" | "" => Ok((body, None)),
        "gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body).context("gzip report body")?;
            Ok((encoder.finish().context("gzip report body")?, Some("gzip")))
        }
        "zlib" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body).context("zlib report body")?;
            Ok((encoder.finish().context("zlib report body")?, Some("deflate")))
        }
        "zstd" => {
            let encoded = zstd::encode_all(body.as_slice(), 0).context("zstd report body")?;
            Ok((encoded, Some("zstd")))
        }
        other => bail!("unsupported report compression: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &[u8] = br#"{"client_version":"iotscope/0.1.0","dns_dict":"{}"}"#;

    #[test]
    fn test_uncompressed_body_passes_through() {
        let (body, encoding) = encode_body(REPORT.to_vec(), "none").expect("none");
        assert_eq!(body, REPORT);
        assert_eq!(encoding, None);
    }

    #[test]
    fn test_gzip_body_decodes() {
        use std::io::Read;

        let (body, encoding) = encode_body(REPORT.to_vec(), "gzip").expect("gzip");
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(body.as_slice())
            .read_to_end(&mut out)
            .expect("gunzip");
        assert_eq!(out, REPORT);
        assert_eq!(encoding, Some("gzip"));
    }

    #[test]
    fn test_zlib_body_is_sent_as_deflate() {
        use std::io::Read;

        let (body, encoding) = encode_body(REPORT.to_vec(), "zlib").expect("zlib");
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(body.as_slice())
            .read_to_end(&mut out)
            .expect("inflate");
        assert_eq!(out, REPORT);
        assert_eq!(encoding, Some("deflate"));
    }

    #[test]
    fn test_zstd_body_decodes() {
        let (body, encoding) = encode_body(REPORT.to_vec(), "zstd").expect("zstd");
        assert_eq!(zstd::decode_all(body.as_slice()).expect("unzstd"), REPORT);
        assert_eq!(encoding, Some("zstd"));
    }

    #[test]
    fn test_unknown_compression_rejected() {
        let err = encode_body(REPORT.to_vec(), "brotli").unwrap_err();
        assert!(err.to_string().contains("unsupported report compression"));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let cfg = ServerConfig {
            base_url: "http://coord.local:8080/".to_string(),
            ..Default::default()
        };
        let client = Client::new(&cfg).expect("client");
        assert_eq!(
            client.url("/heartbeat/k"),
            "http://coord.local:8080/heartbeat/k"
        );
    }

    #[test]
    fn test_zero_timeout_falls_back() {
        let cfg = ServerConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(Client::new(&cfg).is_ok());
    }
}
