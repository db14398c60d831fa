//! Build-time version info, injected via build.rs.

/// Release version string (set at build time).
pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

/// Git commit hash (set at build time via env, or "unknown").
pub fn git_commit() -> &'static str {
    option_env!("GIT_COMMIT").unwrap_or("unknown")
}

/// Full version string with platform info.
pub fn full() -> String {
    format!(
        "{} (commit: {}, {}/{})",
        RELEASE,
        git_commit(),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}

/// Version string reported to the coordination service with each window.
pub fn client_version() -> String {
    format!("iotscope/{RELEASE}")
}
