pub mod agent;
pub mod compute;
pub mod config;
pub mod export;
pub mod fingerprint;
pub mod identity;
pub mod measure;
pub mod migrate;
pub mod netinfo;
pub mod remote;
pub mod sink;
pub mod state;
pub mod upload;
pub mod version;
pub mod worker;
