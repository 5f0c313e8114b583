//! Gateway configuration file.
//!
//! Every field has a serde default so a partial (or missing) file still
//! yields a runnable configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_BYTES: u64 = 25 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_relay_bind")]
    pub relay_bind: String,
    #[serde(default)]
    pub relay_bind_tls: String,
    #[serde(default)]
    pub relay_tls_cert_path: String,
    #[serde(default)]
    pub relay_tls_key_path: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub blind_peer: BlindPeerConfig,
    #[serde(default)]
    pub escrow: EscrowConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            relay_bind: default_relay_bind(),
            relay_bind_tls: String::new(),
            relay_tls_cert_path: String::new(),
            relay_tls_key_path: String::new(),
            data_dir: default_data_dir(),
            blind_peer: BlindPeerConfig::default(),
            escrow: EscrowConfig::default(),
            dispatcher: DispatcherConfig::default(),
            tokens: TokenConfig::default(),
            registration: RegistrationConfig::default(),
            host: HostConfig::default(),
            lease: LeaseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlindPeerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub storage_dir: Option<String>,
    /// Raw value; read through `max_bytes()`, which applies the fallback.
    #[serde(default)]
    pub max_bytes: Option<Value>,
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
    #[serde(default = "default_dedupe_batch_size")]
    pub dedupe_batch_size: usize,
    #[serde(default = "default_stale_core_ttl_ms")]
    pub stale_core_ttl_ms: u64,
    #[serde(default)]
    pub trusted_peers_persist_path: Option<String>,
}

impl Default for BlindPeerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage_dir: None,
            max_bytes: None,
            gc_interval_ms: default_gc_interval_ms(),
            dedupe_batch_size: default_dedupe_batch_size(),
            stale_core_ttl_ms: default_stale_core_ttl_ms(),
            trusted_peers_persist_path: None,
        }
    }
}

impl BlindPeerConfig {
    pub fn max_bytes(&self) -> u64 {
        match self.max_bytes.as_ref().and_then(|v| v.as_f64()) {
            Some(n) if n.is_finite() && n > 0.0 => n as u64,
            _ => DEFAULT_MAX_BYTES,
        }
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1000))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowConfig {
    #[serde(default)]
    pub tls: EscrowTlsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowTlsConfig {
    #[serde(default)]
    pub ca_path: Option<String>,
    #[serde(default)]
    pub client_cert_path: Option<String>,
    #[serde(default)]
    pub client_key_path: Option<String>,
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,
}

impl Default for EscrowTlsConfig {
    fn default() -> Self {
        Self {
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            reject_unauthorized: true,
        }
    }
}

impl EscrowTlsConfig {
    pub fn is_configured(&self) -> bool {
        self.ca_path.is_some() || self.client_cert_path.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent_jobs_per_peer")]
    pub max_concurrent_jobs_per_peer: u32,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_breaker_duration_ms")]
    pub circuit_breaker_duration_ms: u64,
    #[serde(default = "default_in_flight_weight")]
    pub in_flight_weight: f64,
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
    #[serde(default = "default_failure_weight")]
    pub failure_weight: f64,
    #[serde(default = "default_reassign_on_lag_blocks")]
    pub reassign_on_lag_blocks: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent_jobs_per_peer: default_max_concurrent_jobs_per_peer(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_duration_ms: default_circuit_breaker_duration_ms(),
            in_flight_weight: default_in_flight_weight(),
            latency_weight: default_latency_weight(),
            failure_weight: default_failure_weight(),
            reassign_on_lag_blocks: default_reassign_on_lag_blocks(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    #[serde(default = "default_token_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_token_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationConfig {
    #[serde(default = "default_registration_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_registration_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(default = "default_telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,
    #[serde(default)]
    pub verify_signatures: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: default_telemetry_interval_ms(),
            verify_signatures: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseConfig {
    #[serde(default = "default_lease_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_true")]
    pub wipe_on_shutdown: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_lease_sweep_interval_secs(),
            wipe_on_shutdown: true,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_relay_bind() -> String {
    "0.0.0.0:7447".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

pub fn default_config_path() -> PathBuf {
    "./gateway.json".into()
}

fn default_true() -> bool {
    true
}

fn default_gc_interval_ms() -> u64 {
    300_000
}

fn default_dedupe_batch_size() -> usize {
    100
}

fn default_stale_core_ttl_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_max_concurrent_jobs_per_peer() -> u32 {
    10
}

fn default_circuit_breaker_threshold() -> u32 {
    3
}

fn default_circuit_breaker_duration_ms() -> u64 {
    30_000
}

fn default_in_flight_weight() -> f64 {
    25.0
}

fn default_latency_weight() -> f64 {
    1.0
}

fn default_failure_weight() -> f64 {
    500.0
}

fn default_reassign_on_lag_blocks() -> u64 {
    500
}

fn default_token_ttl_secs() -> u64 {
    60 * 60
}

fn default_registration_ttl_secs() -> u64 {
    5 * 60
}

fn default_telemetry_interval_ms() -> u64 {
    5_000
}

fn default_lease_sweep_interval_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(cfg)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{load_config, save_config, Config, DEFAULT_MAX_BYTES};
    use serde_json::json;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg: Config = serde_json::from_value(json!({})).expect("config");
        assert!(!cfg.blind_peer.enabled);
        assert!(cfg.blind_peer.storage_dir.is_none());
        assert_eq!(cfg.blind_peer.max_bytes(), DEFAULT_MAX_BYTES);
        assert_eq!(cfg.blind_peer.gc_interval_ms, 300_000);
        assert_eq!(cfg.blind_peer.dedupe_batch_size, 100);
        assert_eq!(cfg.blind_peer.stale_core_ttl_ms, 604_800_000);
        assert!(cfg.escrow.tls.reject_unauthorized);
        assert!(!cfg.dispatcher.enabled);
    }

    #[test]
    fn default_matches_empty_file() {
        let parsed: Config = serde_json::from_value(json!({})).expect("config");
        let parsed = serde_json::to_value(parsed).expect("parsed json");
        assert_eq!(serde_json::to_value(Config::default()).expect("default json"), parsed);
    }

    #[test]
    fn invalid_max_bytes_falls_back() {
        for raw in [json!(-5), json!(0), json!("lots"), json!(null)] {
            let cfg: Config = serde_json::from_value(json!({"blindPeer": {"maxBytes": raw}})).expect("config");
            assert_eq!(cfg.blind_peer.max_bytes(), DEFAULT_MAX_BYTES);
        }
        let cfg: Config = serde_json::from_value(json!({"blindPeer": {"maxBytes": 1024}})).expect("config");
        assert_eq!(cfg.blind_peer.max_bytes(), 1024);
    }

    #[test]
    fn camel_case_sections_parse() {
        let cfg: Config = serde_json::from_value(json!({
            "dispatcher": {"enabled": true, "circuitBreakerThreshold": 2, "latencyWeight": 2.5},
            "escrow": {"tls": {"caPath": "/ca.pem", "rejectUnauthorized": false}},
        }))
        .expect("config");
        assert!(cfg.dispatcher.enabled);
        assert_eq!(cfg.dispatcher.circuit_breaker_threshold, 2);
        assert_eq!(cfg.dispatcher.latency_weight, 2.5);
        assert_eq!(cfg.dispatcher.max_concurrent_jobs_per_peer, 10);
        assert_eq!(cfg.escrow.tls.ca_path.as_deref(), Some("/ca.pem"));
        assert!(!cfg.escrow.tls.reject_unauthorized);
    }

    #[test]
    fn missing_file_is_default_and_save_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("gateway.json");
        let cfg = load_config(&path).expect("load default");
        assert_eq!(cfg.relay_bind, "0.0.0.0:7447");
        save_config(&path, &cfg).expect("save");
        assert_eq!(load_config(&path).expect("reload").bind, cfg.bind);
    }
}
