//! # Process Configuration
//!
//! Two layers, same shape as the teacher's `yahoo_logic::config`: a small
//! `clap`-derived `Cli` covering process-level knobs (log directory/level,
//! shutdown grace period, where to find the endpoint file), and a
//! `serde_json`-deserialized `EndpointFile` describing the actual fleet of
//! listeners. CLI flags never merge field-by-field into the endpoint file —
//! unlike the teacher's single flat config, the endpoint list is too
//! structured for that, so `--config-path` is the one required bridge
//! between the two.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use forwarder::{
    BackendProtocol, EndpointConfig, ListenProtocol, LoadBalancingAlgorithm, ServerCertificate,
    TargetBackend, ZoneAffinityParams,
};

/// Process-level flags and environment variables.
#[derive(Parser, Debug, Clone)]
pub struct Cli {
    /// JSON file describing the endpoint fleet (see `EndpointFile`).
    #[clap(long, env = "FORWARDERD_CONFIG_PATH")]
    pub config_path: PathBuf,

    /// Directory log files are written to.
    #[clap(long, env = "FORWARDERD_LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,

    /// One of `debug`, `info`, `warn`, `error`.
    #[clap(long, env = "FORWARDERD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds `Orchestrator::stop` waits for in-flight connections to drain.
    #[clap(long, env = "FORWARDERD_SHUTDOWN_TIMEOUT_SECS", default_value = "30")]
    pub shutdown_timeout_secs: u64,
}

impl Cli {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// On-disk shape of `--config-path`. Mirrors `EndpointConfig` field for
/// field, but with certificate material as filesystem paths rather than
/// already-parsed `rustls` types, since this is the layer whose job it is
/// to read those paths.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EndpointFile {
    pub endpoints: Vec<EndpointSpec>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub protocol: ListenProtocolSpec,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default)]
    pub client_certificate_required: bool,
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub algorithm: LoadBalancingAlgorithmSpec,
    #[serde(default)]
    pub zone_affinity: Option<ZoneAffinityParams>,
    #[serde(default)]
    pub sticky_sessions: bool,
}

fn default_max_connections() -> usize {
    1000
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ListenProtocolSpec {
    Tcp,
    TlsTcp,
    Udp,
    Http,
}

impl From<ListenProtocolSpec> for ListenProtocol {
    fn from(value: ListenProtocolSpec) -> Self {
        match value {
            ListenProtocolSpec::Tcp => ListenProtocol::Tcp,
            ListenProtocolSpec::TlsTcp => ListenProtocol::TlsTcp,
            ListenProtocolSpec::Udp => ListenProtocol::Udp,
            ListenProtocolSpec::Http => ListenProtocol::Http,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalancingAlgorithmSpec {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    WeightedRoundRobin,
    Hash,
    ZoneAffinity,
}

impl From<LoadBalancingAlgorithmSpec> for LoadBalancingAlgorithm {
    fn from(value: LoadBalancingAlgorithmSpec) -> Self {
        match value {
            LoadBalancingAlgorithmSpec::RoundRobin => LoadBalancingAlgorithm::RoundRobin,
            LoadBalancingAlgorithmSpec::Random => LoadBalancingAlgorithm::Random,
            LoadBalancingAlgorithmSpec::LeastConnections => LoadBalancingAlgorithm::LeastConnections,
            LoadBalancingAlgorithmSpec::WeightedRoundRobin => LoadBalancingAlgorithm::WeightedRoundRobin,
            LoadBalancingAlgorithmSpec::Hash => LoadBalancingAlgorithm::Hash,
            LoadBalancingAlgorithmSpec::ZoneAffinity => LoadBalancingAlgorithm::ZoneAffinity,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub http_path: Option<String>,
    #[serde(default)]
    pub strip_path: bool,
    #[serde(default)]
    pub backend_tls: bool,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
}

fn default_backend_timeout_secs() -> u64 {
    30
}

/// Reads and parses `cli.config_path`, turning each `EndpointSpec` into a
/// fully-built `forwarder::EndpointConfig` — including loading and parsing
/// any TLS certificate material from disk, which is this binary's job per
/// the library's "never reads a filesystem path itself" boundary.
pub fn load_endpoints(cli: &Cli) -> Result<Vec<EndpointConfig>> {
    let raw = fs::read_to_string(&cli.config_path)
        .with_context(|| format!("reading endpoint config at {}", cli.config_path.display()))?;
    let file: EndpointFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing endpoint config at {}", cli.config_path.display()))?;

    file.endpoints.into_iter().map(build_endpoint).collect()
}

fn build_endpoint(spec: EndpointSpec) -> Result<EndpointConfig> {
    let server_certificate = match spec.protocol {
        ListenProtocolSpec::TlsTcp => Some(build_server_certificate(&spec)?),
        _ => None,
    };

    let targets = spec
        .targets
        .into_iter()
        .map(build_target)
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .map(std::sync::Arc::new)
        .collect();

    Ok(EndpointConfig {
        listen_ip: spec.listen_ip,
        listen_port: spec.listen_port,
        protocol: spec.protocol.into(),
        max_connections: spec.max_connections,
        path_prefix: spec.path_prefix,
        server_certificate,
        client_certificate_required: spec.client_certificate_required,
        targets,
        algorithm: spec.algorithm.into(),
        zone_affinity: spec.zone_affinity,
        sticky_sessions: spec.sticky_sessions,
    })
}

fn build_server_certificate(spec: &EndpointSpec) -> Result<ServerCertificate> {
    let cert_path = spec
        .tls_cert_path
        .as_ref()
        .context("tlsTcp endpoint requires tlsCertPath")?;
    let key_path = spec
        .tls_key_path
        .as_ref()
        .context("tlsTcp endpoint requires tlsKeyPath")?;

    let cert_pem = fs::read(cert_path).with_context(|| format!("reading {}", cert_path.display()))?;
    let key_pem = fs::read(key_path).with_context(|| format!("reading {}", key_path.display()))?;
    let ca_pem = spec
        .client_ca_path
        .as_ref()
        .map(fs::read)
        .transpose()
        .with_context(|| "reading clientCaPath")?;

    let tls_config = forwarder::tls::build_server_config(
        &cert_pem,
        &key_pem,
        spec.client_certificate_required,
        ca_pem.as_deref(),
    )?;

    Ok(ServerCertificate { tls_config })
}

fn build_target(spec: TargetSpec) -> Result<TargetBackend> {
    let mut backend = TargetBackend::new(spec.host, spec.port);
    backend.weight = spec.weight;
    backend.zone = spec.zone;
    backend.http_path = spec.http_path;
    backend.strip_path = spec.strip_path;
    backend.backend_protocol = if spec.backend_tls {
        BackendProtocol::Tls
    } else {
        BackendProtocol::Plain
    };
    backend.timeout = Duration::from_secs(spec.timeout_secs);
    backend.request_headers = spec.request_headers;
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_tcp_endpoint_parses() {
        let json = r#"{
            "endpoints": [{
                "listenIp": "127.0.0.1",
                "listenPort": 9000,
                "protocol": "tcp",
                "targets": [{"host": "127.0.0.1", "port": 9100}]
            }]
        }"#;
        let file: EndpointFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.endpoints.len(), 1);
        let endpoint = build_endpoint(file.endpoints.into_iter().next().unwrap()).unwrap();
        assert_eq!(endpoint.listen_port, 9000);
        assert_eq!(endpoint.targets.len(), 1);
        assert_eq!(endpoint.max_connections, 1000);
    }

    #[test]
    fn tls_tcp_endpoint_without_cert_path_is_an_error() {
        let json = r#"{
            "endpoints": [{
                "listenIp": "127.0.0.1",
                "listenPort": 9443,
                "protocol": "tlsTcp",
                "targets": [{"host": "127.0.0.1", "port": 9100}]
            }]
        }"#;
        let file: EndpointFile = serde_json::from_str(json).unwrap();
        let result = build_endpoint(file.endpoints.into_iter().next().unwrap());
        assert!(result.is_err());
    }
}
