//! Pick the endpoint the system proxy should point at.
//!
//! The edge proxy's generated configuration declares its inbound listeners.
//! One is chosen by protocol preference `http > mixed > socks`, falling back
//! to the first declared inbound of any protocol. Only inbounds with a port
//! in `1..=65535` are usable.

use crate::error::{CoreMeshError, Result};
use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

const PROTOCOL_PREFERENCE: [&str; 3] = ["http", "mixed", "socks"];

const LOOPBACK: &str = "127.0.0.1";

/// Listening endpoint of the edge proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    /// `host:port` as written into the system proxy settings.
    #[must_use]
    pub fn server_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol, self.server_address())
    }
}

#[derive(Debug, Deserialize)]
struct EdgeConfig {
    #[serde(default)]
    inbounds: Vec<Inbound>,
}

#[derive(Debug, Deserialize)]
struct Inbound {
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    listen: String,
    #[serde(default)]
    port: serde_json::Value,
}

impl Inbound {
    fn usable_port(&self) -> Option<u16> {
        let port = match &self.port {
            serde_json::Value::Number(n) => n.as_u64()?,
            serde_json::Value::String(s) => s.trim().parse::<u64>().ok()?,
            _ => return None,
        };
        u16::try_from(port).ok().filter(|p| *p > 0)
    }

    fn protocol(&self) -> String {
        self.protocol.trim().to_ascii_lowercase()
    }
}

/// Read the edge configuration at `config_path` and pick its endpoint.
pub fn detect_endpoint(config_path: &Path) -> Result<ProxyEndpoint> {
    let content = std::fs::read_to_string(config_path).map_err(|e| {
        CoreMeshError::EndpointNotFound(format!(
            "read edge config {}: {}",
            config_path.display(),
            e
        ))
    })?;
    endpoint_from_json(&content)
}

/// Pick the endpoint from the JSON text of an edge configuration.
pub fn endpoint_from_json(content: &str) -> Result<ProxyEndpoint> {
    let config: EdgeConfig = serde_json::from_str(content)
        .map_err(|e| CoreMeshError::EndpointNotFound(format!("parse edge config: {}", e)))?;
    if config.inbounds.is_empty() {
        return Err(CoreMeshError::EndpointNotFound(
            "edge config has no inbounds".to_string(),
        ));
    }

    let preferred = PROTOCOL_PREFERENCE.iter().find_map(|wanted| {
        config
            .inbounds
            .iter()
            .filter(|inbound| inbound.protocol() == *wanted)
            .find_map(|inbound| Some((inbound, inbound.usable_port()?)))
    });
    let chosen = preferred.or_else(|| {
        config
            .inbounds
            .iter()
            .find_map(|inbound| Some((inbound, inbound.usable_port()?)))
    });

    match chosen {
        Some((inbound, port)) => Ok(ProxyEndpoint {
            protocol: inbound.protocol(),
            host: normalize_host(&inbound.listen),
            port,
        }),
        None => Err(CoreMeshError::EndpointNotFound(
            "edge config has no inbound with a usable port".to_string(),
        )),
    }
}

/// Map empty and wildcard listen addresses to loopback.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.is_empty() {
        return LOOPBACK.to_string();
    }
    match bare.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => LOOPBACK.to_string(),
        _ => bare.to_string(),
    }
}
