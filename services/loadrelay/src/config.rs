//! Relay configuration.
//!
//! Values come from `LOADRELAY_*` environment variables, optionally layered
//! over a TOML file named by `LOADRELAY_CONFIG`. Environment values win.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::logging::LogFormat;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Role name shown in the status string.
    pub role: String,

    /// Address the listening ports bind to.
    pub bind_addr: IpAddr,

    /// Primary group listening ports.
    pub listen_ports: Vec<u16>,

    /// Primary group backend pool.
    pub backend_ports: Vec<u16>,

    /// Auxiliary group listening ports.
    pub aux_listen_ports: Vec<u16>,

    /// Auxiliary group backend pool.
    pub aux_backend_ports: Vec<u16>,

    /// How often the status string is refreshed.
    pub status_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    role: Option<String>,
    bind_addr: Option<IpAddr>,
    listen_ports: Option<Vec<u16>>,
    backend_ports: Option<Vec<u16>>,
    aux_listen_ports: Option<Vec<u16>>,
    aux_backend_ports: Option<Vec<u16>>,
    status_interval_ms: Option<u64>,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration using `lookup` in place of the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = lookup("LOADRELAY_CONFIG")
            .map(|path| FileConfig::read(Path::new(&path)))
            .transpose()?
            .unwrap_or_default();

        let role = lookup("LOADRELAY_ROLE")
            .or(file.role)
            .unwrap_or_else(|| "loadrelay".to_string());

        let bind_addr = lookup("LOADRELAY_BIND_ADDR")
            .map(|v| v.parse())
            .transpose()
            .context("LOADRELAY_BIND_ADDR must be an IP address.")?
            .or(file.bind_addr)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let ports = |name: &str, from_file: Option<Vec<u16>>| -> Result<Vec<u16>> {
            match lookup(name) {
                Some(value) => parse_ports(name, &value),
                None => Ok(from_file.unwrap_or_default()),
            }
        };

        let listen_ports = ports("LOADRELAY_LISTEN_PORTS", file.listen_ports)?;
        let backend_ports = ports("LOADRELAY_BACKEND_PORTS", file.backend_ports)?;
        let aux_listen_ports = ports("LOADRELAY_AUX_LISTEN_PORTS", file.aux_listen_ports)?;
        let aux_backend_ports = ports("LOADRELAY_AUX_BACKEND_PORTS", file.aux_backend_ports)?;

        if listen_ports.is_empty() {
            bail!("Missing listening ports. Set LOADRELAY_LISTEN_PORTS (example: 8080,8081).");
        }
        if backend_ports.is_empty() {
            bail!("Missing backend ports. Set LOADRELAY_BACKEND_PORTS (example: 9000,9001).");
        }
        if !aux_listen_ports.is_empty() && aux_backend_ports.is_empty() {
            bail!("LOADRELAY_AUX_LISTEN_PORTS is set but LOADRELAY_AUX_BACKEND_PORTS is empty.");
        }

        let status_interval_ms: u64 = lookup("LOADRELAY_STATUS_INTERVAL_MS")
            .map(|v| v.parse())
            .transpose()
            .context("LOADRELAY_STATUS_INTERVAL_MS must be an integer (milliseconds).")?
            .or(file.status_interval_ms)
            .unwrap_or(500);
        let status_interval = Duration::from_millis(status_interval_ms.max(50));

        let log_level = lookup("LOADRELAY_LOG_LEVEL")
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        let log_format = lookup("LOADRELAY_LOG_FORMAT")
            .map(|v| v.parse())
            .transpose()
            .context("LOADRELAY_LOG_FORMAT is invalid.")?
            .or(file.log_format)
            .unwrap_or_default();

        Ok(Self {
            role,
            bind_addr,
            listen_ports,
            backend_ports,
            aux_listen_ports,
            aux_backend_ports,
            status_interval,
            log_level,
            log_format,
        })
    }
}

fn parse_ports(name: &str, value: &str) -> Result<Vec<u16>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<u16>()
                .with_context(|| format!("{name} must be a comma-separated list of ports, got {item:?}."))
        })
        .collect()
}
