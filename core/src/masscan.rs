use crate::config::{validate_port_spec, ConfigError, MAX_RATE};
use crate::model::{Host, HostStatus, Port, PortState, Protocol, ScanResult};
use crate::process::{find_executable, Invocation};
use crate::scanner::{self, ScanConfig, ScanError, Scanner, ToolNotFound};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub const NAME: &str = "masscan";

pub const DEFAULT_RATE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct MasscanScanner {
    path: PathBuf,
}

impl MasscanScanner {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn locate(configured: Option<&str>) -> Result<Self, ToolNotFound> {
        let looked_for = configured.unwrap_or(NAME);
        find_executable(looked_for)
            .map(Self::with_path)
            .ok_or_else(|| ToolNotFound {
                tool: NAME,
                looked_for: looked_for.to_string(),
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `target -p ports --rate N --output-format json [--banners] [extra..]`
pub fn build_args(target: &str, config: &ScanConfig) -> Vec<String> {
    let rate = config
        .rate
        .filter(|rate| *rate > 0)
        .unwrap_or(DEFAULT_RATE);

    let mut args = vec![
        target.to_string(),
        "-p".to_string(),
        config.port_spec().unwrap_or_default().to_string(),
        "--rate".to_string(),
        rate.to_string(),
        "--output-format".to_string(),
        "json".to_string(),
    ];

    if config.option_enabled("banners") {
        args.push("--banners".to_string());
    }

    args.extend(config.arguments.iter().cloned());
    args
}

#[async_trait]
impl Scanner for MasscanScanner {
    fn name(&self) -> &str {
        NAME
    }

    fn validate_config(&self, config: &ScanConfig) -> Result<(), ConfigError> {
        let ports = config.port_spec().ok_or(ConfigError::MissingPorts(NAME))?;
        validate_port_spec(ports)?;

        if let Some(rate) = config.rate {
            if rate > MAX_RATE {
                return Err(ConfigError::RateTooHigh {
                    rate,
                    max: MAX_RATE,
                });
            }
        }
        Ok(())
    }

    async fn scan(
        &self,
        cancel: &CancellationToken,
        target: &str,
        config: &ScanConfig,
    ) -> Result<ScanResult, ScanError> {
        self.validate_config(config)?;
        let invocation = Invocation::new(&self.path, build_args(target, config));
        scanner::execute(NAME, target, invocation, cancel, config.timeout, |scan_id, raw| {
            Ok::<_, Infallible>(parse_masscan_json(raw, scan_id))
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct MasscanRecord {
    ip: String,
    #[serde(default)]
    ports: Vec<MasscanPort>,
}

#[derive(Debug, Deserialize)]
struct MasscanPort {
    port: u16,
    proto: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    service: Option<MasscanService>,
}

#[derive(Debug, Deserialize)]
struct MasscanService {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    banner: Option<String>,
}

/// Folds masscan's per-port records into one host per IP, in first-seen
/// order. Lines that do not decode as a record are skipped.
pub fn parse_masscan_json(output: &str, scan_id: Uuid) -> Vec<Host> {
    let mut hosts: Vec<Host> = Vec::new();
    let mut index: HashMap<IpAddr, usize> = HashMap::new();

    for (line_no, line) in output.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line == "[" || line == "]" {
            continue;
        }
        let line = line.strip_suffix(',').unwrap_or(line);

        let record: MasscanRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                debug!(line = line_no + 1, "skipping masscan line: {err}");
                continue;
            }
        };
        let ip: IpAddr = match record.ip.trim().parse() {
            Ok(ip) => ip,
            Err(err) => {
                debug!(line = line_no + 1, ip = %record.ip, "skipping masscan record: {err}");
                continue;
            }
        };

        let slot = *index.entry(ip).or_insert_with(|| {
            let mut host = Host::new(scan_id, ip);
            host.status = HostStatus::Up;
            hosts.push(host);
            hosts.len() - 1
        });
        let host = &mut hosts[slot];

        for entry in record.ports {
            attach_port(host, entry);
        }
    }

    hosts
}

fn attach_port(host: &mut Host, entry: MasscanPort) {
    if entry.port == 0 {
        return;
    }
    let protocol = match entry.proto.parse::<Protocol>() {
        Ok(protocol) => protocol,
        Err(err) => {
            debug!(port = entry.port, "skipping masscan port: {err}");
            return;
        }
    };
    let state = match entry.status.as_deref() {
        Some(status) => match status.parse::<PortState>() {
            Ok(state) => state,
            Err(err) => {
                debug!(port = entry.port, "skipping masscan port: {err}");
                return;
            }
        },
        // Banner records omit the status; a banner implies the port answered.
        None => PortState::Open,
    };

    let existing = host
        .ports
        .iter()
        .position(|port| port.number == entry.port && port.protocol == protocol);
    let port = match existing {
        Some(slot) => {
            let port = &mut host.ports[slot];
            if entry.status.is_some() {
                port.state = state;
            }
            port
        }
        None => {
            let host_id = host.id;
            host.ports
                .push(Port::new(host_id, entry.port, protocol, state));
            let last = host.ports.len() - 1;
            &mut host.ports[last]
        }
    };

    if let Some(service) = entry.service {
        if let Some(name) = service.name.filter(|name| !name.is_empty()) {
            port.service = Some(name);
        }
        if let Some(banner) = service.banner.filter(|banner| !banner.is_empty()) {
            port.extra_info = Some(banner);
        }
    }
}
