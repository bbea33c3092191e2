use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("unrecognized {kind} '{value}'")]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownValue {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::CompletedWithErrors => "completed_with_errors",
            ScanStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "completed_with_errors" => Ok(ScanStatus::CompletedWithErrors),
            "failed" => Ok(ScanStatus::Failed),
            other => Err(UnknownValue::new("scan status", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub id: Uuid,
    pub target: String,
    pub scanner: String,
    pub status: ScanStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub raw_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanResult {
    /// Opens a result in the `running` state. The returned handle must be
    /// finalized through one of its consuming methods.
    pub fn start(target: impl Into<String>, scanner: impl Into<String>) -> RunningScan {
        RunningScan {
            result: ScanResult {
                id: Uuid::new_v4(),
                target: target.into(),
                scanner: scanner.into(),
                status: ScanStatus::Running,
                start_time: OffsetDateTime::now_utc(),
                end_time: None,
                duration: String::new(),
                hosts: Vec::new(),
                raw_output: String::new(),
                error: None,
            },
            timer: Instant::now(),
        }
    }

    pub fn port_count(&self) -> usize {
        self.hosts.iter().map(|host| host.ports.len()).sum()
    }

    pub fn is_failed(&self) -> bool {
        self.status == ScanStatus::Failed
    }
}

#[derive(Debug)]
pub struct RunningScan {
    result: ScanResult,
    timer: Instant,
}

impl RunningScan {
    pub fn id(&self) -> Uuid {
        self.result.id
    }

    pub fn target(&self) -> &str {
        &self.result.target
    }

    pub fn complete(self, hosts: Vec<Host>, raw_output: String) -> ScanResult {
        self.finish(ScanStatus::Completed, hosts, raw_output, None)
    }

    pub fn complete_with_errors(self, raw_output: String, error: impl fmt::Display) -> ScanResult {
        self.finish(
            ScanStatus::CompletedWithErrors,
            Vec::new(),
            raw_output,
            Some(non_empty_message(error)),
        )
    }

    pub fn fail(self, raw_output: String, error: impl fmt::Display) -> ScanResult {
        self.finish(
            ScanStatus::Failed,
            Vec::new(),
            raw_output,
            Some(non_empty_message(error)),
        )
    }

    fn finish(
        self,
        status: ScanStatus,
        hosts: Vec<Host>,
        raw_output: String,
        error: Option<String>,
    ) -> ScanResult {
        let RunningScan { mut result, timer } = self;
        result.status = status;
        result.end_time = Some(OffsetDateTime::now_utc());
        result.duration = format_duration(timer.elapsed());
        result.hosts = hosts;
        result.raw_output = raw_output;
        result.error = error;
        result
    }
}

fn non_empty_message(error: impl fmt::Display) -> String {
    let message = error.to_string();
    if message.trim().is_empty() {
        "unknown error".to_string()
    } else {
        message
    }
}

pub fn format_duration(elapsed: Duration) -> String {
    let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    format!("{:?}", Duration::from_millis(millis))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
    Filtered,
    #[default]
    Unknown,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Up => "up",
            HostStatus::Down => "down",
            HostStatus::Filtered => "filtered",
            HostStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for HostStatus {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "up" => Ok(HostStatus::Up),
            "down" => Ok(HostStatus::Down),
            "filtered" => Ok(HostStatus::Filtered),
            "unknown" => Ok(HostStatus::Unknown),
            other => Err(UnknownValue::new("host status", other)),
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub ip_address: IpAddr,
    #[serde(default)]
    pub hostname: Option<String>,
    pub status: HostStatus,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub os_confidence: u8,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Host {
    pub fn new(scan_id: Uuid, ip_address: IpAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            scan_id,
            ip_address,
            hostname: None,
            status: HostStatus::Unknown,
            os: None,
            os_confidence: 0,
            ports: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn port_mut(&mut self, number: u16, protocol: Protocol) -> Option<&mut Port> {
        self.ports
            .iter_mut()
            .find(|port| port.number == number && port.protocol == protocol)
    }

    pub fn open_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(|port| port.state == PortState::Open)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl FromStr for Protocol {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(UnknownValue::new("protocol", value)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PortState {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "filtered")]
    Filtered,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    #[serde(rename = "closed|filtered")]
    ClosedFiltered,
    #[serde(rename = "unfiltered")]
    Unfiltered,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
            PortState::OpenFiltered => "open|filtered",
            PortState::ClosedFiltered => "closed|filtered",
            PortState::Unfiltered => "unfiltered",
        }
    }
}

impl FromStr for PortState {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "open" => Ok(PortState::Open),
            "closed" => Ok(PortState::Closed),
            "filtered" => Ok(PortState::Filtered),
            "open|filtered" => Ok(PortState::OpenFiltered),
            "closed|filtered" => Ok(PortState::ClosedFiltered),
            "unfiltered" => Ok(PortState::Unfiltered),
            other => Err(UnknownValue::new("port state", other)),
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: Uuid,
    pub host_id: Uuid,
    pub number: u16,
    pub protocol: Protocol,
    pub state: PortState,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub extra_info: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Port {
    pub fn new(host_id: Uuid, number: u16, protocol: Protocol, state: PortState) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id,
            number,
            protocol,
            state,
            service: None,
            version: None,
            product: None,
            extra_info: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: Uuid,
    pub port_id: Uuid,
    pub cve: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub reference_links: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Ip,
    Range,
    Domain,
}

impl TargetKind {
    /// `10.0.0.1` is an ip, `10.0.0.0/24` and `10.0.0.1-20` are ranges,
    /// anything else is treated as a domain name.
    pub fn classify(target: &str) -> Self {
        let target = target.trim();
        if target.parse::<IpAddr>().is_ok() {
            return TargetKind::Ip;
        }
        if let Some((base, _)) = target.split_once('/') {
            if base.parse::<IpAddr>().is_ok() {
                return TargetKind::Range;
            }
        }
        if let Some((start, _)) = target.split_once('-') {
            if start.parse::<IpAddr>().is_ok() {
                return TargetKind::Range;
            }
        }
        TargetKind::Domain
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Ip => "ip",
            TargetKind::Range => "range",
            TargetKind::Domain => "domain",
        }
    }
}

impl FromStr for TargetKind {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ip" => Ok(TargetKind::Ip),
            "range" => Ok(TargetKind::Range),
            "domain" => Ok(TargetKind::Domain),
            other => Err(UnknownValue::new("target kind", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTarget {
    pub id: Uuid,
    pub target: String,
    pub kind: TargetKind,
    #[serde(default)]
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ScanTarget {
    pub fn new(target: impl Into<String>, description: impl Into<String>) -> Self {
        let target = target.into();
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            kind: TargetKind::classify(&target),
            target,
            description: description.into(),
            created_at: now,
            updated_at: now,
        }
    }
}
