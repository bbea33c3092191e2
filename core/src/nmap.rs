use crate::config::{validate_port_spec, validate_timing, ConfigError};
use crate::model::{Host, HostStatus, Port, PortState, Protocol, ScanResult};
use crate::process::{find_executable, Invocation};
use crate::scanner::{self, ScanConfig, ScanError, Scanner, ToolNotFound};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub const NAME: &str = "nmap";

const TIMING_MIN: i64 = 0;
const TIMING_MAX: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum NmapParseError {
    #[error("failed to parse nmap XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("failed to parse nmap XML: no <nmaprun> element found")]
    MissingRoot,
    #[error("failed to parse nmap XML: document ended before </nmaprun>")]
    Truncated,
}

#[derive(Debug, Clone)]
pub struct NmapScanner {
    path: PathBuf,
}

impl NmapScanner {
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

/// `-oX - [-p ports] [-T timing] -sV -O [--script s] [extra..] target`
pub fn build_args(target: &str, config: &ScanConfig) -> Vec<String> {
    let mut args = vec!["-oX".to_string(), "-".to_string()];

    if let Some(ports) = config.port_spec() {
        args.push("-p".to_string());
        args.push(ports.to_string());
    }

    if let Some(timing) = config.timing_spec() {
        args.push(format!("-T{timing}"));
    }

    args.push("-sV".to_string());
    args.push("-O".to_string());

    if let Some(scripts) = config.options.get("scripts").filter(|s| !s.is_empty()) {
        args.push("--script".to_string());
        args.push(scripts.clone());
    }

    args.extend(config.arguments.iter().cloned());
    args.push(target.to_string());
    args
}

#[async_trait]
impl Scanner for NmapScanner {
    fn name(&self) -> &str {
        NAME
    }

    fn validate_config(&self, config: &ScanConfig) -> Result<(), ConfigError> {
        if let Some(ports) = config.port_spec() {
            validate_port_spec(ports)?;
        }
        if let Some(timing) = config.timing_spec() {
            validate_timing(timing, TIMING_MIN, TIMING_MAX)?;
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
            parse_nmap_xml(raw.as_bytes(), scan_id)
        })
        .await
    }
}

pub fn parse_nmap_xml(xml: &[u8], scan_id: Uuid) -> Result<Vec<Host>, NmapParseError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut state = ParseState::default();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) => state.open(&element, false),
            Event::Empty(element) => state.open(&element, true),
            Event::End(element) => state.close(element.name().as_ref()),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !state.seen_root {
        return Err(NmapParseError::MissingRoot);
    }
    if !state.closed_root {
        return Err(NmapParseError::Truncated);
    }

    Ok(state
        .hosts
        .into_iter()
        .filter_map(|host| host.build(scan_id))
        .collect())
}

#[derive(Default)]
struct ParseState {
    seen_root: bool,
    closed_root: bool,
    hosts: Vec<HostBuilder>,
    current_host: Option<HostBuilder>,
    current_port: Option<PortBuilder>,
}

impl ParseState {
    fn open(&mut self, element: &BytesStart<'_>, self_closing: bool) {
        match element.name().as_ref() {
            b"nmaprun" => {
                self.seen_root = true;
                if self_closing {
                    self.closed_root = true;
                }
            }
            b"host" => {
                self.current_host = Some(HostBuilder::default());
                if self_closing {
                    self.close(b"host");
                }
            }
            b"status" => {
                if let Some(host) = self.current_host.as_mut() {
                    host.status = attribute(element, b"state");
                }
            }
            b"address" => {
                if let Some(host) = self.current_host.as_mut() {
                    if let Some(addr) = attribute(element, b"addr") {
                        let addr_type =
                            attribute(element, b"addrtype").unwrap_or_else(|| "unknown".into());
                        host.addresses.push((addr, addr_type));
                    }
                }
            }
            b"hostname" => {
                if let Some(host) = self.current_host.as_mut() {
                    if let Some(name) = attribute(element, b"name") {
                        host.hostnames.push(name);
                    }
                }
            }
            b"osmatch" => {
                if let Some(host) = self.current_host.as_mut() {
                    if host.os_match.is_none() {
                        if let Some(name) = attribute(element, b"name") {
                            let accuracy = attribute(element, b"accuracy")
                                .and_then(|value| value.parse::<u8>().ok())
                                .unwrap_or(0)
                                .min(100);
                            host.os_match = Some((name, accuracy));
                        }
                    }
                }
            }
            b"port" => {
                if self.current_host.is_some() {
                    self.current_port = Some(PortBuilder {
                        protocol: attribute(element, b"protocol"),
                        port: attribute(element, b"portid").and_then(|v| v.parse::<u16>().ok()),
                        ..PortBuilder::default()
                    });
                    if self_closing {
                        self.close(b"port");
                    }
                }
            }
            b"state" => {
                if let Some(port) = self.current_port.as_mut() {
                    port.state = attribute(element, b"state");
                }
            }
            b"service" => {
                if let Some(port) = self.current_port.as_mut() {
                    port.service = attribute(element, b"name");
                    port.product = attribute(element, b"product");
                    port.version = attribute(element, b"version");
                    port.extra_info = attribute(element, b"extrainfo");
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, name: &[u8]) {
        match name {
            b"port" => {
                if let (Some(host), Some(port)) = (self.current_host.as_mut(), self.current_port.take())
                {
                    host.ports.push(port);
                }
            }
            b"host" => {
                if let Some(host) = self.current_host.take() {
                    self.hosts.push(host);
                }
            }
            b"nmaprun" => self.closed_root = true,
            _ => {}
        }
    }
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .map(|attr| match attr.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).to_string(),
        })
}

#[derive(Default)]
struct HostBuilder {
    status: Option<String>,
    addresses: Vec<(String, String)>,
    hostnames: Vec<String>,
    os_match: Option<(String, u8)>,
    ports: Vec<PortBuilder>,
}

impl HostBuilder {
    fn primary_address(&self) -> Option<IpAddr> {
        let by_type = |wanted: &str| {
            self.addresses
                .iter()
                .filter(|(_, addr_type)| addr_type == wanted)
                .find_map(|(addr, _)| addr.parse::<IpAddr>().ok())
        };
        by_type("ipv4").or_else(|| by_type("ipv6"))
    }

    fn build(self, scan_id: Uuid) -> Option<Host> {
        let Some(ip) = self.primary_address() else {
            debug!(addresses = ?self.addresses, "skipping nmap host without an IP address");
            return None;
        };

        let mut host = Host::new(scan_id, ip);
        host.status = self
            .status
            .as_deref()
            .and_then(|status| status.parse().ok())
            .unwrap_or(HostStatus::Unknown);
        host.hostname = self.hostnames.into_iter().find(|name| !name.is_empty());
        if let Some((os, accuracy)) = self.os_match {
            host.os = Some(os);
            host.os_confidence = accuracy;
        }

        let host_id = host.id;
        host.ports = self
            .ports
            .into_iter()
            .filter_map(|port| port.build(host_id))
            .collect();
        Some(host)
    }
}

#[derive(Default)]
struct PortBuilder {
    port: Option<u16>,
    protocol: Option<String>,
    state: Option<String>,
    service: Option<String>,
    product: Option<String>,
    version: Option<String>,
    extra_info: Option<String>,
}

impl PortBuilder {
    fn build(self, host_id: Uuid) -> Option<Port> {
        let number = self.port.filter(|number| *number != 0)?;
        let protocol = match self.protocol.as_deref().unwrap_or("tcp").parse::<Protocol>() {
            Ok(protocol) => protocol,
            Err(err) => {
                debug!(port = number, "skipping nmap port: {err}");
                return None;
            }
        };
        let state = match self.state.as_deref().map(str::parse::<PortState>) {
            Some(Ok(state)) => state,
            Some(Err(err)) => {
                debug!(port = number, "skipping nmap port: {err}");
                return None;
            }
            None => {
                debug!(port = number, "skipping nmap port without a state");
                return None;
            }
        };

        let mut port = Port::new(host_id, number, protocol, state);
        port.service = self.service.filter(|s| !s.is_empty());
        port.product = self.product.filter(|s| !s.is_empty());
        port.version = self.version.filter(|s| !s.is_empty());
        port.extra_info = self.extra_info.filter(|s| !s.is_empty());
        Some(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScanStatus;

    const SINGLE_HOST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -oX - -sV -O 10.0.0.5" version="7.94">
  <hosthint><status state="up" reason="arp-response"/><address addr="10.0.0.5" addrtype="ipv4"/></hosthint>
  <host starttime="1700000000" endtime="1700000042">
    <status state="up" reason="arp-response" reason_ttl="0"/>
    <address addr="10.0.0.5" addrtype="ipv4"/>
    <address addr="00:11:22:33:44:55" addrtype="mac" vendor="Acme"/>
    <hostnames>
      <hostname name="router.local" type="PTR"/>
      <hostname name="gateway.local" type="user"/>
    </hostnames>
    <os>
      <portused state="open" proto="tcp" portid="22"/>
      <osmatch name="Linux 3.2 - 4.9" accuracy="95" line="67389">
        <osclass type="general purpose" vendor="Linux" osfamily="Linux" accuracy="95"/>
      </osmatch>
      <osmatch name="Linux 4.15" accuracy="90" line="67999"/>
    </os>
  </host>
  <runstats><finished time="1700000042" exit="success"/><hosts up="1" down="0" total="1"/></runstats>
</nmaprun>
"#;

    const WITH_PORTS: &str = r#"<nmaprun>
  <host>
    <status state="up"/>
    <address addr="192.168.1.10" addrtype="ipv4"/>
    <hostnames/>
    <ports>
      <extraports state="closed" count="997"/>
      <port protocol="tcp" portid="22">
        <state state="open" reason="syn-ack" reason_ttl="64"/>
        <service name="ssh" product="OpenSSH" version="8.9p1" extrainfo="Ubuntu Linux; protocol 2.0" method="table" conf="10">
          <cpe>cpe:/a:openbsd:openssh:8.9p1</cpe>
        </service>
      </port>
      <port protocol="tcp" portid="80">
        <state state="filtered" reason="no-response"/>
        <service name="http" method="table" conf="3"/>
      </port>
      <port protocol="udp" portid="53">
        <state state="open|filtered" reason="no-response"/>
      </port>
      <port protocol="sctp" portid="2905">
        <state state="open"/>
      </port>
    </ports>
  </host>
  <host>
    <status state="down"/>
    <address addr="fe80::1" addrtype="ipv6"/>
  </host>
  <host>
    <status state="up"/>
    <address addr="aa:bb:cc:dd:ee:ff" addrtype="mac"/>
  </host>
</nmaprun>"#;

    #[test]
    fn parses_single_host_fields() {
        let scan_id = Uuid::new_v4();
        let hosts = parse_nmap_xml(SINGLE_HOST.as_bytes(), scan_id).expect("valid xml");

        assert_eq!(hosts.len(), 1);
        let host = &hosts[0];
        assert_eq!(host.scan_id, scan_id);
        assert_eq!(host.ip_address, "10.0.0.5".parse::<IpAddr>().expect("ip"));
        assert_eq!(host.status, HostStatus::Up);
        assert_eq!(host.hostname.as_deref(), Some("router.local"));
        assert_eq!(host.os.as_deref(), Some("Linux 3.2 - 4.9"));
        assert_eq!(host.os_confidence, 95);
        assert!(host.ports.is_empty());
    }

    #[test]
    fn maps_port_and_service_nodes() {
        let hosts = parse_nmap_xml(WITH_PORTS.as_bytes(), Uuid::new_v4()).expect("valid xml");
        assert_eq!(hosts.len(), 2, "host without an IP address is skipped");

        let host = &hosts[0];
        assert_eq!(host.hostname, None);
        assert_eq!(host.os, None);
        assert_eq!(host.os_confidence, 0);
        assert_eq!(host.ports.len(), 3, "sctp port is skipped");

        let ssh = &host.ports[0];
        assert_eq!(ssh.host_id, host.id);
        assert_eq!(ssh.number, 22);
        assert_eq!(ssh.protocol, Protocol::Tcp);
        assert_eq!(ssh.state, PortState::Open);
        assert_eq!(ssh.service.as_deref(), Some("ssh"));
        assert_eq!(ssh.product.as_deref(), Some("OpenSSH"));
        assert_eq!(ssh.version.as_deref(), Some("8.9p1"));
        assert_eq!(
            ssh.extra_info.as_deref(),
            Some("Ubuntu Linux; protocol 2.0")
        );

        assert_eq!(host.ports[1].state, PortState::Filtered);
        assert_eq!(host.ports[1].product, None);
        assert_eq!(host.ports[2].protocol, Protocol::Udp);
        assert_eq!(host.ports[2].state, PortState::OpenFiltered);

        let v6 = &hosts[1];
        assert_eq!(v6.ip_address, "fe80::1".parse::<IpAddr>().expect("ip"));
        assert_eq!(v6.status, HostStatus::Down);
    }

    #[test]
    fn unescapes_attribute_values() {
        let xml = r#"<nmaprun><host><status state="up"/><address addr="10.0.0.9" addrtype="ipv4"/>
<os><osmatch name="Cisco &amp; Linksys router" accuracy="88"/></os></host></nmaprun>"#;
        let hosts = parse_nmap_xml(xml.as_bytes(), Uuid::new_v4()).expect("valid xml");
        assert_eq!(hosts[0].os.as_deref(), Some("Cisco & Linksys router"));
    }

    #[test]
    fn empty_report_has_no_hosts() {
        let hosts = parse_nmap_xml(b"<nmaprun/>", Uuid::new_v4()).expect("valid xml");
        assert!(hosts.is_empty());
    }

    #[test]
    fn plain_text_is_a_parse_failure() {
        let err = parse_nmap_xml(b"Starting Nmap 7.94\nFailed to resolve host", Uuid::new_v4())
            .expect_err("not xml");
        assert!(matches!(err, NmapParseError::MissingRoot));
    }

    #[test]
    fn mismatched_tags_are_a_parse_failure() {
        let err = parse_nmap_xml(b"<nmaprun><host></nmaprun>", Uuid::new_v4())
            .expect_err("ill-formed xml");
        assert!(matches!(err, NmapParseError::Xml(_)));
    }

    #[test]
    fn truncated_report_is_a_parse_failure() {
        let xml = br#"<nmaprun><host><status state="up"/><address addr="10.0.0.1" addrtype="ipv4"/>"#;
        let err = parse_nmap_xml(xml, Uuid::new_v4()).expect_err("truncated");
        assert!(matches!(
            err,
            NmapParseError::Truncated | NmapParseError::Xml(_)
        ));
    }

    #[test]
    fn args_put_user_arguments_after_defaults() {
        let config = ScanConfig::new()
            .with_ports("22,80")
            .with_timing("4")
            .with_arguments(["-Pn", "-sV"]);
        assert_eq!(
            build_args("10.0.0.1", &config),
            vec!["-oX", "-", "-p", "22,80", "-T4", "-sV", "-O", "-Pn", "-sV", "10.0.0.1"]
        );
    }

    #[test]
    fn args_skip_unset_ports_and_timing() {
        let config = ScanConfig::new().with_option("scripts", "http-title");
        assert_eq!(
            build_args("scanme.nmap.org", &config),
            vec![
                "-oX",
                "-",
                "-sV",
                "-O",
                "--script",
                "http-title",
                "scanme.nmap.org"
            ]
        );
    }

    #[test]
    fn validates_ports_and_timing() {
        let scanner = NmapScanner::with_path("nmap");
        assert!(scanner.validate_config(&ScanConfig::new()).is_ok());
        assert!(scanner
            .validate_config(&ScanConfig::new().with_ports("1-1000").with_timing("5"))
            .is_ok());
        for timing in ["0", "1", "2", "3", "4", "5"] {
            assert!(scanner
                .validate_config(&ScanConfig::new().with_timing(timing))
                .is_ok());
        }
        for timing in ["-1", "6"] {
            assert!(matches!(
                scanner.validate_config(&ScanConfig::new().with_timing(timing)),
                Err(ConfigError::InvalidTiming { .. })
            ));
        }
        for ports in ["abc", "80-", ",80"] {
            assert!(matches!(
                scanner.validate_config(&ScanConfig::new().with_ports(ports)),
                Err(ConfigError::InvalidPorts(_))
            ));
        }
    }

    #[tokio::test]
    async fn invalid_config_never_spawns() {
        let scanner = NmapScanner::with_path("/nonexistent/nmap");
        let err = scanner
            .scan(
                &CancellationToken::new(),
                "10.0.0.1",
                &ScanConfig::new().with_timing("9"),
            )
            .await
            .expect_err("invalid timing");
        assert!(matches!(err, ScanError::InvalidConfig(_)));
        assert!(err.result().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_tool_yields_failed_result_and_error() {
        let scanner = NmapScanner::with_path("false");
        let err = scanner
            .scan(&CancellationToken::new(), "10.0.0.1", &ScanConfig::new())
            .await
            .expect_err("tool exits non-zero");

        let result = err.result().expect("failed result attached");
        assert_eq!(result.status, ScanStatus::Failed);
        assert_eq!(result.scanner, NAME);
        assert!(result.hosts.is_empty());
        assert!(result.error.as_deref().is_some_and(|e| !e.is_empty()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unparseable_output_is_not_a_caller_error() {
        // `echo` exits 0 and prints the argument vector, which is not XML.
        let scanner = NmapScanner::with_path("echo");
        let result = scanner
            .scan(&CancellationToken::new(), "10.0.0.1", &ScanConfig::new())
            .await
            .expect("parse failure is soft");

        assert_eq!(result.status, ScanStatus::CompletedWithErrors);
        assert!(result.error.as_deref().is_some_and(|e| !e.is_empty()));
        assert!(result.hosts.is_empty());
        assert!(result.raw_output.contains("10.0.0.1"));
    }

    #[test]
    fn locate_reports_missing_binary() {
        let err = NmapScanner::locate(Some("/nonexistent/nmap")).expect_err("missing");
        assert_eq!(err.tool, NAME);
        assert_eq!(err.looked_for, "/nonexistent/nmap");
    }
}
