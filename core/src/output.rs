use crate::model::{Host, ScanResult, ScanTarget};
use crate::store::ScanRecord;
use comfy_table::{presets::ASCII_FULL, Table};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("formatter '{name}' not available (available: {})", .available.join(", "))]
    Unknown {
        name: String,
        available: Vec<String>,
    },
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml encoding failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("xml encoding failed: {0}")]
    Xml(String),
    #[error("csv encoding failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub trait Formatter: Send + Sync {
    fn format(&self, result: &ScanResult) -> Result<Vec<u8>, FormatError>;
    fn mime_type(&self) -> &'static str;
    fn extension(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format(&self, result: &ScanResult) -> Result<Vec<u8>, FormatError> {
        let mut bytes = serde_json::to_vec_pretty(result)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn mime_type(&self) -> &'static str {
        "application/json"
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlFormatter;

impl Formatter for YamlFormatter {
    fn format(&self, result: &ScanResult) -> Result<Vec<u8>, FormatError> {
        Ok(serde_yaml::to_string(result)?.into_bytes())
    }

    fn mime_type(&self) -> &'static str {
        "application/yaml"
    }

    fn extension(&self) -> &'static str {
        "yaml"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XmlFormatter;

impl Formatter for XmlFormatter {
    fn format(&self, result: &ScanResult) -> Result<Vec<u8>, FormatError> {
        let mut xml = XmlOut::new();
        xml.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        xml.event(Event::Start(BytesStart::new("scanResult")))?;

        xml.element("id", &result.id.to_string())?;
        xml.element("target", &result.target)?;
        xml.element("scanner", &result.scanner)?;
        xml.element("status", result.status.as_str())?;
        xml.element("startTime", &timestamp(result.start_time))?;
        if let Some(end) = result.end_time {
            xml.element("endTime", &timestamp(end))?;
        }
        xml.element("duration", &result.duration)?;

        xml.event(Event::Start(BytesStart::new("hosts")))?;
        for host in &result.hosts {
            let ip = host.ip_address.to_string();
            let host_start = BytesStart::new("host")
                .with_attributes([("ip", ip.as_str()), ("status", host.status.as_str())]);
            xml.event(Event::Start(host_start))?;
            if let Some(hostname) = &host.hostname {
                xml.element("hostname", hostname)?;
            }
            if let Some(os) = &host.os {
                let accuracy = host.os_confidence.to_string();
                let os_start = BytesStart::new("os").with_attributes([("confidence", accuracy.as_str())]);
                xml.event(Event::Start(os_start))?;
                xml.event(Event::Text(BytesText::new(os)))?;
                xml.event(Event::End(BytesEnd::new("os")))?;
            }

            xml.event(Event::Start(BytesStart::new("ports")))?;
            for port in &host.ports {
                let number = port.number.to_string();
                let mut port_start = BytesStart::new("port");
                port_start.push_attribute(("number", number.as_str()));
                port_start.push_attribute(("protocol", port.protocol.as_str()));
                port_start.push_attribute(("state", port.state.as_str()));
                xml.event(Event::Start(port_start))?;
                for (name, value) in [
                    ("service", &port.service),
                    ("product", &port.product),
                    ("version", &port.version),
                    ("extraInfo", &port.extra_info),
                ] {
                    if let Some(value) = value {
                        xml.element(name, value)?;
                    }
                }
                xml.event(Event::End(BytesEnd::new("port")))?;
            }
            xml.event(Event::End(BytesEnd::new("ports")))?;
            xml.event(Event::End(BytesEnd::new("host")))?;
        }
        xml.event(Event::End(BytesEnd::new("hosts")))?;

        if let Some(error) = &result.error {
            xml.element("error", error)?;
        }
        xml.element("rawOutput", &result.raw_output)?;
        xml.event(Event::End(BytesEnd::new("scanResult")))?;

        let mut bytes = xml.finish();
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn mime_type(&self) -> &'static str {
        "application/xml"
    }

    fn extension(&self) -> &'static str {
        "xml"
    }
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn event(&mut self, event: Event<'_>) -> Result<(), FormatError> {
        self.writer
            .write_event(event)
            .map_err(|err| FormatError::Xml(err.to_string()))
    }

    fn element(&mut self, name: &str, text: &str) -> Result<(), FormatError> {
        self.event(Event::Start(BytesStart::new(name)))?;
        if !text.is_empty() {
            self.event(Event::Text(BytesText::new(text)))?;
        }
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn finish(self) -> Vec<u8> {
        self.writer.into_inner()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvFormatter;

impl Formatter for CsvFormatter {
    fn format(&self, result: &ScanResult) -> Result<Vec<u8>, FormatError> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());

        writer.write_record([
            "Target",
            "Scanner",
            "Status",
            "Start Time",
            "End Time",
            "Duration",
            "Host Count",
            "Error",
        ])?;
        writer.write_record([
            result.target.clone(),
            result.scanner.clone(),
            result.status.to_string(),
            timestamp(result.start_time),
            result.end_time.map(timestamp).unwrap_or_default(),
            result.duration.clone(),
            result.hosts.len().to_string(),
            result.error.clone().unwrap_or_default(),
        ])?;

        if !result.hosts.is_empty() {
            writer.write_record(["IP Address", "Hostname", "Status", "OS", "OS Confidence"])?;
            for host in &result.hosts {
                writer.write_record([
                    host.ip_address.to_string(),
                    host.hostname.clone().unwrap_or_default(),
                    host.status.to_string(),
                    host.os.clone().unwrap_or_default(),
                    host.os_confidence.to_string(),
                ])?;
            }
        }

        if result.port_count() > 0 {
            writer.write_record([
                "IP Address",
                "Port",
                "Protocol",
                "State",
                "Service",
                "Product",
                "Version",
                "Extra Info",
            ])?;
            for host in &result.hosts {
                for port in &host.ports {
                    writer.write_record([
                        host.ip_address.to_string(),
                        port.number.to_string(),
                        port.protocol.to_string(),
                        port.state.to_string(),
                        port.service.clone().unwrap_or_default(),
                        port.product.clone().unwrap_or_default(),
                        port.version.clone().unwrap_or_default(),
                        port.extra_info.clone().unwrap_or_default(),
                    ])?;
                }
            }
        }

        writer
            .into_inner()
            .map_err(|err| FormatError::Csv(err.into_error().into()))
    }

    fn mime_type(&self) -> &'static str {
        "text/csv"
    }

    fn extension(&self) -> &'static str {
        "csv"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlFormatter;

impl Formatter for HtmlFormatter {
    fn format(&self, result: &ScanResult) -> Result<Vec<u8>, FormatError> {
        Ok(render_html_report(result).into_bytes())
    }

    fn mime_type(&self) -> &'static str {
        "text/html"
    }

    fn extension(&self) -> &'static str {
        "html"
    }
}

fn render_html_report(result: &ScanResult) -> String {
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\" />\n");
    html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\" />\n");
    html.push_str(&format!(
        "<title>NetRecon Report: {}</title>\n",
        escape_html(&result.target)
    ));
    html.push_str("<style>");
    html.push_str(
        "body{font-family:system-ui,-apple-system,\"Segoe UI\",sans-serif;background:#0f172a;color:#e2e8f0;margin:0;padding:0;}\
        header{background:#1e293b;padding:24px 32px;border-bottom:1px solid rgba(148,163,184,0.2);}\
        h1{margin:0;font-size:28px;}\
        h2{margin-top:0;margin-bottom:12px;font-size:22px;}\
        main{padding:32px;}\
        section{margin-bottom:32px;background:#111c34;padding:24px;border-radius:12px;border:1px solid rgba(148,163,184,0.1);}\
        table{width:100%;border-collapse:collapse;margin-top:12px;font-size:14px;}\
        th,td{border:1px solid rgba(148,163,184,0.2);padding:8px 10px;text-align:left;}\
        th{background:#1e293b;font-weight:600;}\
        tr:nth-child(even){background:rgba(148,163,184,0.05);}\
        .status-completed{color:#4ade80;}\
        .status-completed_with_errors{color:#facc15;}\
        .status-failed{color:#f87171;}\
        .error{border-color:#f87171;}\
        pre{font-family:\"Fira Code\",Consolas,monospace;background:#0b1120;color:#f8fafc;border-radius:8px;padding:16px;overflow:auto;}\
        details>summary{cursor:pointer;color:#38bdf8;font-weight:600;}\
        footer{padding:16px 32px;border-top:1px solid rgba(148,163,184,0.2);color:#94a3b8;font-size:13px;}",
    );
    html.push_str("</style>\n</head>\n<body>\n");

    html.push_str("<header>");
    html.push_str(&format!(
        "<h1>NetRecon Report: {}</h1>",
        escape_html(&result.target)
    ));
    html.push_str(&format!(
        "<p>{} scan started {}</p>",
        escape_html(&result.scanner),
        escape_html(&timestamp(result.start_time))
    ));
    html.push_str("</header>\n<main>\n");

    html.push_str("<section><h2>Summary</h2><table><tbody>");
    let status = result.status.as_str();
    html.push_str(&format!(
        "<tr><th>Status</th><td class=\"status-{status}\">{status}</td></tr>"
    ));
    let rows = [
        ("Scan ID", result.id.to_string()),
        ("Scanner", result.scanner.clone()),
        ("Duration", result.duration.clone()),
        ("Hosts", result.hosts.len().to_string()),
        ("Ports", result.port_count().to_string()),
    ];
    for (label, value) in rows {
        html.push_str(&format!(
            "<tr><th>{label}</th><td>{}</td></tr>",
            escape_html(&value)
        ));
    }
    html.push_str("</tbody></table></section>\n");

    if let Some(error) = &result.error {
        html.push_str("<section class=\"error\"><h2>Error</h2>");
        html.push_str(&format!("<pre>{}</pre></section>\n", escape_html(error)));
    }

    if result.hosts.is_empty() {
        html.push_str("<section><p>No hosts were discovered.</p></section>\n");
    }
    for host in &result.hosts {
        html.push_str(&render_html_host(host));
    }

    if !result.raw_output.is_empty() {
        html.push_str("<section><details><summary>Raw scanner output</summary>");
        html.push_str(&format!(
            "<pre>{}</pre></details></section>\n",
            escape_html(&result.raw_output)
        ));
    }

    html.push_str("</main>\n<footer>Generated by netrecon</footer>\n</body>\n</html>\n");
    html
}

fn render_html_host(host: &Host) -> String {
    let mut html = String::new();
    html.push_str("<section>");
    let heading = match &host.hostname {
        Some(name) => format!("{} ({name})", host.ip_address),
        None => host.ip_address.to_string(),
    };
    html.push_str(&format!("<h2>{}</h2>", escape_html(&heading)));
    html.push_str(&format!("<p>Status: {}", host.status));
    if let Some(os) = &host.os {
        html.push_str(&format!(
            " &middot; OS: {} ({}%)",
            escape_html(os),
            host.os_confidence
        ));
    }
    html.push_str("</p>");

    if host.ports.is_empty() {
        html.push_str("<p>No ports recorded.</p></section>\n");
        return html;
    }

    html.push_str("<table><thead><tr>");
    for column in ["Port", "State", "Service", "Product", "Version", "Extra Info"] {
        html.push_str(&format!("<th>{column}</th>"));
    }
    html.push_str("</tr></thead><tbody>");
    for port in &host.ports {
        html.push_str("<tr>");
        html.push_str(&format!("<td>{}/{}</td>", port.number, port.protocol));
        html.push_str(&format!("<td>{}</td>", escape_html(port.state.as_str())));
        for value in [&port.service, &port.product, &port.version, &port.extra_info] {
            html.push_str(&format!(
                "<td>{}</td>",
                escape_html(value.as_deref().unwrap_or(""))
            ));
        }
        html.push_str("</tr>");
    }
    html.push_str("</tbody></table></section>\n");
    html
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownFormatter;

impl Formatter for MarkdownFormatter {
    fn format(&self, result: &ScanResult) -> Result<Vec<u8>, FormatError> {
        Ok(render_markdown_report(result).into_bytes())
    }

    fn mime_type(&self) -> &'static str {
        "text/markdown"
    }

    fn extension(&self) -> &'static str {
        "md"
    }
}

fn render_markdown_report(result: &ScanResult) -> String {
    let mut md = String::new();
    md.push_str(&format!("# NetRecon Report: {}\n\n", result.target));
    md.push_str(&format!("- **Scan ID:** {}\n", result.id));
    md.push_str(&format!("- **Scanner:** {}\n", result.scanner));
    md.push_str(&format!("- **Status:** {}\n", result.status));
    md.push_str(&format!("- **Started:** {}\n", timestamp(result.start_time)));
    md.push_str(&format!("- **Duration:** {}\n", result.duration));
    md.push_str(&format!(
        "- **Hosts:** {} ({} ports)\n\n",
        result.hosts.len(),
        result.port_count()
    ));

    if let Some(error) = &result.error {
        md.push_str("## Error\n\n```\n");
        md.push_str(error);
        md.push_str("\n```\n\n");
    }

    if result.hosts.is_empty() {
        md.push_str("No hosts were discovered.\n");
        return md;
    }

    md.push_str("## Hosts\n\n");
    md.push_str("| IP Address | Hostname | Status | OS | Open Ports |\n");
    md.push_str("| --- | --- | --- | --- | --- |\n");
    for host in &result.hosts {
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            host.ip_address,
            sanitize_markdown_cell(host.hostname.as_deref().unwrap_or("")),
            host.status,
            sanitize_markdown_cell(host.os.as_deref().unwrap_or("")),
            host.open_ports().count()
        ));
    }
    md.push('\n');

    for host in result.hosts.iter().filter(|host| !host.ports.is_empty()) {
        md.push_str(&format!("### {}\n\n", host.ip_address));
        md.push_str("| Port | State | Service | Version |\n");
        md.push_str("| --- | --- | --- | --- |\n");
        for port in &host.ports {
            let version = [port.product.as_deref(), port.version.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            md.push_str(&format!(
                "| {}/{} | {} | {} | {} |\n",
                port.number,
                port.protocol,
                sanitize_markdown_cell(port.state.as_str()),
                sanitize_markdown_cell(port.service.as_deref().unwrap_or("")),
                sanitize_markdown_cell(&version)
            ));
        }
        md.push('\n');
    }

    md
}

fn sanitize_markdown_cell(value: &str) -> String {
    let replaced = value.replace('\n', "<br>");
    replaced.replace('|', "\\|")
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn timestamp(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

pub struct FormatterRegistry {
    formatters: BTreeMap<String, Box<dyn Formatter>>,
}

impl FormatterRegistry {
    pub fn new() -> Self {
        Self {
            formatters: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("json", JsonFormatter);
        registry.register("yaml", YamlFormatter);
        registry.register("xml", XmlFormatter);
        registry.register("csv", CsvFormatter);
        registry.register("html", HtmlFormatter);
        registry.register("markdown", MarkdownFormatter);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, formatter: F)
    where
        F: Formatter + 'static,
    {
        self.formatters.insert(name.into(), Box::new(formatter));
    }

    pub fn get(&self, name: &str) -> Result<&dyn Formatter, FormatError> {
        self.formatters
            .get(name)
            .map(|formatter| formatter.as_ref())
            .ok_or_else(|| FormatError::Unknown {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.formatters.keys().cloned().collect()
    }

    pub fn render(&self, result: &ScanResult, format: &str) -> Result<Vec<u8>, FormatError> {
        self.get(format)?.format(result)
    }

    pub fn format_and_save(
        &self,
        result: &ScanResult,
        format: &str,
        path: &Path,
    ) -> Result<(), FormatError> {
        let bytes = self.render(result, format)?;
        let io_error = |source| FormatError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, bytes).map_err(io_error)?;
        info!(path = %path.display(), format, "wrote report");
        Ok(())
    }
}

impl Default for FormatterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub fn hosts_table(result: &ScanResult) -> String {
    let mut table = Table::new();
    table.load_preset(ASCII_FULL);
    table.set_header(vec!["IP Address", "Hostname", "Status", "OS", "Ports"]);

    for host in &result.hosts {
        let ports = host
            .ports
            .iter()
            .map(|port| {
                let mut label = format!("{}/{} {}", port.number, port.protocol, port.state);
                if let Some(service) = &port.service {
                    label.push(' ');
                    label.push_str(service);
                }
                label
            })
            .collect::<Vec<_>>()
            .join("\n");
        table.add_row(vec![
            host.ip_address.to_string(),
            host.hostname.clone().unwrap_or_default(),
            host.status.to_string(),
            host.os.clone().unwrap_or_default(),
            ports,
        ]);
    }

    table.to_string()
}

pub fn targets_table(targets: &[ScanTarget]) -> String {
    let mut table = Table::new();
    table.load_preset(ASCII_FULL);
    table.set_header(vec!["ID", "Target", "Kind", "Description", "Created"]);
    for target in targets {
        table.add_row(vec![
            target.id.to_string(),
            target.target.clone(),
            target.kind.as_str().to_string(),
            target.description.clone(),
            timestamp(target.created_at),
        ]);
    }
    table.to_string()
}

pub fn scans_table(scans: &[ScanRecord]) -> String {
    let mut table = Table::new();
    table.load_preset(ASCII_FULL);
    table.set_header(vec!["ID", "Target", "Scanner", "Status", "Started", "Duration"]);
    for scan in scans {
        table.add_row(vec![
            scan.id.to_string(),
            scan.target.clone(),
            scan.scanner.clone(),
            scan.status.to_string(),
            timestamp(scan.start_time),
            scan.duration.clone(),
        ]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HostStatus, Port, PortState, Protocol};

    fn sample() -> ScanResult {
        let running = ScanResult::start("scanme.example", "nmap");
        let mut host = Host::new(running.id(), "192.0.2.10".parse().expect("ip"));
        host.status = HostStatus::Up;
        host.hostname = Some("scanme.example".to_string());
        host.os = Some("Linux 5.X".to_string());
        host.os_confidence = 95;
        let host_id = host.id;
        let mut http = Port::new(host_id, 80, Protocol::Tcp, PortState::Open);
        http.service = Some("http".to_string());
        http.product = Some("nginx".to_string());
        http.version = Some("1.24.0".to_string());
        host.ports.push(http);
        host.ports
            .push(Port::new(host_id, 25, Protocol::Tcp, PortState::Filtered));

        let other = Host::new(running.id(), "2001:db8::1".parse().expect("ip"));
        running.complete(vec![host, other], "<nmaprun>&</nmaprun>".to_string())
    }

    fn render(format: &str, result: &ScanResult) -> String {
        let registry = FormatterRegistry::with_defaults();
        let bytes = registry.render(result, format).expect("render");
        String::from_utf8(bytes).expect("utf-8 output")
    }

    #[test]
    fn every_format_mentions_target_and_hosts() {
        let result = sample();
        let registry = FormatterRegistry::with_defaults();
        for name in registry.names() {
            let text = render(&name, &result);
            assert!(text.contains("scanme.example"), "{name} lacks target");
            assert!(text.contains("192.0.2.10"), "{name} lacks first host");
            assert!(text.contains("2001:db8::1"), "{name} lacks second host");
        }
    }

    #[test]
    fn default_registry_lists_formats_sorted() {
        assert_eq!(
            FormatterRegistry::with_defaults().names(),
            vec!["csv", "html", "json", "markdown", "xml", "yaml"]
        );
    }

    #[test]
    fn json_output_parses_back() {
        let result = sample();
        let back: ScanResult =
            serde_json::from_str(&render("json", &result)).expect("valid json");
        assert_eq!(back.id, result.id);
        assert_eq!(back.port_count(), 2);
    }

    #[test]
    fn xml_output_is_well_formed_and_escaped() {
        let text = render("xml", &sample());
        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(text.contains("<scanResult>"));
        assert!(text.contains("<port number=\"80\" protocol=\"tcp\" state=\"open\">"));
        assert!(text.contains("&lt;nmaprun&gt;&amp;&lt;/nmaprun&gt;"));

        let mut reader = quick_xml::Reader::from_str(&text);
        loop {
            match reader.read_event().expect("well-formed xml") {
                Event::Eof => break,
                _ => continue,
            }
        }
    }

    #[test]
    fn csv_output_has_summary_host_and_port_blocks() {
        let text = render("csv", &sample());
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());
        let rows: Vec<csv::StringRecord> = reader
            .records()
            .collect::<Result<_, _>>()
            .expect("valid csv");

        assert_eq!(&rows[0][0], "Target");
        assert_eq!(&rows[1][0], "scanme.example");
        assert_eq!(&rows[1][6], "2");
        assert_eq!(&rows[2][0], "IP Address");
        assert_eq!(&rows[3][4], "95");
        let port_rows: Vec<_> = rows.iter().filter(|row| row.len() == 8 && &row[1] == "80").collect();
        assert_eq!(port_rows.len(), 1);
        assert_eq!(&port_rows[0][5], "nginx");
    }

    #[test]
    fn html_output_escapes_content() {
        let mut result = sample();
        result.error = Some("<script>alert(1)</script>".to_string());
        let text = render("html", &result);
        assert!(text.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(!text.contains("<script>"));
        assert!(text.contains("<td>80/tcp</td>"));
    }

    #[test]
    fn markdown_escapes_pipes() {
        let mut result = sample();
        result.hosts[0].os = Some("Linux | BSD".to_string());
        let text = render("markdown", &result);
        assert!(text.contains("Linux \\| BSD"));
        assert!(text.contains("| 80/tcp | open | http | nginx 1.24.0 |"));
    }

    #[test]
    fn unknown_format_lists_available_ones() {
        let err = FormatterRegistry::with_defaults()
            .render(&sample(), "pdf")
            .expect_err("unsupported");
        let message = err.to_string();
        assert!(message.contains("pdf"));
        assert!(message.contains("csv, html, json, markdown, xml, yaml"), "{message}");
    }

    #[test]
    fn format_and_save_writes_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports").join("scan.html");
        FormatterRegistry::with_defaults()
            .format_and_save(&sample(), "html", &path)
            .expect("save report");
        let content = fs::read_to_string(&path).expect("read report");
        assert!(content.starts_with("<!DOCTYPE html>"));
    }

    #[test]
    fn hosts_table_lists_ports() {
        let table = hosts_table(&sample());
        assert!(table.contains("192.0.2.10"));
        assert!(table.contains("80/tcp open http"));
        assert!(table.contains("25/tcp filtered"));
    }

    #[test]
    fn listing_tables_show_ids() {
        let target = ScanTarget::new("10.0.0.0/24", "office");
        let targets = targets_table(std::slice::from_ref(&target));
        assert!(targets.contains(&target.id.to_string()));
        assert!(targets.contains("range"));

        let result = sample();
        let scans = scans_table(&[ScanRecord::from(&result)]);
        assert!(scans.contains(&result.id.to_string()));
        assert!(scans.contains("completed"));
    }
}
