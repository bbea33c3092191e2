pub mod config;
pub mod masscan;
pub mod model;
pub mod nmap;
pub mod output;
pub mod process;
pub mod scanner;
pub mod settings;
pub mod store;

pub use config::{validate_port_spec, validate_timing, ConfigError, ScanConfig, MAX_RATE};
pub use masscan::{parse_masscan_json, MasscanScanner};
pub use model::{
    Host, HostStatus, Port, PortState, Protocol, RunningScan, ScanResult, ScanStatus,
    ScanTarget, Severity, TargetKind, Vulnerability,
};
pub use nmap::{parse_nmap_xml, NmapParseError, NmapScanner};
pub use output::{
    hosts_table, scans_table, targets_table, FormatError, Formatter, FormatterRegistry,
};
pub use process::{ExecError, Invocation, ProcessOutput, Termination};
pub use scanner::{ScanError, Scanner, ScannerRegistry, ToolNotFound};
pub use settings::{Preset, Settings, SettingsError};
pub use store::{
    load_scan_result, save_scan_result, Repository, ScanRecord, SqliteStore, StoreError,
};
