use crate::config::ConfigError;
use crate::masscan::MasscanScanner;
use crate::model::{Host, ScanResult};
use crate::nmap::NmapScanner;
use crate::process::{self, ExecError, Invocation};
use crate::settings::ScannerSettings;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub use crate::config::ScanConfig;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// The tool itself failed. The finalized `failed` result is kept so
    /// callers can still report or persist it.
    #[error("{} scan of {} failed: {source}", .result.scanner, .result.target)]
    Execution {
        result: Box<ScanResult>,
        #[source]
        source: ExecError,
    },
}

impl ScanError {
    pub fn result(&self) -> Option<&ScanResult> {
        match self {
            ScanError::Execution { result, .. } => Some(result),
            ScanError::InvalidConfig(_) => None,
        }
    }

    pub fn into_result(self) -> Option<ScanResult> {
        match self {
            ScanError::Execution { result, .. } => Some(*result),
            ScanError::InvalidConfig(_) => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{tool} not found (looked for '{looked_for}')")]
pub struct ToolNotFound {
    pub tool: &'static str,
    pub looked_for: String,
}

#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;

    fn validate_config(&self, config: &ScanConfig) -> Result<(), ConfigError>;

    /// Invalid configuration and tool failures are returned as errors; output
    /// that cannot be parsed yields `Ok` with a `completed_with_errors` result.
    async fn scan(
        &self,
        cancel: &CancellationToken,
        target: &str,
        config: &ScanConfig,
    ) -> Result<ScanResult, ScanError>;
}

/// Steps shared by every adapter once the argument vector is built: run the
/// tool, keep its stdout, then finalize according to how it ended.
pub(crate) async fn execute<E, F>(
    scanner: &str,
    target: &str,
    invocation: Invocation,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    parse: F,
) -> Result<ScanResult, ScanError>
where
    E: fmt::Display,
    F: FnOnce(Uuid, &str) -> Result<Vec<Host>, E>,
{
    let running = ScanResult::start(target, scanner);
    info!(scanner, target, scan_id = %running.id(), "starting scan");

    let output = match process::run(&invocation, cancel, timeout).await {
        Ok(output) => output,
        Err(source) => {
            let result = running.fail(String::new(), &source);
            warn!(scanner, target, error = %source, "scanner could not be run");
            return Err(ScanError::Execution {
                result: Box::new(result),
                source,
            });
        }
    };

    let raw_output = output.stdout_lossy();
    if let Err(source) = output.check() {
        let result = running.fail(raw_output, &source);
        warn!(scanner, target, error = %source, "scanner failed");
        return Err(ScanError::Execution {
            result: Box::new(result),
            source,
        });
    }

    match parse(running.id(), &raw_output) {
        Ok(hosts) => {
            let result = running.complete(hosts, raw_output);
            info!(
                scanner,
                target,
                hosts = result.hosts.len(),
                ports = result.port_count(),
                duration = %result.duration,
                "scan completed"
            );
            Ok(result)
        }
        Err(err) => {
            warn!(scanner, target, error = %err, "scanner output could not be parsed");
            Ok(running.complete_with_errors(raw_output, err))
        }
    }
}

#[derive(Default, Clone)]
pub struct ScannerRegistry {
    scanners: HashMap<String, Arc<dyn Scanner>>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discover(settings: &ScannerSettings) -> Self {
        let mut registry = Self::new();

        match NmapScanner::locate(settings.nmap_path.as_deref()) {
            Ok(scanner) => {
                registry.register(scanner);
            }
            Err(err) => warn!("nmap scanner not available: {err}"),
        }

        match MasscanScanner::locate(settings.masscan_path.as_deref()) {
            Ok(scanner) => {
                registry.register(scanner);
            }
            Err(err) => warn!("masscan scanner not available: {err}"),
        }

        registry
    }

    pub fn register<S>(&mut self, scanner: S) -> Option<Arc<dyn Scanner>>
    where
        S: Scanner + 'static,
    {
        self.register_arc(Arc::new(scanner))
    }

    pub fn register_arc(&mut self, scanner: Arc<dyn Scanner>) -> Option<Arc<dyn Scanner>> {
        self.scanners.insert(scanner.name().to_string(), scanner)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scanner>> {
        self.scanners.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scanners.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scanners.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.scanners.is_empty()
    }
}

impl fmt::Debug for ScannerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannerRegistry")
            .field("scanners", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScanStatus;

    struct FixedScanner {
        name: &'static str,
        marker: &'static str,
    }

    #[async_trait]
    impl Scanner for FixedScanner {
        fn name(&self) -> &str {
            self.name
        }

        fn validate_config(&self, _config: &ScanConfig) -> Result<(), ConfigError> {
            Ok(())
        }

        async fn scan(
            &self,
            _cancel: &CancellationToken,
            target: &str,
            _config: &ScanConfig,
        ) -> Result<ScanResult, ScanError> {
            Ok(ScanResult::start(target, self.name).complete(Vec::new(), self.marker.to_string()))
        }
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let mut registry = ScannerRegistry::new();
        assert!(registry
            .register(FixedScanner {
                name: "stub",
                marker: "first",
            })
            .is_none());
        let displaced = registry.register(FixedScanner {
            name: "stub",
            marker: "second",
        });
        assert!(displaced.is_some());
        assert_eq!(registry.names(), vec!["stub".to_string()]);

        let scanner = registry.get("stub").expect("registered");
        let result = scanner
            .scan(&CancellationToken::new(), "10.0.0.1", &ScanConfig::new())
            .await
            .expect("scan");
        assert_eq!(result.raw_output, "second");
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = ScannerRegistry::new();
        assert!(registry.get("nmap").is_none());
        assert!(!registry.contains("nmap"));
        assert!(registry.is_empty());
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = ScannerRegistry::new();
        registry.register(FixedScanner {
            name: "zeta",
            marker: "",
        });
        registry.register(FixedScanner {
            name: "alpha",
            marker: "",
        });
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn discovery_tolerates_missing_tools() {
        let settings = ScannerSettings {
            nmap_path: Some("/nonexistent/nmap".to_string()),
            masscan_path: Some("/nonexistent/masscan".to_string()),
            ..ScannerSettings::default()
        };
        let registry = ScannerRegistry::discover(&settings);
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn discovery_registers_tools_that_exist() {
        let settings = ScannerSettings {
            nmap_path: Some("sh".to_string()),
            masscan_path: Some("/nonexistent/masscan".to_string()),
            ..ScannerSettings::default()
        };
        let registry = ScannerRegistry::discover(&settings);
        assert_eq!(registry.names(), vec!["nmap"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unparseable_output_completes_with_errors() {
        let invocation = Invocation::new("echo", vec!["not a report".to_string()]);
        let result = execute(
            "stub",
            "10.0.0.1",
            invocation,
            &CancellationToken::new(),
            None,
            |_, _| Err::<Vec<Host>, _>("no hosts in output"),
        )
        .await
        .expect("parse failures are not caller errors");

        assert_eq!(result.status, ScanStatus::CompletedWithErrors);
        assert_eq!(result.error.as_deref(), Some("no hosts in output"));
        assert_eq!(result.raw_output, "not a report\n");
        assert!(result.hosts.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_failure_is_reported_twice() {
        let invocation = Invocation::new("false", Vec::new());
        let err = execute(
            "stub",
            "10.0.0.1",
            invocation,
            &CancellationToken::new(),
            None,
            |_, _| Ok::<_, String>(Vec::new()),
        )
        .await
        .expect_err("non-zero exit");

        assert!(matches!(err, ScanError::Execution { .. }));
        let result = err.into_result().expect("failed result attached");
        assert_eq!(result.status, ScanStatus::Failed);
        assert!(result.hosts.is_empty());
        assert!(result.error.is_some());
        assert!(result.end_time.is_some());
    }
}
