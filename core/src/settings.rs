use crate::config::{ConfigError, ScanConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const ENV_PREFIX: &str = "NETRECON_";

const FILE_NAME: &str = "netrecon.toml";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("config file {0} does not exist")]
    Missing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to encode settings: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid value for {var}: '{value}'")]
    InvalidEnv { var: String, value: String },
    #[error("no home directory to place the config file in")]
    NoHome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub scanner: ScannerSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// `text` or `compact`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScannerSettings {
    /// Seconds; 0 disables the deadline.
    pub default_timeout: u64,
    pub max_rate: u32,
    pub default_ports: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nmap_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masscan_path: Option<String>,
    pub presets: BTreeMap<String, Preset>,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            default_timeout: 300,
            max_rate: 1000,
            default_ports: "1-1000".to_string(),
            nmap_path: None,
            masscan_path: None,
            presets: BTreeMap::new(),
        }
    }
}

impl ScannerSettings {
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout > 0).then(|| Duration::from_secs(self.default_timeout))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Preset {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<String>,
}

impl Preset {
    pub fn apply(&self, mut config: ScanConfig) -> Result<ScanConfig, ConfigError> {
        if let Some(ports) = &self.ports {
            config.ports = Some(ports.clone());
        }
        if let Some(timing) = &self.timing {
            config.timing = Some(timing.clone());
        }
        if let Some(arguments) = &self.arguments {
            config = config.with_argument_line(arguments)?;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageSettings {
    pub dir: PathBuf,
}

impl StorageSettings {
    pub fn database_path(&self) -> PathBuf {
        self.dir.join("netrecon.db")
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            dir: base.join(".netrecon").join("data"),
        }
    }
}

impl Settings {
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match explicit {
            Some(path) if !path.exists() => return Err(SettingsError::Missing(path.to_path_buf())),
            Some(path) => Self::from_file(path)?,
            None => match search_paths().into_iter().find(|path| path.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("no config file found, using defaults");
                    Self::default()
                }
            },
        };
        settings.apply_env(|var| std::env::var(var).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Ok(settings)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let var = format!("{ENV_PREFIX}{name}");
            lookup(&var).map(|value| (var, value))
        };

        if let Some((_, value)) = get("LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some((_, value)) = get("LOG_FORMAT") {
            self.logging.format = value;
        }
        if let Some((_, value)) = get("STORAGE_DIR") {
            self.storage.dir = PathBuf::from(value);
        }
        if let Some((var, value)) = get("DEFAULT_TIMEOUT") {
            self.scanner.default_timeout = parse_env(var, value)?;
        }
        if let Some((var, value)) = get("MAX_RATE") {
            self.scanner.max_rate = parse_env(var, value)?;
        }
        if let Some((_, value)) = get("DEFAULT_PORTS") {
            self.scanner.default_ports = value;
        }
        if let Some((_, value)) = get("NMAP_PATH") {
            self.scanner.nmap_path = Some(value);
        }
        if let Some((_, value)) = get("MASSCAN_PATH") {
            self.scanner.masscan_path = Some(value);
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let write_error = |source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        fs::write(path, self.to_toml()?).map_err(write_error)
    }

    /// `~/.netrecon/config.toml`
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        dirs::home_dir()
            .map(|home| home.join(".netrecon").join("config.toml"))
            .ok_or(SettingsError::NoHome)
    }
}

fn parse_env<T: std::str::FromStr>(var: String, value: String) -> Result<T, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidEnv { var, value })
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(FILE_NAME),
        Path::new("configs").join(FILE_NAME),
    ];
    if let Ok(home) = Settings::default_path() {
        paths.push(home);
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.logging.format, "text");
        assert_eq!(settings.scanner.default_timeout, 300);
        assert_eq!(settings.scanner.max_rate, 1000);
        assert_eq!(settings.scanner.default_ports, "1-1000");
        assert_eq!(
            settings.scanner.default_timeout(),
            Some(Duration::from_secs(300))
        );
        assert!(settings.storage.dir.ends_with(".netrecon/data"));
        assert!(settings
            .storage
            .database_path()
            .ends_with(".netrecon/data/netrecon.db"));
    }

    #[test]
    fn file_values_fill_in_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("netrecon.toml");
        fs::write(
            &path,
            r#"
[logging]
level = "debug"

[scanner]
default_ports = "22,80,443"
nmap_path = "/opt/nmap/bin/nmap"

[scanner.presets.web]
scanner = "nmap"
ports = "80,443,8080"
arguments = "--script http-title -Pn"
timing = "4"
"#,
        )
        .expect("write config");

        let settings = Settings::from_file(&path).expect("load");
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.logging.format, "text");
        assert_eq!(settings.scanner.default_ports, "22,80,443");
        assert_eq!(settings.scanner.default_timeout, 300);
        assert_eq!(
            settings.scanner.nmap_path.as_deref(),
            Some("/opt/nmap/bin/nmap")
        );

        let web = &settings.scanner.presets["web"];
        assert_eq!(web.scanner.as_deref(), Some("nmap"));
        let config = web.apply(ScanConfig::new()).expect("apply preset");
        assert_eq!(config.ports.as_deref(), Some("80,443,8080"));
        assert_eq!(config.timing.as_deref(), Some("4"));
        assert_eq!(config.arguments, vec!["--script", "http-title", "-Pn"]);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[scanner\nmax_rate = ").expect("write config");
        assert!(matches!(
            Settings::from_file(&path),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            Settings::load(Some(&path)),
            Err(SettingsError::Missing(_))
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[
                ("NETRECON_LOG_LEVEL", "warn"),
                ("NETRECON_STORAGE_DIR", "/var/lib/netrecon"),
                ("NETRECON_DEFAULT_TIMEOUT", "0"),
                ("NETRECON_MAX_RATE", "25000"),
                ("NETRECON_MASSCAN_PATH", "/usr/local/bin/masscan"),
                ("UNRELATED", "ignored"),
            ]))
            .expect("apply env");

        assert_eq!(settings.logging.level, "warn");
        assert_eq!(settings.storage.dir, PathBuf::from("/var/lib/netrecon"));
        assert_eq!(settings.scanner.default_timeout(), None);
        assert_eq!(settings.scanner.max_rate, 25000);
        assert_eq!(
            settings.scanner.masscan_path.as_deref(),
            Some("/usr/local/bin/masscan")
        );
        assert_eq!(settings.scanner.default_ports, "1-1000");
    }

    #[test]
    fn malformed_numeric_override_is_rejected() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(env(&[("NETRECON_MAX_RATE", "fast")]))
            .expect_err("not a number");
        match err {
            SettingsError::InvalidEnv { var, value } => {
                assert_eq!(var, "NETRECON_MAX_RATE");
                assert_eq!(value, "fast");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let mut settings = Settings::default();
        settings.scanner.max_rate = 5000;
        settings.scanner.presets.insert(
            "quick".to_string(),
            Preset {
                scanner: Some("masscan".to_string()),
                ports: Some("1-100".to_string()),
                ..Preset::default()
            },
        );
        settings.save(&path).expect("save");

        let loaded = Settings::from_file(&path).expect("load");
        assert_eq!(loaded, settings);
    }
}
