use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const MAX_RATE: u32 = 100_000;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid port format: {0}")]
    InvalidPorts(String),
    #[error("ports must be specified for {0}")]
    MissingPorts(&'static str),
    #[error("invalid timing template: {value} (must be {min}-{max})")]
    InvalidTiming { value: String, min: i64, max: i64 },
    #[error("rate too high: {rate} (max {max})")]
    RateTooHigh { rate: u32, max: u32 },
    #[error("failed to split arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanConfig {
    #[serde(default)]
    pub ports: Option<String>,
    #[serde(default)]
    pub timing: Option<String>,
    /// Appended verbatim after every built-in argument.
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub rate: Option<u32>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ScanConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ports(mut self, ports: impl Into<String>) -> Self {
        self.ports = Some(ports.into());
        self
    }

    pub fn with_timing(mut self, timing: impl Into<String>) -> Self {
        self.timing = Some(timing.into());
        self
    }

    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_argument_line(mut self, line: &str) -> Result<Self, ConfigError> {
        self.arguments = shell_words::split(line)
            .map_err(|err| ConfigError::InvalidArguments(err.to_string()))?;
        Ok(self)
    }

    /// Like [`ScanConfig::with_argument_line`], but keeps the arguments
    /// already present and adds these after them.
    pub fn extend_argument_line(mut self, line: &str) -> Result<Self, ConfigError> {
        let extra = shell_words::split(line)
            .map_err(|err| ConfigError::InvalidArguments(err.to_string()))?;
        self.arguments.extend(extra);
        Ok(self)
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn port_spec(&self) -> Option<&str> {
        self.ports.as_deref().filter(|ports| !ports.is_empty())
    }

    pub fn timing_spec(&self) -> Option<&str> {
        self.timing.as_deref().filter(|timing| !timing.is_empty())
    }

    pub fn option_enabled(&self, key: &str) -> bool {
        matches!(
            self.options.get(key).map(|value| value.trim().to_ascii_lowercase()),
            Some(value) if matches!(value.as_str(), "1" | "true" | "yes" | "on")
        )
    }
}

/// Checks `ports` against the grammar `N[-N](,N[-N])*` with every `N` in
/// 1-65535 and ranges in ascending order.
pub fn validate_port_spec(ports: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidPorts(ports.to_string());

    for item in ports.split(',') {
        match item.split_once('-') {
            Some((start, end)) => {
                let start = port_number(start).ok_or_else(invalid)?;
                let end = port_number(end).ok_or_else(invalid)?;
                if start > end {
                    return Err(invalid());
                }
            }
            None => {
                port_number(item).ok_or_else(invalid)?;
            }
        }
    }
    Ok(())
}

fn port_number(value: &str) -> Option<u16> {
    if !is_digits(value) {
        return None;
    }
    value.parse::<u16>().ok().filter(|&port| port != 0)
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit())
}

pub fn validate_timing(timing: &str, min: i64, max: i64) -> Result<(), ConfigError> {
    let value = is_digits(timing)
        .then(|| timing.parse::<i64>().ok())
        .flatten();
    match value {
        Some(value) if (min..=max).contains(&value) => Ok(()),
        _ => Err(ConfigError::InvalidTiming {
            value: timing.to_string(),
            min,
            max,
        }),
    }
}
