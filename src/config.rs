//! Runtime settings for the windowed read runner.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::query::time::{Bounds, Window};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid window: every must not be zero")]
    ZeroStep,
}

/// Settings for one windowed read, loaded from JSON
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub organization: String,
    pub bucket: String,
    pub hosts: Vec<String>,
    /// Memory ceiling in bytes; zero means unlimited
    pub ram_limit: u64,
    /// Window step in nanoseconds
    pub every: i64,
    /// Window length in nanoseconds
    pub period: i64,
    pub start: i64,
    pub stop: i64,
    pub aggregate_method: String,
    pub metrics_addr: Option<SocketAddr>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            organization: "default".to_string(),
            bucket: "default".to_string(),
            hosts: vec!["localhost:8082".to_string()],
            ram_limit: 0,
            every: 60_000_000_000, // 1 minute
            period: 60_000_000_000,
            start: 0,
            stop: 600_000_000_000, // 10 minutes
            aggregate_method: String::new(),
            metrics_addr: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn from_json(input: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_json::from_str(input)?;
        settings.check()?;
        Ok(settings)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    fn check(&self) -> Result<(), SettingsError> {
        if self.every == 0 {
            return Err(SettingsError::ZeroStep);
        }
        Ok(())
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.start, self.stop)
    }

    pub fn window(&self) -> Window {
        Window::new(self.every, self.period)
    }

    pub fn ram_limit(&self) -> Option<usize> {
        match self.ram_limit {
            0 => None,
            limit => Some(usize::try_from(limit).unwrap_or(usize::MAX)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = Settings::from_json(r#"{"bucket": "telegraf", "every": 10, "period": 20}"#).unwrap();

        assert_eq!(settings.bucket, "telegraf");
        assert_eq!(settings.organization, "default");
        assert_eq!(settings.window(), Window::new(10, 20));
        assert_eq!(settings.ram_limit(), None);
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(matches!(
            Settings::from_json(r#"{"every": 0}"#),
            Err(SettingsError::ZeroStep)
        ));
        assert!(matches!(
            Settings::from_json("not json"),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"organization": "acme", "start": 0, "stop": 100, "ram_limit": 4096, "metrics_addr": "127.0.0.1:9090"}}"#
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.organization, "acme");
        assert_eq!(settings.bounds(), Bounds::new(0, 100));
        assert_eq!(settings.ram_limit(), Some(4096));
        assert_eq!(settings.metrics_addr, Some("127.0.0.1:9090".parse().unwrap()));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Settings::from_file("/nonexistent/settings.json"),
            Err(SettingsError::Io(_))
        ));
    }
}
