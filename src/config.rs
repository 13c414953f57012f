use std::fs;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Server properties, loaded from a YAML file. Every key has a default so
/// a partial (or absent) file still yields a runnable configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub address: String,
    pub max_connect: u32,
    /// Idle connection timeout in seconds. Zero disables it.
    pub timeout: u64,
    pub appendonly: bool,
    pub appendfilename: String,
    pub requirepass: Option<String>,
    pub logging: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogSettings {
    pub path: String,
    pub name: String,
    pub ext: String,
    /// chrono strftime pattern stamped into the log file name.
    pub time_format: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            address: "0.0.0.0:6399".to_string(),
            max_connect: 128,
            timeout: 0,
            appendonly: false,
            appendfilename: "appendonly.aof".to_string(),
            requirepass: None,
            logging: LogSettings::default(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> LogSettings {
        LogSettings {
            path: "logs".to_string(),
            name: "rudis".to_string(),
            ext: "log".to_string(),
            time_format: "%Y-%m-%d".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn timeout_duration(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

/// Reads the config file at `path`. A malformed file is an error; the
/// caller decides whether a missing file falls back to defaults.
pub fn load(path: &str) -> Result<ServerConfig> {
    let raw = fs::read_to_string(path)?;
    serde_yaml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_kebab_case_keys() {
        let yaml = "\
address: 127.0.0.1:6399
max-connect: 64
timeout: 30
appendonly: true
appendfilename: test.aof
logging:
  path: /tmp/rudis-logs
  name: rudis
  ext: log
  time-format: '%Y-%m-%d'
";
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        let cfg = load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.address, "127.0.0.1:6399");
        assert_eq!(cfg.max_connect, 64);
        assert!(cfg.appendonly);
        assert_eq!(cfg.appendfilename, "test.aof");
        assert_eq!(cfg.logging.path, "/tmp/rudis-logs");
        assert_eq!(cfg.timeout_duration(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"appendonly: true\n").unwrap();
        let cfg = load(f.path().to_str().unwrap()).unwrap();
        assert!(cfg.appendonly);
        assert_eq!(cfg.address, "0.0.0.0:6399");
        assert_eq!(cfg.appendfilename, "appendonly.aof");
        assert!(cfg.requirepass.is_none());
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(load("/definitely/not/here.yaml").is_err());
    }
}
