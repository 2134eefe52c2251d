//! Server configuration
//!
//! YAML configuration with defaults for every field, so a missing file or a
//! partial file both produce a runnable server.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub requirepass: String,
    pub slave_readonly: bool,
    pub max_backup_to_keep: u32,
    pub max_backup_keep_hours: u32,
    /// Microseconds; negative disables the slowlog, 0 logs everything
    pub slowlog_log_slower_than: i64,
    pub slowlog_max_len: usize,
    /// token -> namespace
    pub tokens: HashMap<String, String>,
    pub profiling: ProfilingConfig,
    pub storage: storage::Config,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 6666,
            requirepass: String::new(),
            slave_readonly: true,
            max_backup_to_keep: 1,
            max_backup_keep_hours: 0,
            slowlog_log_slower_than: 200_000,
            slowlog_max_len: 128,
            tokens: HashMap::new(),
            profiling: ProfilingConfig::default(),
            storage: storage::Config::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Token registered for a namespace, when one exists
    pub fn token_of_namespace(&self, namespace: &str) -> Option<String> {
        self.tokens
            .iter()
            .find(|(_, ns)| ns.as_str() == namespace)
            .map(|(token, _)| token.clone())
    }

    pub fn add_namespace(&mut self, namespace: &str, token: &str) -> Result<(), String> {
        validate_namespace(namespace)?;
        if self.tokens.contains_key(token) {
            return Err("the token has already been used".to_string());
        }
        self.tokens.insert(token.to_string(), namespace.to_string());
        Ok(())
    }

    pub fn set_namespace(&mut self, namespace: &str, token: &str) -> Result<(), String> {
        validate_namespace(namespace)?;
        if self.token_of_namespace(namespace).is_none() {
            return Err("the namespace was not found".to_string());
        }
        self.tokens.retain(|_, ns| ns.as_str() != namespace);
        self.tokens.insert(token.to_string(), namespace.to_string());
        Ok(())
    }

    pub fn del_namespace(&mut self, namespace: &str) -> Result<(), String> {
        let before = self.tokens.len();
        self.tokens.retain(|_, ns| ns.as_str() != namespace);
        if self.tokens.len() == before {
            return Err("the namespace was not found".to_string());
        }
        Ok(())
    }
}

/// Namespaces are length-prefixed on disk with one byte, and the prefix-range
/// trick in FlushDB bumps the last byte, so the charset stays printable ASCII
fn validate_namespace(namespace: &str) -> Result<(), String> {
    if namespace.is_empty() || namespace.len() > 255 {
        return Err("the namespace size must be in (0, 255]".to_string());
    }
    if namespace == storage::DEFAULT_NAMESPACE {
        return Err("the namespace is reserved".to_string());
    }
    if !namespace
        .bytes()
        .all(|b| b.is_ascii_graphic() && b != b'{' && b != b'}')
    {
        return Err("the namespace contains illegal characters".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    /// 0 never profiles, 100 always profiles
    pub sample_ratio: u32,
    /// Samples faster than this are dropped; 0 keeps everything
    pub sample_record_threshold_ms: u32,
    pub sample_record_max_len: usize,
    pub sample_commands: HashSet<String>,
    pub sample_all_commands: bool,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            sample_ratio: 0,
            sample_record_threshold_ms: 0,
            sample_record_max_len: 256,
            sample_commands: HashSet::new(),
            sample_all_commands: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn, error
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.port, 6666);
        assert!(config.slave_readonly);
        assert_eq!(config.storage.max_db_size, 0);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let config = Config::from_yaml(
            "port: 7000\nrequirepass: secret\nstorage:\n  max_db_size: 2\n  rocksdb:\n    write_buffer_size: 1048576\n",
        )
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.requirepass, "secret");
        assert_eq!(config.storage.max_db_size, 2);
        assert_eq!(config.storage.rocksdb.write_buffer_size, 1048576);
        // untouched fields keep their defaults
        assert_eq!(config.storage.rocksdb.max_open_files, 4096);
    }

    #[test]
    fn test_namespace_management() {
        let mut config = Config::default();
        config.add_namespace("ns1", "token1").unwrap();
        assert!(config.add_namespace("ns2", "token1").is_err());
        assert_eq!(config.tokens.get("token1"), Some(&"ns1".to_string()));

        config.set_namespace("ns1", "token9").unwrap();
        assert!(config.tokens.get("token1").is_none());
        assert_eq!(config.tokens.get("token9"), Some(&"ns1".to_string()));

        assert!(config.set_namespace("missing", "t").is_err());
        config.del_namespace("ns1").unwrap();
        assert!(config.del_namespace("ns1").is_err());
    }

    #[test]
    fn test_namespace_validation() {
        let mut config = Config::default();
        assert!(config.add_namespace("", "t").is_err());
        assert!(config.add_namespace(storage::DEFAULT_NAMESPACE, "t").is_err());
        assert!(config.add_namespace("has space", "t").is_err());
        assert!(config.add_namespace("{tagged}", "t").is_err());
    }
}
