//! Configuration file loading.
//!
//! Grounded on `alpenhorn/common/config.py`: a fixed search order of YAML
//! files, recursively merged (dicts merge key-by-key, lists concatenate,
//! everything else is replaced by the later file), plus the
//! `ALPENHORN_CONFIG_FILE` environment variable and a CLI-supplied path.
//!
//! The merge itself is implemented directly over `serde_yaml::Value`
//! (mirroring `merge_dict_tree`) rather than relying on the `config` crate's
//! own layering, since `config`'s default array behaviour is "replace", not
//! "concatenate".

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::util::parse_bytesize;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: String::new() }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SyslogConfig {
    pub enable: bool,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub facility: Option<String>,
    pub use_tcp: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FileLogConfig {
    pub name: Option<String>,
    pub watch: bool,
    pub rotate: bool,
    pub backup_count: u32,
    /// Raw string as written in the config file (e.g. "4M"); use
    /// [`FileLogConfig::max_bytes`] to get the parsed value.
    pub max_bytes: String,
}

impl FileLogConfig {
    pub fn max_bytes(&self) -> Result<i64> {
        if self.max_bytes.is_empty() {
            return Ok(4 * 1024 * 1024);
        }
        parse_bytesize(&self.max_bytes)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub module_levels: HashMap<String, String>,
    pub syslog: SyslogConfig,
    pub file: FileLogConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: Option<String>,
    pub num_workers: u32,
    pub update_interval: u64,
    pub auto_import_interval: u64,
    pub auto_verify_min_days: u64,
    pub serial_io_timeout: u64,
    pub pull_timeout_base: u64,
    pub pull_bytes_per_second: u64,
    pub prom_client_port: u16,
    pub update_skew_threshold: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: None,
            num_workers: 4,
            update_interval: 60,
            auto_import_interval: 30,
            auto_verify_min_days: 7,
            serial_io_timeout: 900,
            pull_timeout_base: 300,
            pull_bytes_per_second: 20_000_000,
            prom_client_port: 0,
            update_skew_threshold: 4,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub extensions: Vec<String>,
    pub logging: LoggingConfig,
    pub daemon: DaemonConfig,
}

/// The standard, increasing-precedence search order for config files,
/// excluding the environment variable and CLI-supplied path (added by
/// the caller of [`load`]).
pub fn standard_search_path() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("/etc/alpenhorn/alpenhorn.conf"),
        PathBuf::from("/etc/xdg/alpenhorn/alpenhorn.conf"),
    ];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/alpenhorn/alpenhorn.conf"));
    }
    paths
}

/// Load and merge configuration from the standard search path, the
/// `ALPENHORN_CONFIG_FILE` environment variable (if set) and an optional
/// CLI-supplied path, in that increasing-precedence order.
///
/// Returns [`Error::NoConfigFound`] if none of the candidate paths exist.
pub fn load(cli_conf: Option<&Path>) -> Result<Config> {
    let mut candidates = standard_search_path();
    if let Ok(env_path) = std::env::var("ALPENHORN_CONFIG_FILE") {
        if !env_path.is_empty() {
            candidates.push(PathBuf::from(env_path));
        }
    }
    if let Some(cli) = cli_conf {
        candidates.push(cli.to_path_buf());
    }

    let mut merged = Value::Mapping(Default::default());
    let mut found_any = false;

    for path in candidates {
        if !path.exists() {
            continue;
        }
        found_any = true;
        tracing::info!(path = %path.display(), "loading config file");
        let contents = std::fs::read_to_string(&path)?;
        let doc: Value = serde_yaml::from_str(&contents)?;
        merged = merge_values(merged, doc);
    }

    if !found_any {
        return Err(Error::NoConfigFound);
    }

    let config: Config = serde_yaml::from_value(merged)?;

    if !config.database.url.is_empty() {
        url::Url::parse(&config.database.url).map_err(|_| Error::InvalidDatabaseUrl(config.database.url.clone()))?;
    }

    Ok(config)
}

/// Merge two YAML values per `alpenhorn`'s `merge_dict_tree`: mappings
/// merge recursively key-by-key, sequences concatenate (`a` then `b`),
/// and anything else (including type mismatches) is replaced by `b`.
fn merge_values(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Mapping(a), Value::Mapping(mut b)) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, av) in a {
                if let Some(bv) = b.remove(&k) {
                    out.insert(k, merge_values(av, bv));
                } else {
                    out.insert(k, av);
                }
            }
            for (k, bv) in b {
                out.insert(k, bv);
            }
            Value::Mapping(out)
        }
        (Value::Sequence(mut a), Value::Sequence(b)) => {
            a.extend(b);
            Value::Sequence(a)
        }
        (_, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_recurses_dicts_and_concatenates_lists() {
        let a: Value = serde_yaml::from_str(
            "daemon:\n  host: a\n  num_workers: 1\nextensions: [one]\n",
        )
        .unwrap();
        let b: Value = serde_yaml::from_str(
            "daemon:\n  host: b\nextensions: [two]\n",
        )
        .unwrap();
        let merged = merge_values(a, b);
        let cfg: Config = serde_yaml::from_value(merged).unwrap();
        assert_eq!(cfg.daemon.host.as_deref(), Some("b"));
        assert_eq!(cfg.daemon.num_workers, 1);
        assert_eq!(cfg.extensions, vec!["one", "two"]);
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var("ALPENHORN_CONFIG_FILE");
        let result = load(Some(&dir.path().join("nonexistent.conf")));
        assert!(matches!(result, Err(Error::NoConfigFound)));
    }
}
