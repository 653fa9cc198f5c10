//! Load config from file and environment. Command-line flags are applied on top by `main`.

use std::path::{Path, PathBuf};

use peerchat_core::{TransportMode, DEFAULT_PORT};
use serde::Deserialize;
use thiserror::Error;

/// Node configuration. File: ~/.config/peerchat/config.toml or /etc/peerchat/config.toml.
/// Env overrides: PEERCHAT_PORT, PEERCHAT_TRANSPORT, PEERCHAT_LOG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listening port for both transports (default 8129).
    #[serde(default = "default_port")]
    pub port: u16,
    /// `stream` or `datagram` (default stream).
    #[serde(default)]
    pub transport: TransportMode,
    /// Log filter used when RUST_LOG is unset (default "warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            transport: TransportMode::default(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = load_file(&config_paths())?.unwrap_or_default();
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    Ok(c)
}

/// Apply PEERCHAT_* overrides read through `lookup`.
fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(s) = lookup("PEERCHAT_PORT") {
        c.port = s.parse().map_err(|_| ConfigError::Env {
            var: "PEERCHAT_PORT",
            value: s.clone(),
        })?;
    }
    if let Some(s) = lookup("PEERCHAT_TRANSPORT") {
        c.transport = s.parse().map_err(|_| ConfigError::Env {
            var: "PEERCHAT_TRANSPORT",
            value: s.clone(),
        })?;
    }
    if let Some(s) = lookup("PEERCHAT_LOG") {
        c.log_level = s;
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerchat/config.toml"));
    out
}

/// First existing file wins; later paths are not consulted.
fn load_file(paths: &[PathBuf]) -> Result<Option<Config>, ConfigError> {
    match paths.iter().find(|p| p.exists()) {
        Some(p) => parse_file(p).map(Some),
        None => Ok(None),
    }
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("peerchat-{}-{name}.toml", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.port, 8129);
        assert_eq!(c.transport, TransportMode::Stream);
        assert_eq!(c.log_level, "warn");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("transport = \"datagram\"").unwrap();
        assert_eq!(c.transport, TransportMode::Datagram);
        assert_eq!(c.port, DEFAULT_PORT);
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("PEERCHAT_PORT", "9000"),
                ("PEERCHAT_TRANSPORT", "udp"),
                ("PEERCHAT_LOG", "debug"),
            ]),
        )
        .unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.transport, TransportMode::Datagram);
        assert_eq!(c.log_level, "debug");
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut c = Config::default();
        let err = apply_env(&mut c, env(&[("PEERCHAT_PORT", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "PEERCHAT_PORT", .. }));
        assert_eq!(c.port, DEFAULT_PORT);
    }

    #[test]
    fn first_existing_file_wins() {
        let missing = std::env::temp_dir().join("peerchat-does-not-exist.toml");
        let first = temp_file("first", "port = 7000\n");
        let second = temp_file("second", "port = 7001\n");
        let c = load_file(&[missing, first.clone(), second.clone()])
            .unwrap()
            .unwrap();
        assert_eq!(c.port, 7000);
        let _ = std::fs::remove_file(first);
        let _ = std::fs::remove_file(second);
    }

    #[test]
    fn malformed_file_reports_path() {
        let path = temp_file("broken", "port = \"not a number\"\n");
        let err = load_file(&[path.clone()]).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("peerchat-"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn no_file_is_not_an_error() {
        let missing = std::env::temp_dir().join("peerchat-also-missing.toml");
        assert!(load_file(&[missing]).unwrap().is_none());
    }
}
