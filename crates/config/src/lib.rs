// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Loads the relay's YAML configuration.
//!
//! The file is discovered by walking parent directories looking for a
//! project root marker, mirroring how the original Python implementation's
//! `loadconfig.py` walked upward for a directory literally named
//! `neuro-relay` and read `src/resources/authentication.yaml` beneath it.
//! This version generalises the marker to either a `relay.yaml` file
//! directly, or that same `neuro-relay/src/resources/authentication.yaml`
//! layout, so existing deployments keep working.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// `intermediary.*` config section (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct IntermediarySection {
    #[serde(default = "default_intermediary_host")]
    pub host: String,
    #[serde(default = "default_intermediary_port")]
    pub port: u16,
    #[serde(default = "default_auth_token")]
    pub auth_token: String,
    #[serde(default = "default_relay_queue")]
    pub relay_queue: PathBuf,
}

impl Default for IntermediarySection {
    fn default() -> Self {
        Self {
            host: default_intermediary_host(),
            port: default_intermediary_port(),
            auth_token: default_auth_token(),
            relay_queue: default_relay_queue(),
        }
    }
}

fn default_intermediary_host() -> String {
    "127.0.0.1".to_string()
}
fn default_intermediary_port() -> u16 {
    8765
}
fn default_auth_token() -> String {
    "super-secret-token".to_string()
}
fn default_relay_queue() -> PathBuf {
    PathBuf::from("relay_message_queue.bin")
}

/// A plain `host`/`port` pair, used by the several sections that are just a
/// bind or dial address.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketSection {
    pub host: String,
    pub port: u16,
}

impl SocketSection {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

fn default_nakurity_backend() -> SocketSection {
    SocketSection {
        host: "127.0.0.1".to_string(),
        port: 8001,
    }
}

fn default_nakurity_client() -> SocketSection {
    SocketSection {
        host: "127.0.0.1".to_string(),
        port: 8000,
    }
}

fn default_nakurity_id() -> SocketSection {
    SocketSection {
        host: "127.0.0.1".to_string(),
        port: 3032,
    }
}

/// `intercept-proxy.*` config section (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct InterceptProxySection {
    #[serde(default = "default_intercept_host")]
    pub host: String,
    #[serde(default = "default_intercept_port")]
    pub port: u16,
    #[serde(default = "default_intercept_upstream")]
    pub upstream_url: String,
    #[serde(default = "default_match_commands")]
    pub match_commands: Vec<String>,
    #[serde(default = "default_intercept_integration_name")]
    pub integration_name: String,
}

impl Default for InterceptProxySection {
    fn default() -> Self {
        Self {
            host: default_intercept_host(),
            port: default_intercept_port(),
            upstream_url: default_intercept_upstream(),
            match_commands: default_match_commands(),
            integration_name: default_intercept_integration_name(),
        }
    }
}

fn default_intercept_host() -> String {
    "127.0.0.1".to_string()
}
fn default_intercept_port() -> u16 {
    8767
}
fn default_intercept_upstream() -> String {
    "ws://127.0.0.1:8000".to_string()
}
fn default_match_commands() -> Vec<String> {
    vec![
        "startup".to_string(),
        "actions/register".to_string(),
        "context".to_string(),
    ]
}
fn default_intercept_integration_name() -> String {
    "intercept-proxy".to_string()
}

/// Root of the relay's YAML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub intermediary: IntermediarySection,
    #[serde(rename = "nakurity-backend", default = "default_nakurity_backend")]
    pub nakurity_backend: SocketSection,
    #[serde(rename = "nakurity-client", default = "default_nakurity_client")]
    pub nakurity_client: SocketSection,
    #[serde(rename = "intercept-proxy", default)]
    pub intercept_proxy: InterceptProxySection,
    #[serde(rename = "nakurity-id", default = "default_nakurity_id")]
    pub nakurity_id: SocketSection,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            intermediary: IntermediarySection::default(),
            nakurity_backend: default_nakurity_backend(),
            nakurity_client: default_nakurity_client(),
            intercept_proxy: InterceptProxySection::default(),
            nakurity_id: default_nakurity_id(),
        }
    }
}

impl RelayConfig {
    /// Parse a `RelayConfig` from a YAML string.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("failed to parse relay configuration YAML")
    }

    /// Load the config from an explicit path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    /// Load the config by discovering the file: an explicit `path` wins,
    /// then `$RELAY_CONFIG`, then a walk upward from the current
    /// directory, falling back to defaults if nothing is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::from_file(p);
        }

        if let Ok(env_path) = env::var("RELAY_CONFIG") {
            return Self::from_file(env_path);
        }

        match discover_config_path()? {
            Some(found) => Self::from_file(found),
            None => Ok(Self::default()),
        }
    }
}

/// Walk upward from the current working directory looking for a config
/// file, in order of preference:
///
/// 1. `relay.yaml` directly inside an ancestor directory.
/// 2. `src/resources/authentication.yaml` inside an ancestor directory
///    literally named `neuro-relay` (the original project's layout).
fn discover_config_path() -> Result<Option<PathBuf>> {
    let start = env::current_dir().context("failed to read current directory")?;

    for ancestor in start.ancestors() {
        let direct = ancestor.join("relay.yaml");
        if direct.is_file() {
            return Ok(Some(direct));
        }

        if ancestor.file_name().and_then(|n| n.to_str()) == Some("neuro-relay") {
            let legacy = ancestor.join("src/resources/authentication.yaml");
            if legacy.is_file() {
                return Ok(Some(legacy));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.intermediary.host, "127.0.0.1");
        assert_eq!(cfg.intermediary.port, 8765);
        assert_eq!(cfg.nakurity_backend.addr(), "127.0.0.1:8001");
        assert_eq!(cfg.intercept_proxy.match_commands.len(), 3);
    }

    #[test]
    fn parses_partial_yaml_with_defaults() {
        let yaml = r#"
intermediary:
  host: "0.0.0.0"
  port: 9000
  auth_token: "abc123"
"#;
        let cfg = RelayConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.intermediary.host, "0.0.0.0");
        assert_eq!(cfg.intermediary.port, 9000);
        assert_eq!(cfg.intermediary.auth_token, "abc123");
        // Untouched sections still take their defaults.
        assert_eq!(cfg.nakurity_client.addr(), "127.0.0.1:8000");
    }

    #[test]
    fn discover_finds_relay_yaml_in_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("relay.yaml"), "intermediary:\n  port: 1234\n").unwrap();

        let cfg_path = dir.path().join("relay.yaml");
        let cfg = RelayConfig::from_file(&cfg_path).unwrap();
        assert_eq!(cfg.intermediary.port, 1234);
    }
}
