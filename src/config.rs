use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::client::ClientBehavior;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub allowed_proxy_ips: Option<Vec<String>>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    #[default]
    Http,
    Websocket,
}

/// One route and the backend it forwards to. A websocket route with
/// `dynamic_route` also serves every path below `path`.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    pub target: String,
    #[serde(default)]
    pub kind: RouteKind,
    #[serde(default)]
    pub transfer_trailer: bool,
    #[serde(default)]
    pub save_origin_response_header: bool,
    pub timeout_ms: Option<u64>,
    pub max_redirects: Option<usize>,
    #[serde(default)]
    pub dynamic_route: bool,
    pub close_grace_ms: Option<u64>,
}

impl RouteConfig {
    pub fn client_behavior(&self) -> Result<ClientBehavior> {
        match (self.timeout_ms, self.max_redirects) {
            (Some(_), Some(_)) => bail!(
                "Route {} sets both timeout_ms and max_redirects; pick one",
                self.path
            ),
            (Some(ms), None) => Ok(ClientBehavior::Timeout(Duration::from_millis(ms))),
            (None, Some(limit)) => Ok(ClientBehavior::Redirects(limit)),
            (None, None) => Ok(ClientBehavior::Do),
        }
    }

    #[must_use]
    pub fn close_grace(&self) -> Option<Duration> {
        self.close_grace_ms.map(Duration::from_millis)
    }
}

pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse config as valid TOML")
}
