use std::path::PathBuf;

use serde::Deserialize;

/// Everything about the server side of one interface that is not derived from
/// peer records. Built once at startup and handed to every component.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSettings {
    pub interface: String,
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    /// `host:port` clients dial.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub client_allowed_ips: Vec<String>,
    #[serde(default)]
    pub post_up: Vec<String>,
    #[serde(default)]
    pub post_down: Vec<String>,
    #[serde(default)]
    pub template_path: PathBuf,
    #[serde(default)]
    pub config_path: PathBuf,
}

impl ServerSettings {
    pub fn subject(&self) -> String {
        format!("server {}", self.interface)
    }
}

/// Gate for behaviour that trades security for convenience while debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugMode {
    #[default]
    Off,
    On,
}

impl From<bool> for DebugMode {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}
