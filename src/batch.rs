//! Store-less generation from a declarative TOML document:
//!
//! ```toml
//! [server]
//! name = "wg0"
//! address = "10.99.0.1/24"
//! listen_port = 51820
//! private_key = "..."
//! public_key = "..."
//! endpoint_host = "vpn.example.com"
//! endpoint_port = 51820
//! client_allowed_ips = ["10.99.0.0/24"]
//!
//! [[peers]]
//! name = "alice"
//! address = "10.99.0.100/32"
//! public_key = "..."
//! private_key = "..."
//! persistent_keepalive = 25
//! ```
//!
//! Everything is rendered before the first file is written.

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::{
    allocator::HostAddress,
    render::{self, RenderError},
    service::Peer,
    settings::ServerSettings,
    utils,
};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("can't read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("can't write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid document: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("invalid document: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    pub server: ServerSection,
    #[serde(default)]
    pub peers: Vec<PeerSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_interface")]
    pub name: String,
    pub address: Option<String>,
    pub listen_port: Option<u16>,
    pub private_key: Option<String>,
    pub public_key: Option<String>,
    pub endpoint_host: Option<String>,
    pub endpoint_port: Option<u16>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub client_allowed_ips: Vec<String>,
    #[serde(default)]
    pub post_up: Vec<String>,
    #[serde(default)]
    pub post_down: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSection {
    pub name: Option<String>,
    pub owner: Option<String>,
    pub address: Option<String>,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub client_allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
}

fn default_interface() -> String {
    "wg0".to_owned()
}

#[derive(Debug, PartialEq, Eq)]
pub struct Generated {
    pub server: PathBuf,
    pub clients: Vec<PathBuf>,
}

impl ServerSection {
    fn settings(&self) -> ServerSettings {
        let endpoint = match (&self.endpoint_host, self.endpoint_port) {
            (Some(host), Some(port)) if !host.trim().is_empty() => Some(format!("{host}:{port}")),
            _ => None,
        };

        ServerSettings {
            interface: self.name.clone(),
            listen_port: self.listen_port,
            address: self.address.clone(),
            private_key: self.private_key.clone(),
            public_key: self.public_key.clone(),
            endpoint,
            dns: self.dns.clone(),
            client_allowed_ips: self.client_allowed_ips.clone(),
            post_up: self.post_up.clone(),
            post_down: self.post_down.clone(),
            ..Default::default()
        }
    }
}

impl PeerSection {
    fn peer(&self, position: usize, interface: &str) -> Result<Peer, BatchError> {
        let name = match self.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_owned(),
            _ => {
                return Err(RenderError::MissingField {
                    field: "name",
                    subject: format!("peer #{}", position + 1),
                }
                .into())
            }
        };
        let owner = self.owner.clone().unwrap_or_else(|| interface.to_owned());
        let subject = || format!("peer {owner}/{name}");

        let address = self.address.as_deref().ok_or_else(|| RenderError::MissingField {
            field: "address",
            subject: subject(),
        })?;
        let address = address
            .parse::<HostAddress>()
            .map_err(|e| BatchError::Invalid(format!("{}: {e}", subject())))?;
        let public_key = self.public_key.clone().ok_or_else(|| RenderError::MissingField {
            field: "public_key",
            subject: subject(),
        })?;

        Ok(Peer {
            id: Uuid::new_v4(),
            owner: owner.clone(),
            name,
            address,
            public_key,
            private_key: self.private_key.clone(),
            dns: self.dns.clone(),
            client_allowed_ips: self.client_allowed_ips.clone(),
            persistent_keepalive: self.persistent_keepalive,
            revoked: false,
            created_at: OffsetDateTime::now_utc(),
        })
    }
}

/// Server text plus `(peer name, client text)` pairs.
pub fn render_document(doc: &Document) -> Result<(String, Vec<(String, String)>), BatchError> {
    if doc.peers.is_empty() {
        return Err(BatchError::Invalid("document must contain a `peers` list".to_owned()));
    }

    let settings = doc.server.settings();
    let peers = doc
        .peers
        .iter()
        .enumerate()
        .map(|(i, p)| p.peer(i, &settings.interface))
        .collect::<Result<Vec<_>, _>>()?;

    let mut names = HashSet::new();
    for peer in &peers {
        if peer.name.contains(['/', '\\']) || peer.name.starts_with('.') {
            return Err(BatchError::Invalid(format!(
                "peer name `{}` can't be used as a file name",
                peer.name
            )));
        }
        if !names.insert(peer.name.as_str()) {
            return Err(BatchError::Invalid(format!("duplicate peer name `{}`", peer.name)));
        }
    }

    let server = render::render_server(&settings, &peers)?;
    let clients = peers
        .iter()
        .map(|peer| Ok((peer.name.clone(), render::render_client(&settings, peer)?)))
        .collect::<Result<Vec<_>, BatchError>>()?;

    Ok((server, clients))
}

pub async fn load(path: &Path) -> Result<Document, BatchError> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|source| BatchError::Read {
            path: path.to_owned(),
            source,
        })?;

    Ok(toml::from_str(&text)?)
}

/// Writes `<out>/server/<interface>.conf` and `<out>/clients/<peer>.conf`.
pub async fn generate(doc: &Document, out: &Path) -> Result<Generated, BatchError> {
    let (server_text, clients) = render_document(doc)?;

    let server_dir = out.join("server");
    let clients_dir = out.join("clients");
    for dir in [&server_dir, &clients_dir] {
        fs::create_dir_all(dir)
            .await
            .map_err(|source| BatchError::Write {
                path: dir.clone(),
                source,
            })?;
    }

    let write = |path: PathBuf, text: String| async move {
        utils::write_atomic(&path, text.as_bytes())
            .await
            .map_err(|source| BatchError::Write {
                path: path.clone(),
                source,
            })?;
        info!("wrote {}", path.display());
        Ok::<_, BatchError>(path)
    };

    let server = write(server_dir.join(format!("{}.conf", doc.server.name)), server_text).await?;
    let mut written = Vec::with_capacity(clients.len());
    for (name, text) in clients {
        written.push(write(clients_dir.join(format!("{name}.conf")), text).await?);
    }

    Ok(Generated {
        server,
        clients: written,
    })
}
