pub mod peers;
pub mod status;

use std::{io, path::PathBuf, sync::Arc};

use cidr::Ipv4Cidr;
use clap::Parser;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{instrument, warn};
use uuid::Uuid;

pub use peers::*;
pub use status::*;

use crate::{
    allocator::{AllocError, Pool, PoolError},
    control::{InterfaceControl, WgQuick},
    database::DatabaseError,
    keys::{self, KeyError, KeyPairProvider, KeySource},
    netlink::error::NetlinkError,
    reconcile::{ReconcileError, ReconcileState, Reconciled, Reconciler},
    render::RenderError,
    settings::{DebugMode, ServerSettings},
    traits::PeerStore,
    utils::{self, InterfaceLock},
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Netlink(#[from] NetlinkError),
    #[error("peer {0} not found")]
    NotFound(Uuid),
    #[error("peer {0} is revoked")]
    Revoked(Uuid),
    #[error("peer with this key or address already exists")]
    PeerAlreadyExists,
    #[error("invalid {0}: must be non-empty and free of control characters")]
    InvalidName(&'static str),
    #[error("can't lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The peer is recorded and staged, but the interface did not take it.
    #[error("peer {} was created, but {source}", .peer.id)]
    Diverged {
        peer: Box<Peer>,
        client_config: Option<String>,
        #[source]
        source: ReconcileError,
    },
}

impl ServiceError {
    /// Configuration on disk and the running interface disagree.
    pub fn is_divergent(&self) -> bool {
        match self {
            Self::Reconcile(e) => e.is_divergent(),
            Self::Diverged { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Parser)]
pub struct Config {
    #[clap(short, long, env = "WG_INTERFACE", value_parser, default_value = "wg0")]
    interface: String,
    #[clap(long, env = "WG_SERVER_PRIVATE_KEY", value_parser, hide_env_values = true)]
    private_key: Option<String>,
    /// Derived from the private key when omitted.
    #[clap(long, env = "WG_SERVER_PUBLIC_KEY", value_parser)]
    public_key: Option<String>,
    /// host:port clients connect to.
    #[clap(short, long, env = "WG_ENDPOINT", value_parser)]
    endpoint: Option<String>,
    #[clap(long, env = "WG_DNS", value_parser, value_delimiter = ',')]
    dns: Vec<String>,
    #[clap(long, env = "WG_ALLOWED_IPS", value_parser, value_delimiter = ',')]
    client_allowed_ips: Vec<String>,
    #[clap(long, env = "WG_IP_POOL", value_parser, default_value = "10.99.0.0/24")]
    pool: Ipv4Cidr,
    #[clap(long, env = "WG_IP_POOL_START", value_parser, default_value = "100")]
    pool_start: u32,
    #[clap(long, env = "WG_IP_POOL_END", value_parser, default_value = "200")]
    pool_end: u32,
    #[clap(
        long,
        env = "WG_BASE_CONF",
        value_parser,
        default_value = "/etc/wireguard/wg0-base.conf"
    )]
    template: PathBuf,
    #[clap(long, env = "WG_CONF", value_parser, default_value = "/etc/wireguard/wg0.conf")]
    config: PathBuf,
    #[clap(long, env = "WG_QUICK", value_parser, default_value = "wg-quick")]
    wg_quick: PathBuf,
    #[clap(long, env = "WG_BIN", value_parser, default_value = "wg")]
    wg: PathBuf,
    #[clap(long, env = "WG_KEY_SOURCE", value_enum, default_value = "native")]
    key_source: KeySource,
    /// Fall back to placeholder keys when key generation fails. Never in production.
    #[clap(long, env = "VPN_DEBUG_MODE", value_parser)]
    debug_mode: bool,
}

impl Config {
    pub fn settings(&self) -> ServerSettings {
        if self.config.file_stem().and_then(|s| s.to_str()) != Some(self.interface.as_str()) {
            warn!(
                "{} does not match interface {}; wg-quick names the interface after the file",
                self.config.display(),
                self.interface
            );
        }

        ServerSettings {
            interface: self.interface.clone(),
            // the [Interface] block comes from the template
            listen_port: None,
            address: None,
            private_key: self.private_key.clone(),
            public_key: self.public_key.clone().or_else(|| {
                let derived = keys::derive_public(self.private_key.as_deref()?);
                if let Err(e) = &derived {
                    warn!("can't derive the server public key: {e}");
                }
                derived.ok()
            }),
            endpoint: self.endpoint.clone(),
            dns: self.dns.clone(),
            client_allowed_ips: self.client_allowed_ips.clone(),
            post_up: Vec::new(),
            post_down: Vec::new(),
            template_path: self.template.clone(),
            config_path: self.config.clone(),
        }
    }

    pub fn pool(&self) -> Result<Pool, PoolError> {
        Pool::new(self.pool, self.pool_start, self.pool_end)
    }

    pub fn debug_mode(&self) -> DebugMode {
        self.debug_mode.into()
    }

    pub fn keys(&self) -> Box<dyn KeyPairProvider> {
        let debug = self.debug_mode();
        if debug == DebugMode::On {
            warn!("debug mode is on: failed key generation yields placeholder keys");
        }
        keys::provider(self.key_source, self.wg.clone(), debug)
    }

    pub fn control(&self) -> Box<dyn InterfaceControl> {
        Box::new(WgQuick::new(self.wg_quick.clone()))
    }
}

struct Shared {
    reconciler: Reconciler,
}

/// Held while the peer set is read and written back. The mutex orders tasks
/// of this process; the file lock orders processes.
struct Exclusive<'a> {
    shared: MutexGuard<'a, Shared>,
    _lock: InterfaceLock,
}

/// Operator-facing operations on one interface. Every operation that reads
/// the peer set and then writes holds [`Exclusive`], so allocation and
/// reconciliation never interleave, within this process or across processes
/// sharing the configuration directory.
#[derive(Clone)]
pub struct Controller {
    store: Arc<dyn PeerStore>,
    keys: Arc<dyn KeyPairProvider>,
    settings: Arc<ServerSettings>,
    pool: Pool,

    shared: Arc<Mutex<Shared>>,
}

impl Controller {
    pub fn new(
        settings: ServerSettings,
        pool: Pool,
        store: Arc<dyn PeerStore>,
        keys: Box<dyn KeyPairProvider>,
        control: Box<dyn InterfaceControl>,
    ) -> Self {
        let settings = Arc::new(settings);

        Self {
            store,
            keys: Arc::from(keys),
            pool,
            shared: Arc::new(Mutex::new(Shared {
                reconciler: Reconciler::new(settings.clone(), control),
            })),
            settings,
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn state(&self) -> ReconcileState {
        self.shared.lock().await.reconciler.state()
    }

    async fn exclusive(&self) -> Result<Exclusive<'_>, ServiceError> {
        let shared = self.shared.lock().await;
        let config = &self.settings.config_path;
        let lock = InterfaceLock::acquire(config)
            .await
            .map_err(|source| ServiceError::Lock {
                path: utils::lock_path(config),
                source,
            })?;

        Ok(Exclusive {
            shared,
            _lock: lock,
        })
    }

    #[instrument(skip(self), fields(interface = %self.settings.interface))]
    pub async fn reconcile(&self) -> Result<Reconciled, ServiceError> {
        let mut exclusive = self.exclusive().await?;
        Ok(exclusive
            .shared
            .reconciler
            .reconcile(self.store.as_ref())
            .await?)
    }
}
