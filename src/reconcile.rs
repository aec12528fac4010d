//! Converges the live configuration file and the running interface with the
//! active peer set.
//!
//! A run walks `NoFile/Applied -> Rendering -> Staged -> Applied`. Anything that
//! fails before the rename falls back to where it started; a failed
//! `bring_up` stops at `Staged`, meaning the file on disk and the running
//! interface no longer agree.

use std::{io, path::PathBuf, sync::Arc};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::{
    control::{ControlError, InterfaceControl},
    database::DatabaseError,
    render::{self, RenderError},
    settings::ServerSettings,
    traits::PeerStore,
    utils,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    NoFile,
    Rendering,
    Staged,
    Applied,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("base configuration {0} does not exist")]
    TemplateMissing(PathBuf),
    #[error("can't read base configuration {path}: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(#[from] DatabaseError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("can't stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("interface {interface} failed to come up with the new configuration: {source}")]
    ReloadFailed {
        interface: String,
        #[source]
        source: ControlError,
    },
}

impl ReconcileError {
    /// The configuration file was replaced but the interface did not take it.
    pub fn is_divergent(&self) -> bool {
        matches!(self, Self::ReloadFailed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub peers: usize,
    /// Staged bytes differ from what the live file held before.
    pub changed: bool,
}

pub struct Reconciler {
    settings: Arc<ServerSettings>,
    control: Box<dyn InterfaceControl>,
    state: ReconcileState,
}

impl Reconciler {
    pub fn new(settings: Arc<ServerSettings>, control: Box<dyn InterfaceControl>) -> Self {
        let state = if settings.config_path.exists() {
            ReconcileState::Applied
        } else {
            ReconcileState::NoFile
        };

        Self {
            settings,
            control,
            state,
        }
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    /// Full file content for the current active peers, without touching disk
    /// beyond reading the template.
    pub async fn render(&self, store: &dyn PeerStore) -> Result<(String, usize), ReconcileError> {
        let path = &self.settings.template_path;
        let template = match fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ReconcileError::TemplateMissing(path.clone()))
            }
            Err(source) => {
                return Err(ReconcileError::Template {
                    path: path.clone(),
                    source,
                })
            }
        };

        let peers = store.list_active_peers(&self.settings.interface).await?;
        let blocks = render::render_peers(&peers)?;
        let count = render::active_sorted(&peers).len();

        let mut content = template.trim_end().to_owned();
        content.push('\n');
        if !blocks.is_empty() {
            content.push('\n');
            content.push_str(&blocks);
        }

        Ok((content, count))
    }

    pub async fn reconcile(&mut self, store: &dyn PeerStore) -> Result<Reconciled, ReconcileError> {
        let stable = self.state;
        self.state = ReconcileState::Rendering;

        let (content, peers) = match self.render(store).await {
            Ok(rendered) => rendered,
            Err(e) => {
                self.state = stable;
                return Err(e);
            }
        };

        let path = &self.settings.config_path;
        let changed = match fs::read(path).await {
            Ok(previous) => previous != content.as_bytes(),
            Err(_) => true,
        };

        if let Err(source) = utils::write_atomic(path, content.as_bytes()).await {
            self.state = stable;
            return Err(ReconcileError::Stage {
                path: path.clone(),
                source,
            });
        }
        self.state = ReconcileState::Staged;
        debug!("staged {} with {peers} peers", path.display());

        let interface = &self.settings.interface;
        if let Err(e) = self.control.bring_down(interface).await {
            warn!("bring down {interface} failed, continuing: {e}");
        }
        if let Err(source) = self.control.bring_up(interface, path).await {
            error!(
                "interface {interface} did not come up; {} and the running interface \
                 now disagree: {source}",
                path.display()
            );
            return Err(ReconcileError::ReloadFailed {
                interface: interface.clone(),
                source,
            });
        }

        self.state = ReconcileState::Applied;
        info!("interface {interface} applied with {peers} peers (changed: {changed})");

        Ok(Reconciled { peers, changed })
    }
}
