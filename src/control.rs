use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("can't run {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{cmd} exited with {status}: {stderr}")]
    Failed {
        cmd: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Brings the VPN interface down and up again. `bring_down` may fail on an
/// interface that was never up; `bring_up` failures leave it in an unknown state.
#[async_trait]
pub trait InterfaceControl: Send + Sync {
    async fn bring_down(&self, name: &str) -> Result<(), ControlError>;
    async fn bring_up(&self, name: &str, config_path: &Path) -> Result<(), ControlError>;
}

pub struct WgQuick {
    binary: PathBuf,
}

impl WgQuick {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, action: &str, target: &str) -> Result<(), ControlError> {
        let cmd = format!("{} {action} {target}", self.binary.display());
        debug!("running {cmd}");

        let output = Command::new(&self.binary)
            .arg(action)
            .arg(target)
            .output()
            .await
            .map_err(|source| ControlError::Spawn {
                cmd: cmd.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ControlError::Failed {
                cmd,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }
}

#[async_trait]
impl InterfaceControl for WgQuick {
    async fn bring_down(&self, name: &str) -> Result<(), ControlError> {
        self.run("down", name).await
    }

    /// wg-quick derives the interface name from the file stem, so the staged
    /// file must be called `<name>.conf`.
    async fn bring_up(&self, _name: &str, config_path: &Path) -> Result<(), ControlError> {
        self.run("up", &config_path.to_string_lossy()).await
    }
}
