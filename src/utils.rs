use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use tokio::task;

fn blocking_failed(e: task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Replaces `path` with `contents` so that readers see either the old or the
/// new file, never a partial one. The file ends up readable by the owner only.
///
/// Every call stages into its own hidden sibling (`.wg0.conf.XXXXXX.tmp`), so
/// concurrent writers never share a staging file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let path = path.to_owned();
    let contents = contents.to_vec();

    task::spawn_blocking(move || {
        let mut staged = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name(&path)))
            .suffix(".tmp")
            .tempfile_in(parent_dir(&path))?;
        restrict_permissions(staged.as_file())?;
        staged.write_all(&contents)?;
        staged.as_file().sync_all()?;
        staged.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(blocking_failed)?
}

#[cfg(unix)]
fn restrict_permissions(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    file.set_permissions(std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_: &File) -> io::Result<()> {
    Ok(())
}

/// `/etc/wireguard/wg0.conf` is guarded by `/etc/wireguard/wg0.conf.lock`.
pub fn lock_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name(format!("{}.lock", file_name(config_path)))
}

/// Exclusive advisory lock on one interface, shared by every process that
/// manages it. Released on drop.
#[derive(Debug)]
pub struct InterfaceLock {
    _file: File,
}

impl InterfaceLock {
    /// Waits until no other holder is left.
    pub async fn acquire(config_path: &Path) -> io::Result<Self> {
        let path = lock_path(config_path);

        task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(Self { _file: file })
        })
        .await
        .map_err(blocking_failed)?
    }
}
