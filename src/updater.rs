//! Self-update: fetch a newer build from the collector and swap it in.
//!
//! The agent only replaces its own executable and exits with
//! [`RESTART_EXIT_CODE`]; restarting is left to the service manager.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::CollectorClient;
use crate::error::CollectorError;

/// Build number of this binary, compared against `/client_version`.
pub const CLIENT_BUILD: u64 = 1;

/// Exit status telling the supervisor to start the new build.
pub const RESTART_EXIT_CODE: i32 = 3;

pub fn needs_update(current: u64, offered: u64) -> bool {
    offered > current
}

/// Replaces `exe` with `artifact`, keeping the swap atomic.
pub fn install_artifact(exe: &Path, artifact: &[u8]) -> Result<()> {
    let staged = sibling(exe, "new");
    std::fs::write(&staged, artifact)
        .with_context(|| format!("Failed to stage update at {}", staged.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(exe).map(|m| m.permissions().mode()).unwrap_or(0o755);
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(mode | 0o100))
            .context("Failed to mark update executable")?;
    }

    // A running image cannot be overwritten on Windows, but it can be renamed.
    #[cfg(windows)]
    swap_with_backup(&staged, exe, &sibling(exe, "old"))?;
    #[cfg(not(windows))]
    std::fs::rename(&staged, exe)
        .with_context(|| format!("Failed to swap in update at {}", exe.display()))?;
    Ok(())
}

/// Moves `exe` aside to `backup`, then `staged` into its place. The previous
/// executable is put back when the second rename fails.
#[cfg_attr(not(windows), allow(dead_code))]
fn swap_with_backup(staged: &Path, exe: &Path, backup: &Path) -> Result<()> {
    let _ = std::fs::remove_file(backup);
    let had_exe = exe.exists();
    if had_exe {
        std::fs::rename(exe, backup).context("Failed to move current executable aside")?;
    }
    if let Err(e) = std::fs::rename(staged, exe) {
        if had_exe {
            if let Err(restore) = std::fs::rename(backup, exe) {
                error!("Failed to restore {} after aborted update: {}", exe.display(), restore);
            }
        }
        return Err(e).with_context(|| format!("Failed to swap in update at {}", exe.display()));
    }
    Ok(())
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

pub struct Updater {
    collector: CollectorClient,
    exe: PathBuf,
    current_build: u64,
}

impl Updater {
    pub fn new(collector: CollectorClient, exe: PathBuf, current_build: u64) -> Self {
        Self { collector, exe, current_build }
    }

    pub fn for_current_exe(collector: CollectorClient) -> Result<Self> {
        let exe = std::env::current_exe().context("Cannot locate running executable")?;
        Ok(Self::new(collector, exe, CLIENT_BUILD))
    }

    /// `Ok(true)` once a newer build is installed.
    pub async fn check_once(&self) -> Result<bool> {
        let offered = self.collector.fetch_version().await?.build;
        if !needs_update(self.current_build, offered) {
            return Ok(false);
        }
        info!(current = self.current_build, offered, "Newer client build available");
        let artifact = self.collector.fetch_artifact().await?;
        let exe = self.exe.clone();
        tokio::task::spawn_blocking(move || install_artifact(&exe, &artifact))
            .await
            .context("Update install task failed")??;
        info!(build = offered, "Update installed, restart required");
        Ok(true)
    }

    /// Checks on every interval; returns `true` when a restart is needed.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return false,
            }
            match self.check_once().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => match e.downcast_ref::<CollectorError>() {
                    Some(ce) if ce.is_transport() => debug!("Collector unreachable for update check: {}", ce),
                    Some(_) => warn!("Update check failed: {:#}", e),
                    None => error!("Update failed: {:#}", e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_newer_builds_update() {
        assert!(needs_update(1, 2));
        assert!(!needs_update(2, 2));
        assert!(!needs_update(3, 2));
    }

    #[test]
    fn install_replaces_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("stream-pulse");
        std::fs::write(&exe, b"old build").unwrap();

        install_artifact(&exe, b"new build").unwrap();

        assert_eq!(std::fs::read(&exe).unwrap(), b"new build");
        assert!(!dir.path().join("stream-pulse.new").exists());
    }

    #[test]
    fn backup_swap_keeps_previous_build() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("stream-pulse.exe");
        let staged = dir.path().join("stream-pulse.exe.new");
        let backup = dir.path().join("stream-pulse.exe.old");
        std::fs::write(&exe, b"old build").unwrap();
        std::fs::write(&staged, b"new build").unwrap();

        swap_with_backup(&staged, &exe, &backup).unwrap();

        assert_eq!(std::fs::read(&exe).unwrap(), b"new build");
        assert_eq!(std::fs::read(&backup).unwrap(), b"old build");
    }

    #[test]
    fn failed_swap_restores_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("stream-pulse.exe");
        let backup = dir.path().join("stream-pulse.exe.old");
        std::fs::write(&exe, b"old build").unwrap();

        // Nothing was staged, so moving it into place fails.
        let missing = dir.path().join("stream-pulse.exe.new");
        assert!(swap_with_backup(&missing, &exe, &backup).is_err());

        assert_eq!(std::fs::read(&exe).unwrap(), b"old build");
        assert!(!backup.exists());
    }

    #[test]
    fn sibling_appends_extension() {
        assert_eq!(sibling(Path::new("/opt/agent.exe"), "old"), PathBuf::from("/opt/agent.exe.old"));
    }
}
