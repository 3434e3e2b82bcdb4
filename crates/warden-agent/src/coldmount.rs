//! Lazy projection of the cold tier through an external filesystem helper.
//!
//! The helper (mountpoint-style, `mount-s3` by default) is invoked with the
//! bucket, a `--prefix`, and the target directory. Platforms without a
//! working helper simply proceed without a cold tier: callers addressing the
//! cold path then see an empty directory, which the protocol allows.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

const HELPER_ENV: &str = "WARDEN_COLD_MOUNT_HELPER";
const DEFAULT_HELPER: &str = "mount-s3";

pub struct ColdMount {
    target: PathBuf,
    mounted: bool,
}

impl ColdMount {
    /// For the standalone shutdown entrypoint, where the startup process
    /// already performed the mount.
    pub fn assume_mounted(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            mounted: true,
        }
    }

    /// Attempts the mount; never fails the startup sequence.
    pub async fn mount(bucket: &str, prefix: &str, target: &Path) -> Self {
        if let Err(err) = fs::create_dir_all(target).await {
            warn!(error = %err, target = %target.display(), "cannot create cold mount point; skipping cold tier");
            return Self {
                target: target.to_path_buf(),
                mounted: false,
            };
        }

        let helper = std::env::var(HELPER_ENV).unwrap_or_else(|_| DEFAULT_HELPER.to_string());
        let status = Command::new(&helper)
            .arg("--prefix")
            .arg(prefix)
            .arg(bucket)
            .arg(target)
            .status()
            .await;

        let mounted = match status {
            Ok(status) if status.success() => {
                info!(bucket, prefix, target = %target.display(), "cold tier mounted");
                true
            }
            Ok(status) => {
                warn!(helper, %status, "cold mount helper failed; proceeding without cold tier");
                false
            }
            Err(err) => {
                warn!(helper, error = %err, "cold mount helper unavailable; proceeding without cold tier");
                false
            }
        };

        Self {
            target: target.to_path_buf(),
            mounted,
        }
    }

    /// Best-effort unmount during shutdown.
    pub async fn unmount(&self) {
        if !self.mounted {
            return;
        }
        match Command::new("umount").arg(&self.target).status().await {
            Ok(status) if status.success() => {
                info!(target = %self.target.display(), "cold tier unmounted");
            }
            Ok(status) => warn!(%status, "cold unmount failed"),
            Err(err) => warn!(error = %err, "cold unmount failed"),
        }
    }
}
