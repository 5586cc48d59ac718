//! Overlayfs composition: assembles upper/lower/work directories under a
//! per-compartment scratch path and mounts the overlay over the final
//! target. `OVERLAY_RW` on btrfs with a named subvolume additionally
//! creates that subvolume before the overlay's first mount.

use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::MsFlags;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mount::{self, ensure_dir};

/// Scratch root for a compartment's overlay directories:
/// `/tmp/overlayfs/<uuid>/<n>`.
pub fn scratch_dir(uuid: Uuid, counter: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/overlayfs/{uuid}/{counter}"))
}

pub struct OverlayPaths {
    pub scratch: PathBuf,
    pub upper: PathBuf,
    pub lower: PathBuf,
    pub work: PathBuf,
}

impl OverlayPaths {
    pub fn new(scratch: PathBuf, lower: PathBuf) -> Self {
        OverlayPaths {
            upper: scratch.join("upper"),
            work: scratch.join("work"),
            scratch,
            lower,
        }
    }

    fn options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower.display(),
            self.upper.display(),
            self.work.display()
        )
    }
}

/// Create the upper/work directories inside an already-mounted upper
/// backing filesystem at `paths.scratch`.
pub fn prepare_upper_work(paths: &OverlayPaths) -> Result<()> {
    ensure_dir(&paths.upper)?;
    ensure_dir(&paths.work)?;
    Ok(())
}

/// Mount the composed overlay at `target`.
pub fn mount_overlay(paths: &OverlayPaths, target: &Path, flags: MsFlags) -> Result<()> {
    ensure_dir(target)?;
    nix::mount::mount(
        Some("overlay"),
        target,
        Some("overlay"),
        flags,
        Some(paths.options().as_str()),
    )
    .map_err(|errno| Error::MountFailed {
        src: "overlay".to_string(),
        dst: target.display().to_string(),
        fs: Some("overlay".to_string()),
        errno,
    })
}

/// For a fresh `OVERLAY_RW` image formatted as btrfs with
/// `mount_data = "subvol=<name>"`: temporarily mount the btrfs root at a
/// `mkdtemp` directory, create the named subvolume if it doesn't already
/// exist, then unmount.
pub fn ensure_btrfs_subvolume(dev: &Path, subvol_name: &str) -> Result<()> {
    let tmp = tempfile::tempdir().map_err(Error::Io)?;
    nix::mount::mount(Some(dev), tmp.path(), Some("btrfs"), MsFlags::empty(), None).map_err(
        |errno| Error::MountFailed {
            src: dev.display().to_string(),
            dst: tmp.path().display().to_string(),
            fs: Some("btrfs".to_string()),
            errno,
        },
    )?;
    // Guarantees the scratch root is unmounted on every exit path below,
    // including a `Command::spawn` failure that never reaches the
    // explicit unmount at the end.
    let _unmount_guard = scopeguard::guard(tmp.path().to_path_buf(), |path| {
        if let Err(errno) = mount::unmount(&path) {
            debug!(path = %path.display(), %errno, "failed to unmount btrfs scratch root during cleanup");
        }
    });

    let subvol_path = tmp.path().join(subvol_name);
    if !subvol_path.exists() {
        debug!(subvol = subvol_name, "creating btrfs subvolume");
        let status = Command::new("btrfs")
            .args(["subvolume", "create"])
            .arg(&subvol_path)
            .status()
            .map_err(Error::Io)?;
        if !status.success() {
            return Err(Error::OverlayAssemblyFailed("btrfs subvolume create failed"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_options_string_has_all_three_dirs() {
        let paths = OverlayPaths::new(PathBuf::from("/tmp/overlayfs/u/0"), PathBuf::from("/lower"));
        let opts = paths.options();
        assert!(opts.contains("lowerdir=/lower"));
        assert!(opts.contains("upperdir=/tmp/overlayfs/u/0/upper"));
        assert!(opts.contains("workdir=/tmp/overlayfs/u/0/work"));
    }

    #[test]
    fn scratch_dir_is_per_compartment_and_per_counter() {
        let uuid = Uuid::nil();
        assert_ne!(scratch_dir(uuid, 0), scratch_dir(uuid, 1));
    }
}
