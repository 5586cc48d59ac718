//! Mount engine: turns one resolved mount entry into a live mount under
//! the compartment root, formatting on first use and marking every mount
//! private so propagation can't leak into the host namespace.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::mount::{mount as nix_mount, umount2, MntFlags, MsFlags};
use tracing::debug;

use crate::error::{Error, Result};
use crate::mountentry::MountType;

/// Bounded wait for `/dev/mapper/<label>` (or any other device path) to
/// appear after a dm table load — replaces the original implementation's
/// unbounded busy-wait with an explicit cap.
const DEVICE_NODE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEVICE_NODE_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Mount flags that apply to every mount outside "setup mode" (building a
/// golden image rather than starting a real compartment).
pub fn default_flags(setup_mode: bool) -> MsFlags {
    if setup_mode {
        MsFlags::MS_NOATIME
    } else {
        MsFlags::MS_NOATIME | MsFlags::MS_NODEV
    }
}

/// Entries that mount their content read-only regardless of the
/// requested flags.
pub fn is_read_only_type(mount_type: MountType) -> bool {
    matches!(
        mount_type,
        MountType::Shared
            | MountType::Device
            | MountType::OverlayRo
            | MountType::BindFile
            | MountType::BindDir
    )
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(Error::Io)?;
    std::fs::set_permissions(path, Permissions::from_mode(0o777)).map_err(Error::Io)?;
    Ok(())
}

fn do_mount(
    src: Option<&Path>,
    dst: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    nix_mount(src, dst, fstype, flags, data).map_err(|errno| Error::MountFailed {
        src: src.map(|p| p.display().to_string()).unwrap_or_default(),
        dst: dst.display().to_string(),
        fs: fstype.map(str::to_string),
        errno,
    })
}

pub fn mount_tmpfs(dst: &Path, flags: MsFlags, data: Option<&str>) -> Result<()> {
    ensure_dir(dst)?;
    do_mount(Some(Path::new("tmpfs")), dst, Some("tmpfs"), flags, data)?;
    std::fs::set_permissions(dst, Permissions::from_mode(0o755)).map_err(Error::Io)?;
    Ok(())
}

/// Copy `/bin/busybox` into a freshly mounted root tmpfs so a setup-mode
/// shell (building a golden image, not starting a real compartment) has
/// basic tools available before anything else gets mounted over it.
pub fn seed_busybox(root_tmpfs: &Path) -> Result<()> {
    let src = Path::new("/bin/busybox");
    if !src.exists() {
        return Ok(());
    }
    let dst = root_tmpfs.join("bin").join("busybox");
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    std::fs::copy(src, &dst).map_err(Error::Io)?;
    let mut perms = std::fs::metadata(&dst).map_err(Error::Io)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&dst, perms).map_err(Error::Io)?;
    Ok(())
}

/// Mount a root-level tmpfs mount entry (`entry.fs == "tmpfs"`), and, in
/// setup mode, seed it with `/bin/busybox` per the mount engine's tmpfs
/// step.
pub fn mount_root_tmpfs(dst: &Path, flags: MsFlags, data: Option<&str>, setup_mode: bool) -> Result<()> {
    mount_tmpfs(dst, flags, data)?;
    if setup_mode {
        seed_busybox(dst)?;
    }
    Ok(())
}

/// Bind-mount `src` onto `dst`. `read_only` issues the standard two-step
/// bind+remount-ro dance, since `MS_BIND|MS_RDONLY` in one call is
/// ignored by the kernel.
pub fn bind_mount(src: &Path, dst: &Path, flags: MsFlags, read_only: bool) -> Result<()> {
    do_mount(Some(src), dst, None, MsFlags::MS_BIND | flags, None)?;
    if read_only {
        do_mount(
            None,
            dst,
            None,
            MsFlags::MS_BIND | MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT | flags,
            None,
        )?;
    }
    Ok(())
}

/// Mount a filesystem image, retrying once with a fresh `mkfs` if the
/// kernel reports `EINVAL` (no valid superblock) and the entry is
/// allowed to format-on-first-use.
pub fn mount_image_backed(
    dev: &Path,
    dst: &Path,
    fs: &str,
    flags: MsFlags,
    data: Option<&str>,
    allow_format: bool,
) -> Result<()> {
    ensure_dir(dst)?;
    match do_mount(Some(dev), dst, Some(fs), flags, data) {
        Ok(()) => Ok(()),
        Err(Error::MountFailed { errno, .. }) if allow_format && errno == nix::errno::Errno::EINVAL => {
            format_device(dev, fs)?;
            do_mount(Some(dev), dst, Some(fs), flags, data)
        }
        Err(err) => Err(err),
    }
}

fn format_device(dev: &Path, fs: &str) -> Result<()> {
    let mkfs_bin = match fs {
        "ext4" => "mkfs.ext4",
        "btrfs" => "mkfs.btrfs",
        other => {
            return Err(Error::FormatFailed {
                dev: dev.display().to_string(),
                fs: other.to_string(),
            })
        }
    };
    debug!(dev = %dev.display(), fs, "formatting device");
    let status = Command::new(mkfs_bin)
        .arg("-F")
        .arg(dev)
        .status()
        .map_err(Error::Io)?;
    if !status.success() {
        return Err(Error::FormatFailed {
            dev: dev.display().to_string(),
            fs: fs.to_string(),
        });
    }
    Ok(())
}

/// After a successful mount, mark it `MS_REC|MS_PRIVATE` so propagation
/// events can't cross into the host mount namespace.
pub fn seal_private(dst: &Path) -> Result<()> {
    do_mount(
        None,
        dst,
        None,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None,
    )
}

pub fn unmount(dst: &Path) -> std::result::Result<(), nix::errno::Errno> {
    match umount2(dst, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(_) => umount2(dst, MntFlags::MNT_DETACH),
    }
}

/// Poll for a device node to appear, bounded by `DEVICE_NODE_POLL_TIMEOUT`.
pub fn wait_for_device_node(path: &Path) -> Result<()> {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() > DEVICE_NODE_POLL_TIMEOUT {
            return Err(Error::TeardownPartial(format!(
                "device node {path:?} did not appear within {DEVICE_NODE_POLL_TIMEOUT:?}"
            )));
        }
        sleep(DEVICE_NODE_POLL_INTERVAL);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_mode_drops_nodev() {
        let setup = default_flags(true);
        let runtime = default_flags(false);
        assert!(!setup.contains(MsFlags::MS_NODEV));
        assert!(runtime.contains(MsFlags::MS_NODEV));
        assert!(setup.contains(MsFlags::MS_NOATIME));
    }

    #[test]
    fn read_only_classification_covers_ro_mount_types() {
        assert!(is_read_only_type(MountType::Shared));
        assert!(is_read_only_type(MountType::OverlayRo));
        assert!(!is_read_only_type(MountType::SharedRw));
        assert!(!is_read_only_type(MountType::Empty));
    }

    #[test]
    fn wait_for_device_node_succeeds_immediately_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("present");
        std::fs::write(&path, b"x").unwrap();
        assert!(wait_for_device_node(&path).is_ok());
    }

    #[test]
    fn seed_busybox_is_a_noop_without_a_source_binary() {
        // Hermetic test environments rarely have /bin/busybox; seeding must
        // degrade to a no-op rather than failing setup over a missing tool.
        let dir = tempfile::tempdir().unwrap();
        assert!(seed_busybox(dir.path()).is_ok());
        assert!(!dir.path().join("bin/busybox").exists());
    }
}
