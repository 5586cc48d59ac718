//! Compartment root pivot: switches the process's view of the
//! filesystem onto the composed tree assembled under `/tmp/<uuid>`, then
//! mounts the pseudo-filesystems every compartment needs.

use std::os::fd::AsRawFd;
use std::path::Path;

use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::mount::{mount as nix_mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, chroot, fchdir, pivot_root};

use crate::error::{Error, Result};

fn mount_err(src: &str, dst: &Path, fs: Option<&str>, errno: nix::errno::Errno) -> Error {
    Error::MountFailed {
        src: src.to_string(),
        dst: dst.display().to_string(),
        fs: fs.map(str::to_string),
        errno,
    }
}

/// `open("/")`/`open(root)` → `fchdir(new_root)` → `pivot_root(".", ".")`
/// → `fchdir(old_root)` → `umount2(".", MNT_DETACH)` → `fchdir(new_root)`.
/// Used when the calling process already owns its own mount namespace
/// (the common "hosted" case).
pub fn switch_root_hosted(root: &Path) -> Result<()> {
    let old_root = Dir::open("/", OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())?;
    let new_root = Dir::open(root, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())?;

    fchdir(new_root.as_raw_fd())?;
    pivot_root(".", ".")?;
    fchdir(old_root.as_raw_fd())?;
    umount2(".", MntFlags::MNT_DETACH)?;
    fchdir(new_root.as_raw_fd())?;
    Ok(())
}

/// `chdir(root)` → `mount(".", "/", NULL, MS_MOVE, NULL)` → `chroot(".")`
/// → `chdir("/")`. Used when a separate mount namespace can't be assumed
/// (a process attaching into an already-running compartment's namespace,
/// for instance), matching the move-mount approach used for namespace
/// attach elsewhere in this stack.
pub fn switch_root_non_hosted(root: &Path) -> Result<()> {
    chdir(root)?;
    nix_mount(Some("."), "/", None::<&str>, MsFlags::MS_MOVE, None::<&str>)
        .map_err(|errno| mount_err(".", Path::new("/"), None, errno))?;
    chroot(".")?;
    chdir("/")?;
    Ok(())
}

/// Mount `/proc`, `/sys`, `/dev/pts`, `/run`, and the control-socket
/// tmpfs after the root switch. `/sys` is read-only when running inside
/// a user namespace without its own network namespace; `/proc/sysrq-trigger`
/// is bind-remounted read-only outside a user namespace.
pub fn mount_pseudo_fs(in_user_ns: bool, has_net_ns: bool) -> Result<()> {
    nix_mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|errno| mount_err("proc", Path::new("/proc"), Some("proc"), errno))?;

    let sys_flags = if in_user_ns && !has_net_ns {
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_RDONLY
    } else {
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV
    };
    nix_mount(Some("sysfs"), "/sys", Some("sysfs"), sys_flags, None::<&str>)
        .map_err(|errno| mount_err("sysfs", Path::new("/sys"), Some("sysfs"), errno))?;

    std::fs::create_dir_all("/dev/pts").map_err(Error::Io)?;
    nix_mount(
        Some("devpts"),
        "/dev/pts",
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("gid=5,mode=0620"),
    )
    .map_err(|errno| mount_err("devpts", Path::new("/dev/pts"), Some("devpts"), errno))?;

    nix_mount(
        Some("tmpfs"),
        "/run",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=0755"),
    )
    .map_err(|errno| mount_err("tmpfs", Path::new("/run"), Some("tmpfs"), errno))?;

    if !in_user_ns {
        let trigger = Path::new("/proc/sysrq-trigger");
        if trigger.exists() {
            nix_mount(
                None::<&str>,
                trigger,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT,
                None::<&str>,
            )
            .map_err(|errno| mount_err("sysrq-trigger remount", trigger, None, errno))?;
        }
    }

    Ok(())
}
