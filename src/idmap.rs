//! Idmapped-mount registration via the new mount API
//! (`fsopen`/`open_tree`/`move_mount`/`mount_setattr`). The user namespace
//! itself is a collaborator's responsibility — the compartment lifecycle
//! framework creates it; this module only consumes its fd to shift a
//! mount's UID/GID view.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{Error, Result};

const AT_FDCWD: i32 = -100;
const OPEN_TREE_CLONE: u32 = 1;
const OPEN_TREE_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
const AT_RECURSIVE: u32 = 0x8000;
/// Tells `mount_setattr`/`fstatat`-family calls that an empty path string
/// means "the fd itself," not "the current directory." Required when
/// operating on a detached `open_tree` fd that has no path of its own.
const AT_EMPTY_PATH: u32 = 0x1000;

const MOUNT_ATTR_RDONLY: u64 = 0x0000_0001;
const MOUNT_ATTR_IDMAP: u64 = 0x0010_0000;

#[repr(C)]
struct MountAttr {
    attr_set: u64,
    attr_clr: u64,
    propagation: u64,
    userns_fd: u64,
}

fn cvt(ret: libc::c_long) -> std::result::Result<libc::c_long, nix::errno::Errno> {
    if ret < 0 {
        Err(nix::errno::Errno::last())
    } else {
        Ok(ret)
    }
}

fn open_tree(dirfd: RawFd, path: &Path, flags: u32) -> std::result::Result<OwnedFd, nix::errno::Errno> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| nix::errno::Errno::EINVAL)?;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_open_tree,
            dirfd,
            c_path.as_ptr(),
            flags as libc::c_uint,
        )
    };
    let fd = cvt(ret)? as RawFd;
    Ok(unsafe { FromRawFd::from_raw_fd(fd) })
}

fn mount_setattr(
    fd: RawFd,
    path: &Path,
    at_flags: u32,
    attr: &MountAttr,
) -> std::result::Result<(), nix::errno::Errno> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| nix::errno::Errno::EINVAL)?;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mount_setattr,
            fd,
            c_path.as_ptr(),
            at_flags as libc::c_uint,
            attr as *const MountAttr,
            std::mem::size_of::<MountAttr>(),
        )
    };
    cvt(ret)?;
    Ok(())
}

fn move_mount(
    from_fd: RawFd,
    to_dirfd: RawFd,
    to_path: &Path,
) -> std::result::Result<(), nix::errno::Errno> {
    let empty = std::ffi::CString::new("").unwrap();
    let to = std::ffi::CString::new(to_path.as_os_str().as_bytes())
        .map_err(|_| nix::errno::Errno::EINVAL)?;
    const MOVE_MOUNT_F_EMPTY_PATH: u32 = 0x0000_0004;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_move_mount,
            from_fd,
            empty.as_ptr(),
            to_dirfd,
            to.as_ptr(),
            MOVE_MOUNT_F_EMPTY_PATH as libc::c_uint,
        )
    };
    cvt(ret)?;
    Ok(())
}

/// Fd handle to a user namespace, provided by the collaborator that
/// creates it for the compartment. This crate never creates namespaces
/// itself.
pub struct UserNamespace(OwnedFd);

impl UserNamespace {
    /// Wrap an already-open fd to `/proc/<pid>/ns/user` (or equivalent).
    pub fn from_fd(fd: OwnedFd) -> Self {
        UserNamespace(fd)
    }
}

/// Re-mount `target` as idmapped under `userns`, optionally read-only.
/// Uses `open_tree(OPEN_TREE_CLONE)` to get a detached private copy of
/// the mount, applies `mount_setattr` with `MOUNT_ATTR_IDMAP`, then
/// `move_mount`s the result back over `target`.
pub fn apply_idmap(target: &Path, userns: &UserNamespace, read_only: bool) -> Result<()> {
    let detached = open_tree(AT_FDCWD, target, OPEN_TREE_CLONE | OPEN_TREE_CLOEXEC | AT_RECURSIVE)
        .map_err(|errno| Error::IoctlFailed {
            cmd: "open_tree",
            errno,
        })?;

    let mut attr_set = MOUNT_ATTR_IDMAP;
    if read_only {
        attr_set |= MOUNT_ATTR_RDONLY;
    }
    let attr = MountAttr {
        attr_set,
        attr_clr: 0,
        propagation: 0,
        userns_fd: userns.0.as_raw_fd() as u64,
    };
    mount_setattr(
        detached.as_raw_fd(),
        Path::new(""),
        AT_RECURSIVE | AT_EMPTY_PATH,
        &attr,
    )
    .map_err(|errno| Error::IoctlFailed {
        cmd: "mount_setattr",
        errno,
    })?;

    move_mount(detached.as_raw_fd(), AT_FDCWD, target).map_err(|errno| Error::IoctlFailed {
        cmd: "move_mount",
        errno,
    })?;

    Ok(())
}
