//! Loop device attach/release. A loop device backs most of this crate's
//! volumes; its lifetime is scoped like everything else created here — an
//! uncommitted `LoopDevice` clears itself on drop.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

const LOOP_CONTROL_PATH: &str = "/dev/loop-control";
const LOOP_CTL_GET_FREE: u8 = 0x82;
const LOOP_SET_FD: u8 = 0x00;
const LOOP_CLR_FD: u8 = 0x01;
const LOOP_MAGIC: u8 = 0x4C;

mod ioctl {
    use super::*;

    nix::ioctl_none!(ctl_get_free, LOOP_MAGIC, LOOP_CTL_GET_FREE);
    nix::ioctl_write_int!(set_fd, LOOP_MAGIC, LOOP_SET_FD);
    nix::ioctl_write_int!(clr_fd, LOOP_MAGIC, LOOP_CLR_FD);
}

/// A loop device attached to a backing file, owned until `commit()`.
/// Dropping without committing detaches it again (`LOOP_CLR_FD`), matching
/// the scoped-handle shape used for every other resource this crate creates.
pub struct LoopDevice {
    path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl LoopDevice {
    /// Device node path, e.g. `/dev/loop3`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the loop device attached past this handle's lifetime. The
    /// backing file descriptor for the loop device itself is dropped here;
    /// the kernel keeps the association alive independent of user fds.
    pub fn commit(mut self) -> PathBuf {
        self.committed = true;
        self.file.take();
        self.path.clone()
    }

    /// Detach explicitly, surfacing any error instead of swallowing it in
    /// `Drop`.
    pub fn release(mut self) -> Result<()> {
        self.clear()?;
        self.committed = true;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        if let Some(f) = &self.file {
            unsafe { ioctl::clr_fd(f.as_raw_fd(), 0) }.map_err(|errno| Error::IoctlFailed {
                cmd: "LOOP_CLR_FD",
                errno,
            })?;
        }
        Ok(())
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.clear() {
            warn!(path = %self.path.display(), %err, "failed to detach loop device on drop");
        }
    }
}

/// Detach a loop device by path alone, for teardown that only has the
/// device path on hand (no live `LoopDevice` handle to call `release` on,
/// since the handle that created it was committed and discarded at setup
/// time). Missing device node is a no-op.
pub fn release_by_path(path: &Path) -> Result<()> {
    let f = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(Error::Io(err)),
    };
    unsafe { ioctl::clr_fd(f.as_raw_fd(), 0) }.map_err(|errno| Error::IoctlFailed {
        cmd: "LOOP_CLR_FD",
        errno,
    })?;
    Ok(())
}

/// Find a free minor via `LOOP_CTL_GET_FREE` and attach `backing` to it.
pub fn attach(backing: &Path) -> Result<LoopDevice> {
    let ctl = File::open(LOOP_CONTROL_PATH).map_err(Error::Io)?;
    let minor = unsafe { ioctl::ctl_get_free(ctl.as_raw_fd()) }.map_err(|errno| {
        Error::IoctlFailed {
            cmd: "LOOP_CTL_GET_FREE",
            errno,
        }
    })?;

    let loop_path = PathBuf::from(format!("/dev/loop{minor}"));
    let loop_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&loop_path)
        .map_err(Error::Io)?;
    let backing_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(backing)
        .map_err(Error::Io)?;

    unsafe { ioctl::set_fd(loop_file.as_raw_fd(), backing_file.as_raw_fd() as i32) }.map_err(
        |errno| Error::IoctlFailed {
            cmd: "LOOP_SET_FD",
            errno,
        },
    )?;

    debug!(loop_dev = %loop_path.display(), backing = %backing.display(), "attached loop device");

    Ok(LoopDevice {
        path: loop_path,
        file: Some(loop_file),
        committed: false,
    })
}
