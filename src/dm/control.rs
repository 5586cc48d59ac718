//! Typed wrappers over `/dev/mapper/control` ioctls: create, table load,
//! suspend/resume, remove, status, target-type query.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::thread::sleep;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

use super::ioctl::{
    build_header_only, build_table_load, minor_major, read_first_target_type, read_header,
    DM_BUFFER_SIZE, DM_CONTROL_PATH, DM_DEV_CREATE_CMD, DM_DEV_REMOVE_CMD, DM_DEV_STATUS_CMD,
    DM_DEV_SUSPEND_CMD, DM_EXISTS_FLAG, DM_IOCTL_MAGIC, DM_TABLE_LOAD_CMD, DM_TABLE_STATUS_CMD,
};
use super::ioctl::DmIoctl;

mod raw {
    use super::DmIoctl;

    nix::ioctl_readwrite!(dev_create, super::DM_IOCTL_MAGIC, super::DM_DEV_CREATE_CMD, DmIoctl);
    nix::ioctl_readwrite!(dev_remove, super::DM_IOCTL_MAGIC, super::DM_DEV_REMOVE_CMD, DmIoctl);
    nix::ioctl_readwrite!(dev_suspend, super::DM_IOCTL_MAGIC, super::DM_DEV_SUSPEND_CMD, DmIoctl);
    nix::ioctl_readwrite!(dev_status, super::DM_IOCTL_MAGIC, super::DM_DEV_STATUS_CMD, DmIoctl);
    nix::ioctl_readwrite!(table_load, super::DM_IOCTL_MAGIC, super::DM_TABLE_LOAD_CMD, DmIoctl);
    nix::ioctl_readwrite!(table_status, super::DM_IOCTL_MAGIC, super::DM_TABLE_STATUS_CMD, DmIoctl);
}

/// Retries for `CREATE`/`TABLE_LOAD`, which can transiently race udev and
/// kernel device registration.
const RETRY_ATTEMPTS: u32 = 10;
const RETRY_SLEEP: Duration = Duration::from_millis(500);

fn control_fd() -> Result<std::fs::File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(DM_CONTROL_PATH)
        .map_err(Error::Io)
}

fn retry<F>(cmd: &'static str, mut attempt: F) -> Result<()>
where
    F: FnMut() -> std::result::Result<(), Errno>,
{
    let mut last_errno = Errno::UnknownErrno;
    for try_num in 1..=RETRY_ATTEMPTS {
        match attempt() {
            Ok(()) => return Ok(()),
            Err(errno) => {
                last_errno = errno;
                debug!(cmd, try_num, %errno, "dm ioctl attempt failed, retrying");
                sleep(RETRY_SLEEP);
            }
        }
    }
    warn!(cmd, %last_errno, "dm ioctl exhausted retries");
    Err(Error::RetryExhausted { cmd })
}

/// `DM_DEV_CREATE`. Retried up to 10 times.
pub fn create(name: &str) -> Result<()> {
    let fd = control_fd()?;
    retry("DM_DEV_CREATE", || {
        let mut buf = build_header_only(name, 0).map_err(|_| Errno::EINVAL)?;
        unsafe { raw::dev_create(fd.as_raw_fd(), buf.as_mut_ptr().cast()) }?;
        Ok(())
    })
}

/// `DM_TABLE_LOAD`. Retried up to 10 times. Sets `DM_EXISTS_FLAG` when
/// `exists_flag` is requested (crypt-table loads want this set). The
/// ioctl buffer carries the target's hex key inline (see
/// `dm::ioctl::build_table_load`), so it's held in a `Zeroizing` wrapper
/// and scrubbed as soon as this attempt returns, successful or not.
pub fn load_table(
    name: &str,
    target_type: &str,
    sector_count: u64,
    params: &str,
    exists_flag: bool,
) -> Result<()> {
    let fd = control_fd()?;
    let flags = if exists_flag { DM_EXISTS_FLAG } else { 0 };
    retry("DM_TABLE_LOAD", || {
        let mut buf = Zeroizing::new(
            build_table_load(name, target_type, sector_count, params, flags)
                .map_err(|_| Errno::EINVAL)?,
        );
        unsafe { raw::table_load(fd.as_raw_fd(), buf.as_mut_ptr().cast()) }?;
        Ok(())
    })
}

/// `DM_DEV_SUSPEND` with no flags set resumes a suspended device; this is
/// how a freshly loaded table becomes live.
pub fn suspend_or_resume(name: &str) -> Result<()> {
    let fd = control_fd()?;
    let mut buf = build_header_only(name, 0)?;
    unsafe { raw::dev_suspend(fd.as_raw_fd(), buf.as_mut_ptr().cast()) }.map_err(|errno| {
        Error::IoctlFailed {
            cmd: "DM_DEV_SUSPEND",
            errno,
        }
    })?;
    Ok(())
}

/// `DM_DEV_REMOVE`. `ENXIO` (device already gone) is mapped by the caller,
/// not here — this returns the raw errno so callers can apply the
/// "ENXIO is not an error" policy themselves.
pub fn remove(name: &str) -> std::result::Result<(), Errno> {
    let fd = control_fd().map_err(|_| Errno::EIO)?;
    let mut buf = build_header_only(name, 0).map_err(|_| Errno::EINVAL)?;
    unsafe { raw::dev_remove(fd.as_raw_fd(), buf.as_mut_ptr().cast()) }?;
    Ok(())
}

/// Result of `DM_DEV_STATUS`: device id plus the kernel-assigned
/// major/minor for the `/dev/mapper/<name>` node.
#[derive(Debug, Clone, Copy)]
pub struct DevStatus {
    pub dev: u64,
    pub open_count: i32,
}

/// `DM_DEV_STATUS`. Absence of the device (`ENXIO`) is a distinguishable
/// `Ok(None)`, not an error.
pub fn status(name: &str) -> Result<Option<DevStatus>> {
    let fd = control_fd()?;
    let mut buf = build_header_only(name, 0)?;
    match unsafe { raw::dev_status(fd.as_raw_fd(), buf.as_mut_ptr().cast()) } {
        Ok(_) => {
            let hdr = read_header(&buf);
            Ok(Some(DevStatus {
                dev: hdr.dev,
                open_count: hdr.open_count,
            }))
        }
        Err(Errno::ENXIO) => Ok(None),
        Err(errno) => Err(Error::IoctlFailed {
            cmd: "DM_DEV_STATUS",
            errno,
        }),
    }
}

/// Create `/dev/mapper/<name>` via `mknod`, using the major/minor
/// `DM_DEV_STATUS` reports for the just-activated device. `EEXIST` is
/// benign — a previous run or udev may have already created the node.
pub fn ensure_device_node(name: &str) -> Result<()> {
    let dev_status = status(name)?.ok_or_else(|| Error::IoctlFailed {
        cmd: "DM_DEV_STATUS(ensure_device_node)",
        errno: Errno::ENXIO,
    })?;
    let (major, minor) = minor_major(dev_status.dev);
    let path = format!("/dev/mapper/{name}");
    let dev = makedev(major as u64, minor as u64);
    match mknod(path.as_str(), SFlag::S_IFBLK, Mode::from_bits_truncate(0o660), dev) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(Error::IoctlFailed {
            cmd: "mknod(/dev/mapper)",
            errno,
        }),
    }
}

/// `DM_TABLE_STATUS`, reading back the live table and returning the
/// `target_type` string (`"crypt"`, `"integrity"`, `"verity"`, ...).
/// Absence of the device is `Ok(None)`.
pub fn query_target_type(name: &str) -> Result<Option<String>> {
    let fd = control_fd()?;
    let mut buf = vec![0u8; DM_BUFFER_SIZE];
    {
        // DM_TABLE_STATUS needs a populated header (name) same as others;
        // reuse the header-only builder for the request half.
        let req = build_header_only(name, 0)?;
        buf[..req.len()].copy_from_slice(&req);
    }
    match unsafe { raw::table_status(fd.as_raw_fd(), buf.as_mut_ptr().cast()) } {
        Ok(_) => Ok(read_first_target_type(&buf)),
        Err(Errno::ENXIO) => Ok(None),
        Err(errno) => Err(Error::IoctlFailed {
            cmd: "DM_TABLE_STATUS",
            errno,
        }),
    }
}
