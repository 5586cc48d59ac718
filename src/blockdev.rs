//! Block device geometry queries (`BLKGETSIZE64`, `BLKSSZGET`), used to
//! size dm targets and split available space across a volume's members.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use libc::{c_int, size_t};

use crate::error::{Error, Result};

mod ioctl {
    use super::*;

    nix::ioctl_read!(blkgetsize64, 0x12, 114, size_t);
    nix::ioctl_read!(blkszget, 0x12, 104, c_int);
}

/// Device size in bytes, via `BLKGETSIZE64`.
pub fn size_bytes(path: &Path) -> Result<u64> {
    let f = File::open(path).map_err(|_| Error::BlockDeviceUnreadable(path.to_path_buf()))?;
    let mut size: size_t = 0;
    unsafe { ioctl::blkgetsize64(f.as_raw_fd(), &mut size) }
        .map_err(|errno| Error::IoctlFailed {
            cmd: "BLKGETSIZE64",
            errno,
        })?;
    Ok(size as u64)
}

/// Logical sector size in bytes, via `BLKSSZGET`. Almost always 512 but
/// loop devices backed by 4Kn media can report otherwise.
pub fn sector_size(path: &Path) -> Result<u32> {
    let f = File::open(path).map_err(|_| Error::BlockDeviceUnreadable(path.to_path_buf()))?;
    let mut sz: c_int = 0;
    unsafe { ioctl::blkszget(f.as_raw_fd(), &mut sz) }.map_err(|errno| Error::IoctlFailed {
        cmd: "BLKSSZGET",
        errno,
    })?;
    Ok(sz as u32)
}

/// Device size expressed in 512-byte dm sectors, the unit every dm target
/// table line uses regardless of the device's native logical sector size.
pub fn size_512_sectors(path: &Path) -> Result<u64> {
    Ok(size_bytes(path)? / 512)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_unreadable_not_panic() {
        let err = size_bytes(Path::new("/nonexistent/compartfs-test-dev")).unwrap_err();
        assert!(matches!(err, Error::BlockDeviceUnreadable(_)));
    }
}
