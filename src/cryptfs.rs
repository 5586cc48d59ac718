//! Composes the dm-integrity and dm-crypt builders into one of four
//! protection stacks over already-attached block devices (loop or raw),
//! zero-formats newly created meta devices so integrity MACs exist
//! before the first real read, and tears the whole stack back down
//! symmetrically on both the happy path and any failure.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::blockdev;
use crate::crypto::{self, CryptTopology};
use crate::error::{Error, Result};
use crate::integrity::{self, IntegrityHash};
use crate::key::{split_for_mode, SecretBytes};
use crate::mountentry::CryptfsMode;

/// Zero-fill chunk size for the zero-format pass over a freshly created
/// volume, matching a comfortable in-memory buffer rather than many tiny
/// writes. If this allocation itself fails (tight-memory compartment),
/// the fallback reopens the device `O_DIRECT` and zero-fills through a
/// 512-aligned 4096-byte buffer instead.
const ZERO_CHUNK_BYTES: usize = 100 * 1024 * 1024;
const DIRECT_IO_FALLBACK_CHUNK_BYTES: usize = 4096;
const DIRECT_IO_ALIGN: usize = 512;

/// A heap buffer aligned to `DIRECT_IO_ALIGN`, zeroed, for `O_DIRECT`
/// writes (the kernel rejects misaligned buffers with `EINVAL`).
struct AlignedZeroBuf {
    ptr: std::ptr::NonNull<u8>,
    layout: std::alloc::Layout,
}

impl AlignedZeroBuf {
    fn new(len: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(len, DIRECT_IO_ALIGN)
            .expect("fixed fallback chunk size/align are always valid");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = std::ptr::NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, layout }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedZeroBuf {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Tries to allocate and zero the bulk zero-fill buffer, reporting
/// failure instead of aborting so the caller can fall back to the small
/// `O_DIRECT` path rather than taking down the whole process.
fn try_alloc_zero_chunk(len: usize) -> std::result::Result<Vec<u8>, ()> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| ())?;
    buf.resize(len, 0u8);
    Ok(buf)
}

fn integrity_label(label: &str) -> String {
    format!("{label}-integrity")
}

/// A fully assembled volume: zero, one, or two dm devices on top of the
/// real/meta block devices handed in. Dropping without `commit()` tears
/// the whole stack down in reverse creation order.
pub struct CryptVolume {
    label: String,
    crypt_created: bool,
    integrity_created: bool,
    final_path: PathBuf,
    committed: bool,
}

impl CryptVolume {
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    pub fn commit(mut self) -> PathBuf {
        self.committed = true;
        self.final_path.clone()
    }
}

impl Drop for CryptVolume {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        warn!(label = %self.label, "dropping uncommitted crypt volume, tearing down");
        if self.crypt_created {
            if let Err(errno) = crypto::remove(&self.label) {
                if errno != nix::errno::Errno::ENXIO {
                    warn!(label = %self.label, %errno, "failed to remove crypt device on unwind");
                }
            }
        }
        if self.integrity_created {
            let name = integrity_label(&self.label);
            if let Err(errno) = integrity::remove(&name) {
                if errno != nix::errno::Errno::ENXIO {
                    warn!(name, %errno, "failed to remove integrity device on unwind");
                }
            }
        }
    }
}

fn validate_mode(mode: CryptfsMode, meta_blkdev: Option<&Path>) -> Result<()> {
    if mode.needs_meta_device() && meta_blkdev.is_none() {
        return Err(Error::MissingMetaDevice);
    }
    Ok(())
}

/// `setup_volume(label, real_blkdev, key_hex, meta_blkdev?, mode) ->
/// crypto_blkdev_path`. `NOT_IMPLEMENTED` passes `real_blkdev` through
/// unchanged with no dm devices created at all.
pub fn setup_volume(
    label: &str,
    real_blkdev: &Path,
    meta_blkdev: Option<&Path>,
    key_hex: SecretBytes,
    mode: CryptfsMode,
) -> Result<CryptVolume> {
    validate_mode(mode, meta_blkdev)?;

    if mode == CryptfsMode::NotImplemented {
        return Ok(CryptVolume {
            label: label.to_string(),
            crypt_created: false,
            integrity_created: false,
            final_path: real_blkdev.to_path_buf(),
            committed: false,
        });
    }

    let fs_size_sectors = blockdev::size_512_sectors(real_blkdev)?;
    if fs_size_sectors == 0 {
        return Err(Error::ZeroSizedVolume);
    }

    let split = split_for_mode(mode, key_hex)?;
    let integ_name = integrity_label(label);

    let mut integrity_created = false;
    let mut crypt_created = false;
    let mut needs_format = false;

    let build = || -> Result<PathBuf> {
        let integrity_target_path = if mode.needs_integrity() {
            let meta_dev = meta_blkdev.expect("validated above");
            needs_format = integrity::needs_initial_format(meta_dev, fs_size_sectors)?;
            let hash = match &split.integrity_key {
                Some(key) => IntegrityHash::Hmac(key),
                None => IntegrityHash::Stacked,
            };
            integrity::create(&integ_name, real_blkdev, meta_dev, fs_size_sectors, &hash)?;
            integrity_created = true;
            Some(PathBuf::from(format!("/dev/mapper/{integ_name}")))
        } else {
            None
        };

        if let Some(crypt_key) = &split.crypt_key {
            let backing_for_crypt = integrity_target_path
                .as_deref()
                .unwrap_or(real_blkdev);
            let topology = if integrity_target_path.is_some() && split.integrity_key.is_none() {
                CryptTopology::StackedOnIntegrity {
                    tag_size: integrity::TAG_SIZE,
                }
            } else {
                CryptTopology::Standalone
            };
            crypto::create(label, backing_for_crypt, fs_size_sectors, crypt_key, topology)?;
            crypt_created = true;
            return Ok(PathBuf::from(format!("/dev/mapper/{label}")));
        }

        Ok(integrity_target_path.unwrap_or_else(|| real_blkdev.to_path_buf()))
    };

    let result = build();

    match result {
        Ok(final_path) => {
            if needs_format {
                if let Err(err) = initial_format(&final_path, fs_size_sectors) {
                    if crypt_created {
                        let _ = crypto::remove(label);
                    }
                    if integrity_created {
                        let _ = integrity::remove(&integ_name);
                    }
                    return Err(err);
                }
            }
            info!(label, ?mode, path = %final_path.display(), "crypt volume assembled");
            Ok(CryptVolume {
                label: label.to_string(),
                crypt_created,
                integrity_created,
                final_path,
                committed: false,
            })
        }
        Err(err) => {
            if crypt_created {
                let _ = crypto::remove(label);
            }
            if integrity_created {
                let _ = integrity::remove(&integ_name);
            }
            Err(err)
        }
    }
}

/// Tear down a committed volume explicitly (as opposed to relying on a
/// never-committed `CryptVolume`'s `Drop`). Removes crypt first (if
/// present), then the `<label>-integrity` device, tolerating `ENXIO`.
pub fn delete_blk_dev(label: &str, mode: CryptfsMode) -> std::result::Result<(), nix::errno::Errno> {
    if mode.needs_crypt() {
        match crypto::remove(label) {
            Ok(()) | Err(nix::errno::Errno::ENXIO) => {}
            Err(e) => return Err(e),
        }
    }
    if mode.needs_integrity() {
        let name = integrity_label(label);
        match integrity::remove(&name) {
            Ok(()) | Err(nix::errno::Errno::ENXIO) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Zero-fill `fs_size_sectors * 512` bytes through `topmost_dev` so
/// dm-integrity's MACs exist before the first real read. A final `fsync`
/// is mandatory before returning. Falls back to `initial_format_direct_fallback`
/// only when the 100MiB buffer itself can't be allocated.
fn initial_format(topmost_dev: &Path, fs_size_sectors: u64) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;

    let total_bytes = fs_size_sectors * 512;

    let chunk = match try_alloc_zero_chunk(ZERO_CHUNK_BYTES) {
        Ok(chunk) => chunk,
        Err(()) => return initial_format_direct_fallback(topmost_dev, total_bytes),
    };

    let mut f = OpenOptions::new()
        .write(true)
        .open(topmost_dev)
        .map_err(Error::Io)?;

    let mut remaining = total_bytes;
    while remaining > 0 {
        let n = remaining.min(chunk.len() as u64) as usize;
        f.write_all(&chunk[..n]).map_err(Error::Io)?;
        remaining -= n as u64;
    }
    f.flush().map_err(Error::Io)?;
    f.sync_all().map_err(Error::Io)?;
    Ok(())
}

/// Reopens `topmost_dev` `O_DIRECT` and zero-fills it through a
/// 512-aligned 4096-byte buffer. Used only when the bulk zero-fill
/// buffer in `initial_format` fails to allocate.
fn initial_format_direct_fallback(topmost_dev: &Path, total_bytes: u64) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    warn!(
        buffer_bytes = ZERO_CHUNK_BYTES,
        "bulk zero-fill buffer allocation failed, falling back to O_DIRECT aligned writes"
    );

    let mut f = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_DIRECT)
        .open(topmost_dev)
        .map_err(Error::Io)?;

    let chunk = AlignedZeroBuf::new(DIRECT_IO_FALLBACK_CHUNK_BYTES);
    let mut remaining = total_bytes;
    while remaining > 0 {
        let n = remaining.min(chunk.as_slice().len() as u64) as usize;
        f.write_all(&chunk.as_slice()[..n]).map_err(Error::Io)?;
        remaining -= n as u64;
    }
    f.flush().map_err(Error::Io)?;
    f.sync_all().map_err(Error::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_meta_device_rejected_for_integrity_modes() {
        crate::test_support::init_tracing();
        let key = SecretBytes::from_hex("00").unwrap();
        let err = setup_volume(
            "compartfs-test",
            Path::new("/dev/loop0"),
            None,
            key,
            CryptfsMode::IntegrityOnly,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingMetaDevice));
    }

    #[test]
    fn not_implemented_mode_is_identity_passthrough() {
        let key = SecretBytes::from_hex("00").unwrap();
        let vol = setup_volume(
            "compartfs-test",
            Path::new("/dev/loop0"),
            None,
            key,
            CryptfsMode::NotImplemented,
        )
        .unwrap();
        assert_eq!(vol.path(), Path::new("/dev/loop0"));
        vol.commit();
    }

    #[test]
    fn initial_format_zero_fills_the_requested_extent() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let sectors = 10; // 5120 bytes, spans a partial final chunk
        std::fs::write(file.path(), vec![0xffu8; 8192]).unwrap();

        initial_format(file.path(), sectors).unwrap();

        let written = std::fs::read(file.path()).unwrap();
        assert_eq!(&written[..(sectors * 512) as usize], &vec![0u8; (sectors * 512) as usize][..]);
    }

    #[test]
    fn zero_chunk_allocation_failure_is_reported_not_aborted() {
        assert!(try_alloc_zero_chunk(usize::MAX).is_err());
        assert!(try_alloc_zero_chunk(64).is_ok());
    }

    #[test]
    fn aligned_zero_buf_is_zeroed_and_block_aligned() {
        let buf = AlignedZeroBuf::new(DIRECT_IO_FALLBACK_CHUNK_BYTES);
        assert_eq!(buf.as_slice().len(), DIRECT_IO_FALLBACK_CHUNK_BYTES);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        assert_eq!(buf.ptr.as_ptr() as usize % DIRECT_IO_ALIGN, 0);
    }
}
