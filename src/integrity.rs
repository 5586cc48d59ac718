//! dm-integrity target: builds the table line, probes an existing
//! integrity superblock to recover its data-area size before reattaching.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use zeroize::Zeroizing;

use crate::dm::control;
use crate::error::{Error, Result};
use crate::key::SecretBytes;

/// `dm-integrity`'s on-disk superblock magic, "integrt" not padded;
/// the field is 8 bytes wide so only the first 7 are meaningful.
const INTEGRITY_MAGIC: &[u8; 7] = b"integrt";
const SB_PROVIDED_DATA_SECTORS_OFFSET: usize = 16;

/// Authenticated tag size in bytes for the tag every mode here asks
/// dm-integrity for.
pub const TAG_SIZE: u32 = 32;

/// Whether the integrity target itself computes the per-sector HMAC
/// (standalone `INTEGRITY_ONLY`/`INTEGRITY_ENCRYPT`) or leaves
/// authentication to a stacked `authenc` crypt target (`AUTHENC`).
pub enum IntegrityHash<'a> {
    Stacked,
    Hmac(&'a SecretBytes),
}

/// Parameters composed as `<real_blkdev> 0 <tag_size> J <extra_params>`.
/// Returned wrapped in `Zeroizing` since the `Hmac` variant inlines the
/// hex key into the string.
fn build_target_params(
    real_blkdev: &Path,
    meta_dev: &Path,
    hash: &IntegrityHash<'_>,
) -> Zeroizing<String> {
    let extra = Zeroizing::new(match hash {
        IntegrityHash::Stacked => format!("1 meta_device:{}", meta_dev.display()),
        IntegrityHash::Hmac(key) => {
            let hex_key = Zeroizing::new(key.to_hex());
            format!(
                "3 meta_device:{} internal_hash:hmac(sha256):{} allow_discards",
                meta_dev.display(),
                *hex_key
            )
        }
    });
    Zeroizing::new(format!("{} 0 {} J {}", real_blkdev.display(), TAG_SIZE, *extra))
}

/// Create and activate a dm-integrity device named `name` over
/// `real_blkdev`, with its journal/metadata on `meta_dev`.
pub fn create(
    name: &str,
    real_blkdev: &Path,
    meta_dev: &Path,
    fs_size_sectors: u64,
    hash: &IntegrityHash<'_>,
) -> Result<()> {
    control::create(name)?;
    let params = build_target_params(real_blkdev, meta_dev, hash);
    control::load_table(name, "integrity", fs_size_sectors, &params, false)?;
    control::suspend_or_resume(name)?;
    control::ensure_device_node(name)?;
    Ok(())
}

/// Read `provided_data_sectors` out of an existing dm-integrity
/// superblock, to recover the data-area size of a meta device created by
/// a previous session without re-deriving it from scratch. Returns
/// `Ok(None)` when the device has no `"integrt"` magic yet (fresh meta
/// device, not a format error).
pub fn probe_provided_data_sectors(meta_dev: &Path) -> Result<Option<u64>> {
    let mut f =
        File::open(meta_dev).map_err(|_| Error::BlockDeviceUnreadable(meta_dev.to_path_buf()))?;
    let mut header = [0u8; 32];
    f.read_exact(&mut header).map_err(Error::Io)?;
    if &header[0..7] != INTEGRITY_MAGIC {
        return Ok(None);
    }
    let bytes: [u8; 8] = header
        [SB_PROVIDED_DATA_SECTORS_OFFSET..SB_PROVIDED_DATA_SECTORS_OFFSET + 8]
        .try_into()
        .expect("slice is exactly 8 bytes");
    Ok(Some(u64::from_le_bytes(bytes)))
}

/// Whether a fresh zero-format pass is needed: true when the meta device
/// has no superblock yet, or its recorded data-area size doesn't match
/// what this invocation expects.
pub fn needs_initial_format(meta_dev: &Path, expected_sectors: u64) -> Result<bool> {
    Ok(match probe_provided_data_sectors(meta_dev)? {
        None => true,
        Some(actual) => actual != expected_sectors,
    })
}

pub fn remove(name: &str) -> std::result::Result<(), nix::errno::Errno> {
    control::remove(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stacked_target_params_carry_only_meta_device() {
        let line = build_target_params(
            Path::new("/dev/loop5"),
            Path::new("/dev/loop7"),
            &IntegrityHash::Stacked,
        );
        assert_eq!(line.as_str(), "/dev/loop5 0 32 J 1 meta_device:/dev/loop7");
    }

    #[test]
    fn hmac_target_params_carry_key_and_discards() {
        let key = SecretBytes::from_hex("aabb").unwrap();
        let line = build_target_params(
            Path::new("/dev/loop5"),
            Path::new("/dev/loop7"),
            &IntegrityHash::Hmac(&key),
        );
        assert_eq!(
            line.as_str(),
            "/dev/loop5 0 32 J 3 meta_device:/dev/loop7 internal_hash:hmac(sha256):aabb allow_discards"
        );
    }

    #[test]
    fn probe_rejects_missing_file() {
        let err =
            probe_provided_data_sectors(Path::new("/nonexistent/compartfs-meta")).unwrap_err();
        assert!(matches!(err, Error::BlockDeviceUnreadable(_)));
    }
}
