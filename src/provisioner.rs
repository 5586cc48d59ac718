//! Image provisioner: for each mount entry, ensures a backing image file
//! (or raw device reference) exists before the mount engine attaches a
//! loop device to it.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::host::Host;
use crate::mountentry::{MountEntry, MountType};

const MIB: u64 = 1024 * 1024;

/// Meta-image size as a fraction of the data image: dm-integrity's
/// per-sector tags plus journal overhead are roughly 1/250th of the data
/// area, rounded up with an 8 MiB floor so small volumes still get a
/// usable journal.
const META_FACTOR_DENOM: u64 = 250;
const META_MIN_BYTES: u64 = 8 * MIB;

fn meta_image_size_bytes(data_size_bytes: u64) -> u64 {
    (data_size_bytes / META_FACTOR_DENOM).max(META_MIN_BYTES)
}

/// `open(O_CREAT|O_TRUNC|O_WRONLY|O_LARGEFILE) -> ftruncate(size) ->
/// lseek(size-1); write("\0", 1) -> fallocate(FALLOC_FL_ZERO_RANGE, 0, size)`.
/// The single trailing byte write forces the apparent file size even on
/// filesystems that don't honor `ftruncate` extension for sparse files;
/// the zero-range fallocation then materializes (or at least zero-reads)
/// the whole range without allocating it eagerly.
pub fn create_sparse_file(path: &Path, size_bytes: u64) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .custom_flags(libc::O_LARGEFILE)
        .open(path)
        .map_err(Error::Io)?;

    f.set_len(size_bytes).map_err(Error::Io)?;

    if size_bytes > 0 {
        f.seek(SeekFrom::Start(size_bytes - 1)).map_err(Error::Io)?;
        f.write_all(&[0u8]).map_err(Error::Io)?;
    }

    let ret = unsafe {
        libc::fallocate(
            f.as_raw_fd(),
            libc::FALLOC_FL_ZERO_RANGE,
            0,
            size_bytes as libc::off_t,
        )
    };
    if ret != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Result of provisioning one mount entry's backing image(s).
pub struct ProvisionedImage {
    pub data_path: PathBuf,
    pub meta_path: Option<PathBuf>,
    /// True when the data image didn't exist before this call — the
    /// cryptfs orchestrator uses this together with the meta-device probe
    /// to decide whether a zero-format pass is needed.
    pub freshly_created: bool,
}

fn byte_copy(src: &Path, dst: &Path) -> Result<()> {
    std::fs::copy(src, dst).map_err(Error::Io)?;
    Ok(())
}

/// Regenerate a btrfs image's device UUID so two compartments copying
/// from the same guest-OS source image don't collide on it.
fn regenerate_btrfs_uuid(img: &Path) -> Result<()> {
    debug!(path = %img.display(), "regenerating btrfs UUID");
    let status = Command::new("btrfstune")
        .arg("-u")
        .arg(img)
        .status()
        .map_err(Error::Io)?;
    if !status.success() {
        return Err(Error::FormatFailed {
            dev: img.display().to_string(),
            fs: "btrfs".to_string(),
        });
    }
    Ok(())
}

fn is_btrfs_image(img: &Path) -> bool {
    let mut magic = [0u8; 8];
    let Ok(mut f) = std::fs::File::open(img) else {
        return false;
    };
    use std::io::{Read, Seek as _, SeekFrom as _};
    if f.seek(SeekFrom::Start(0x10040)).is_err() {
        return false;
    }
    if f.read_exact(&mut magic).is_err() {
        return false;
    }
    &magic == b"_BHRfS_M"
}

/// Provision the backing image(s) for one mount entry.
pub fn provision(host: &Host, label: &str, entry: &MountEntry, needs_meta: bool) -> Result<ProvisionedImage> {
    match entry.mount_type {
        MountType::Shared
        | MountType::SharedRw
        | MountType::OverlayRo
        | MountType::Flash => {
            let img = entry
                .source
                .clone()
                .ok_or_else(|| Error::OverlayAssemblyFailed("missing source image for guest-os-backed entry"))?;
            Ok(ProvisionedImage {
                data_path: img,
                meta_path: None,
                freshly_created: false,
            })
        }

        MountType::Empty | MountType::OverlayRw => {
            let data_path = host.data_image_path_for_label(label);
            let freshly_created = !data_path.exists();
            let size_bytes = entry.effective_size_mib() * MIB;
            if freshly_created {
                create_sparse_file(&data_path, size_bytes)?;
            }

            let meta_path = if needs_meta {
                let meta_path = host.meta_image_path_for_label(label);
                if !meta_path.exists() {
                    create_sparse_file(&meta_path, meta_image_size_bytes(size_bytes))?;
                }
                Some(meta_path)
            } else {
                None
            };

            info!(label, path = %data_path.display(), freshly_created, "provisioned image");
            Ok(ProvisionedImage {
                data_path,
                meta_path,
                freshly_created,
            })
        }

        MountType::Copy => {
            let src = entry
                .source
                .clone()
                .ok_or_else(|| Error::OverlayAssemblyFailed("COPY entry missing source image"))?;
            let dst = host.data_image_path_for_label(label);
            let freshly_created = !dst.exists();
            if freshly_created {
                byte_copy(&src, &dst)?;
                if is_btrfs_image(&dst) {
                    regenerate_btrfs_uuid(&dst)?;
                }
            }
            Ok(ProvisionedImage {
                data_path: dst,
                meta_path: None,
                freshly_created,
            })
        }

        MountType::Device | MountType::DeviceRw => {
            let src = entry
                .source
                .clone()
                .ok_or_else(|| Error::OverlayAssemblyFailed("DEVICE entry missing source path"))?;
            if !src.is_absolute() {
                return Err(Error::OverlayAssemblyFailed(
                    "DEVICE entry source must be an absolute path",
                ));
            }
            Ok(ProvisionedImage {
                data_path: src,
                meta_path: None,
                freshly_created: false,
            })
        }

        MountType::BindFile
        | MountType::BindFileRw
        | MountType::BindDir
        | MountType::BindDirRw => {
            let src = entry
                .source
                .clone()
                .ok_or_else(|| Error::OverlayAssemblyFailed("bind entry missing source path"))?;
            Ok(ProvisionedImage {
                data_path: src,
                meta_path: None,
                freshly_created: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_image_size_has_a_floor() {
        assert_eq!(meta_image_size_bytes(1 * MIB), META_MIN_BYTES);
    }

    #[test]
    fn meta_image_size_scales_with_data_once_past_the_floor() {
        let size = meta_image_size_bytes(4000 * MIB);
        assert_eq!(size, 16 * MIB);
    }

    #[test]
    fn create_sparse_file_has_exact_apparent_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.img");
        create_sparse_file(&path, 10 * MIB).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 10 * MIB);
    }

    /// Chains a few fallible filesystem steps with `?`; `anyhow` is the
    /// crate's test-only error boundary (the public API stays on the
    /// typed `Error` above).
    #[test]
    fn copy_provisioned_entry_produces_new_image_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host {
            images_root: dir.path().to_path_buf(),
            shared_store_image: dir.path().join("shared.img"),
            compartment_root: dir.path().join("root"),
        };
        let src = dir.path().join("guestos.img");
        create_sparse_file(&src, MIB)?;

        let entry = MountEntry {
            path: "/".into(),
            mount_type: MountType::Copy,
            size: None,
            source: Some(src),
            fs: None,
            mount_data: None,
            cryptfs_mode: None,
            root_hash: None,
            allow_unverified: false,
            idmap: false,
        };
        let first = provision(&host, "compartfs-test-copy", &entry, false)?;
        assert!(first.freshly_created);

        let second = provision(&host, "compartfs-test-copy", &entry, false)?;
        assert!(!second.freshly_created, "a second provision call must not re-copy");
        assert_eq!(first.data_path, second.data_path);
        Ok(())
    }
}
