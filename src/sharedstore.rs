//! The shared-files store: a single ext4 image that backs every
//! `BIND_FILE*` mount across every compartment on the host. Created and
//! loop-mounted once per host boot; concurrent callers converge on
//! whichever one wins the race, since a second mount at the same path
//! is a harmless no-op once the first is in place.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::loopdev;
use crate::mount;
use crate::provisioner::create_sparse_file;

const SHARED_STORE_SIZE_BYTES: u64 = 100 * 1024 * 1024;
const SHARED_STORE_SUBDIR: &str = "files_shared";
const SHARED_STORE_IMAGE: &str = "_store.img";

pub fn store_image_path(base: &Path) -> PathBuf {
    base.join(SHARED_STORE_SUBDIR).join(SHARED_STORE_IMAGE)
}

/// Whether `path` is currently a mountpoint, by comparing its device id
/// against its parent's — the same probe `mount(8)`/`findmnt` use under
/// the hood and cheap enough to call on every setup.
pub fn is_mountpoint(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    let (Ok(meta), Some(parent)) = (std::fs::metadata(path), path.parent()) else {
        return false;
    };
    match std::fs::metadata(parent) {
        Ok(parent_meta) => meta.dev() != parent_meta.dev(),
        Err(_) => false,
    }
}

/// Ensure the shared-files store exists, is formatted, and is mounted at
/// `mount_at`. Idempotent: a caller that finds it already mounted does
/// nothing further.
pub fn ensure_mounted(base: &Path, mount_at: &Path) -> Result<()> {
    if is_mountpoint(mount_at) {
        return Ok(());
    }

    let image = store_image_path(base);
    if let Some(parent) = image.parent() {
        std::fs::create_dir_all(parent).map_err(crate::error::Error::Io)?;
    }
    let freshly_created = !image.exists();
    if freshly_created {
        create_sparse_file(&image, SHARED_STORE_SIZE_BYTES)?;
    }

    let loop_dev = loopdev::attach(&image)?;
    mount::mount_image_backed(
        loop_dev.path(),
        mount_at,
        "ext4",
        mount::default_flags(false),
        None,
        freshly_created,
    )?;
    loop_dev.commit();

    info!(path = %mount_at.display(), "shared-files store mounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_image_path_is_under_files_shared() {
        let p = store_image_path(Path::new("/var/lib/compartfs"));
        assert_eq!(p, Path::new("/var/lib/compartfs/files_shared/_store.img"));
    }

    #[test]
    fn is_mountpoint_does_not_panic_on_root() {
        // "/" has no parent; the probe must degrade to `false`, not panic.
        let _ = is_mountpoint(Path::new("/"));
    }
}
