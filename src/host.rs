//! Explicit host/kernel context, threaded through setup functions instead
//! of read as ambient global state. Lets tests substitute fixture paths
//! without touching process-wide environment.

use std::path::{Path, PathBuf};

/// Collaborator contracts consumed by the rest of this crate (key
/// material and audit logging). `VerityModule` lives in its own module
/// since it has its own no-op test implementation.
use crate::key::SecretBytes;
use crate::mountentry::CryptfsMode;

pub trait KeyProvider {
    fn container_get_key(&self, mode: CryptfsMode) -> Result<SecretBytes, crate::error::Error>;
}

pub trait AuditSink {
    fn setup_crypted_volume(&self, uuid: uuid::Uuid, ok: bool);
    fn verify_image(&self, uuid: uuid::Uuid, ok: bool);
}

#[derive(Debug, Default)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn setup_crypted_volume(&self, _uuid: uuid::Uuid, _ok: bool) {}
    fn verify_image(&self, _uuid: uuid::Uuid, _ok: bool) {}
}

/// Where this compartment's on-disk state lives. Every provisioner/mount
/// function takes a `&Host` instead of hardcoding `/var/lib/...` paths.
#[derive(Debug, Clone)]
pub struct Host {
    pub images_root: PathBuf,
    pub shared_store_image: PathBuf,
    pub compartment_root: PathBuf,
}

impl Host {
    pub fn image_path(&self, uuid: uuid::Uuid, suffix: &str) -> PathBuf {
        self.images_root.join(format!("{uuid}{suffix}"))
    }

    pub fn data_image_path(&self, uuid: uuid::Uuid) -> PathBuf {
        self.image_path(uuid, ".img")
    }

    pub fn meta_image_path(&self, uuid: uuid::Uuid) -> PathBuf {
        self.image_path(uuid, ".meta.img")
    }

    pub fn mount_target(&self, entry_path: &Path) -> PathBuf {
        self.compartment_root.join(entry_path.strip_prefix("/").unwrap_or(entry_path))
    }

    pub fn data_image_path_for_label(&self, label: &str) -> PathBuf {
        self.images_root.join(format!("{label}.img"))
    }

    pub fn meta_image_path_for_label(&self, label: &str) -> PathBuf {
        self.images_root.join(format!("{label}.meta.img"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Host {
        Host {
            images_root: PathBuf::from("/var/lib/compartfs/images"),
            shared_store_image: PathBuf::from("/var/lib/compartfs/shared.img"),
            compartment_root: PathBuf::from("/run/compartfs/root-42"),
        }
    }

    #[test]
    fn image_paths_use_uuid_and_suffix() {
        let h = host();
        let id = uuid::Uuid::nil();
        assert_eq!(h.data_image_path(id), h.images_root.join(format!("{id}.img")));
        assert_eq!(h.meta_image_path(id), h.images_root.join(format!("{id}.meta.img")));
    }

    #[test]
    fn mount_target_strips_leading_slash() {
        let h = host();
        assert_eq!(
            h.mount_target(Path::new("/data")),
            h.compartment_root.join("data")
        );
    }
}
