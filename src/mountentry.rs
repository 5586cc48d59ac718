//! Data model: how a compartment's root filesystem is described before any
//! device-mapper, loop, or mount work happens.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a single path inside the compartment root is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MountType {
    Shared,
    SharedRw,
    Device,
    DeviceRw,
    Empty,
    Copy,
    OverlayRo,
    OverlayRw,
    BindFile,
    BindFileRw,
    BindDir,
    BindDirRw,
    Flash,
}

impl MountType {
    /// Entries that resolve to a writable mount once assembled.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            MountType::SharedRw
                | MountType::DeviceRw
                | MountType::Empty
                | MountType::Copy
                | MountType::OverlayRw
                | MountType::BindFileRw
                | MountType::BindDirRw
                | MountType::Flash
        )
    }

    /// Entries backed by a dm-assembled block device rather than a bind
    /// mount or tmpfs.
    pub fn is_block_backed(self) -> bool {
        matches!(
            self,
            MountType::Shared
                | MountType::SharedRw
                | MountType::Device
                | MountType::DeviceRw
                | MountType::Empty
                | MountType::Copy
                | MountType::OverlayRw
                | MountType::Flash
        )
    }

    pub fn is_bind(self) -> bool {
        matches!(
            self,
            MountType::BindFile | MountType::BindFileRw | MountType::BindDir | MountType::BindDirRw
        )
    }
}

/// Encryption/integrity composition for a block-backed volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CryptfsMode {
    /// No dm-crypt/dm-integrity stack at all; `setup_volume` is an
    /// identity passthrough over the raw/loop block device.
    NotImplemented,
    AuthEnc,
    EncryptOnly,
    IntegrityEncrypt,
    IntegrityOnly,
}

impl CryptfsMode {
    pub fn needs_meta_device(self) -> bool {
        matches!(
            self,
            CryptfsMode::IntegrityEncrypt | CryptfsMode::IntegrityOnly
        )
    }

    pub fn needs_integrity(self) -> bool {
        matches!(
            self,
            CryptfsMode::AuthEnc | CryptfsMode::IntegrityEncrypt | CryptfsMode::IntegrityOnly
        )
    }

    pub fn needs_crypt(self) -> bool {
        matches!(
            self,
            CryptfsMode::AuthEnc | CryptfsMode::EncryptOnly | CryptfsMode::IntegrityEncrypt
        )
    }
}

/// One path inside the compartment root, as deserialized from the
/// lifecycle framework's JSON configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountEntry {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub mount_type: MountType,
    /// Size in megabytes. `None` means "use the type's default."
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Filesystem for image-backed entries (`"ext4"`/`"btrfs"`); absent
    /// means `"ext4"`.
    #[serde(default)]
    pub fs: Option<String>,
    /// Extra mount options, e.g. `"subvol=<name>"` for a btrfs
    /// `OVERLAY_RW` upper.
    #[serde(default)]
    pub mount_data: Option<String>,
    #[serde(default)]
    pub cryptfs_mode: Option<CryptfsMode>,
    #[serde(default)]
    pub root_hash: Option<String>,
    #[serde(default)]
    pub allow_unverified: bool,
    #[serde(default)]
    pub idmap: bool,
}

/// Default image size (MiB) for entries that don't specify one.
pub const DEFAULT_EMPTY_SIZE_MIB: u64 = 10;

impl MountEntry {
    pub fn effective_size_mib(&self) -> u64 {
        self.size.unwrap_or(DEFAULT_EMPTY_SIZE_MIB).max(DEFAULT_EMPTY_SIZE_MIB)
    }

    pub fn effective_cryptfs_mode(&self) -> CryptfsMode {
        self.cryptfs_mode.unwrap_or(CryptfsMode::NotImplemented)
    }

    pub fn effective_fs(&self) -> &str {
        self.fs.as_deref().unwrap_or("ext4")
    }
}

/// Parse a compartment's mount-entry list out of the lifecycle
/// framework's JSON configuration (the seed a compartment daemon reads
/// off its own config store, in the same shape `wormhole`'s RPC payloads
/// take via `serde_json::from_str`).
pub fn parse_entries(json: &str) -> crate::error::Result<Vec<MountEntry>> {
    Ok(serde_json::from_str(json)?)
}

/// Scoped ownership of a resource this crate created (a loop attach, a dm
/// device, a mount point). Wraps a value plus an `undo` closure that runs
/// if the handle is dropped without `commit()`. `LoopDevice` and the dm
/// handles below implement this same shape directly when they need extra
/// fields; this generic form is for resources that are just a value plus
/// a teardown action.
pub struct VolumeState<T> {
    value: Option<T>,
    undo: Option<Box<dyn FnOnce(T) + Send>>,
}

impl<T> VolumeState<T> {
    pub fn new(value: T, undo: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            value: Some(value),
            undo: Some(Box::new(undo)),
        }
    }

    pub fn get(&self) -> &T {
        self.value.as_ref().expect("VolumeState used after commit/drop")
    }

    pub fn is_committed(&self) -> bool {
        self.value.is_none()
    }

    pub fn commit(mut self) -> T {
        self.undo = None;
        self.value.take().expect("VolumeState already committed")
    }
}

impl<T> Drop for VolumeState<T> {
    fn drop(&mut self) {
        if let (Some(value), Some(undo)) = (self.value.take(), self.undo.take()) {
            undo(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn volume_state_runs_undo_on_drop_but_not_after_commit() {
        use std::sync::{Arc, Mutex};

        let undone: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        {
            let log = undone.clone();
            let guard = VolumeState::new(1u32, move |v| log.lock().unwrap().push(v));
            drop(guard);
        }
        assert_eq!(*undone.lock().unwrap(), vec![1]);

        {
            let log = undone.clone();
            let guard = VolumeState::new(2u32, move |v| log.lock().unwrap().push(v));
            assert!(!guard.is_committed());
            let value = guard.commit();
            assert_eq!(value, 2);
        }
        // Commit must not have run the undo closure; only the drop above did.
        assert_eq!(*undone.lock().unwrap(), vec![1]);
    }

    #[test]
    fn parse_entries_reads_type_and_path_from_json() {
        let json = r#"[
            {"path": "/data", "type": "EMPTY", "size": 64},
            {"path": "/etc/resolv.conf", "type": "BIND_FILE_RW", "source": "/host/resolv.conf"}
        ]"#;
        let entries = parse_entries(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mount_type, MountType::Empty);
        assert_eq!(entries[0].effective_size_mib(), 64);
        assert_eq!(entries[1].mount_type, MountType::BindFileRw);
        assert_eq!(entries[1].source.as_deref(), Some(Path::new("/host/resolv.conf")));
    }

    #[test]
    fn parse_entries_rejects_malformed_json() {
        assert!(parse_entries("{not json").is_err());
    }

    #[test]
    fn empty_size_defaults_when_absent() {
        let e = MountEntry {
            path: "/data".into(),
            mount_type: MountType::Empty,
            size: None,
            source: None,
            fs: None,
            mount_data: None,
            cryptfs_mode: None,
            root_hash: None,
            allow_unverified: false,
            idmap: false,
        };
        assert_eq!(e.effective_size_mib(), DEFAULT_EMPTY_SIZE_MIB);
    }

    #[test]
    fn small_explicit_size_is_floored_to_the_default() {
        let e = MountEntry {
            path: "/data".into(),
            mount_type: MountType::Empty,
            size: Some(5),
            source: None,
            fs: None,
            mount_data: None,
            cryptfs_mode: None,
            root_hash: None,
            allow_unverified: false,
            idmap: false,
        };
        assert_eq!(e.effective_size_mib(), DEFAULT_EMPTY_SIZE_MIB);
    }

    #[test]
    fn explicit_size_above_the_floor_is_kept() {
        let e = MountEntry {
            path: "/data".into(),
            mount_type: MountType::Empty,
            size: Some(64),
            source: None,
            fs: None,
            mount_data: None,
            cryptfs_mode: None,
            root_hash: None,
            allow_unverified: false,
            idmap: false,
        };
        assert_eq!(e.effective_size_mib(), 64);
    }

    #[test]
    fn not_implemented_needs_nothing() {
        let m = CryptfsMode::NotImplemented;
        assert!(!m.needs_meta_device());
        assert!(!m.needs_integrity());
        assert!(!m.needs_crypt());
    }

    #[test]
    fn integrity_only_needs_meta_but_not_crypt() {
        let m = CryptfsMode::IntegrityOnly;
        assert!(m.needs_meta_device());
        assert!(m.needs_integrity());
        assert!(!m.needs_crypt());
    }

    #[test]
    fn mount_type_classification_is_disjoint_where_expected() {
        assert!(MountType::BindDirRw.is_bind());
        assert!(!MountType::BindDirRw.is_block_backed());
        assert!(MountType::OverlayRw.is_block_backed());
        assert!(MountType::OverlayRw.is_writable());
        assert!(!MountType::OverlayRo.is_writable());
    }
}
