//! Per-entry mount assembly: the `mount-entry list → image provisioner →
//! loop attach → (verity? integrity? crypt?) dm stack → mknod device
//! node → filesystem mount → overlayfs compose → id-shift` pipeline for
//! one [`MountEntry`], tying every lower-level module in this crate
//! together into the single operation a compartment lifecycle framework
//! actually calls once per entry, in order.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cryptfs::{self, CryptVolume};
use crate::error::{Error, Result};
use crate::host::{Host, KeyProvider};
use crate::idmap::{self, UserNamespace};
use crate::loopdev::{self, LoopDevice};
use crate::mount::{bind_mount, default_flags, ensure_dir, is_read_only_type, mount_image_backed, mount_root_tmpfs, mount_tmpfs, seal_private, wait_for_device_node};
use crate::mountentry::{CryptfsMode, MountEntry, MountType};
use crate::overlay::{self, OverlayPaths};
use crate::provisioner::{self, ProvisionedImage};
use crate::verity::VerityModule;

/// Everything that stays alive for one assembled entry once setup
/// succeeds: the loop device (if any) and the crypt/integrity stack (if
/// any), both already committed, plus the target path that was mounted.
/// Held by the caller for the lifetime of the compartment and handed
/// back to teardown when it stops.
pub struct AssembledEntry {
    pub target: PathBuf,
    pub loop_device: Option<PathBuf>,
    pub dm_label: Option<String>,
    /// Overlay scratch directory (upper/work), set only for
    /// `OVERLAY_RO`/`OVERLAY_RW`/`SHARED_RW` entries.
    pub overlay_scratch: Option<PathBuf>,
}

/// Fixed context for assembling every entry of one compartment.
pub struct EntryContext<'a> {
    pub host: &'a Host,
    pub compartment: Uuid,
    pub setup_mode: bool,
    pub in_user_ns: bool,
    pub has_net_ns: bool,
}

impl<'a> EntryContext<'a> {
    fn label_for(&self, entry_name: &str) -> String {
        format!("{}-{}", self.compartment, entry_name)
    }
}

fn is_overlay_composed(mount_type: MountType) -> bool {
    matches!(
        mount_type,
        MountType::OverlayRo | MountType::OverlayRw | MountType::SharedRw
    )
}

/// Assemble one mount entry under the compartment root. `entry_name` is
/// the stable identifier (e.g. derived from `entry.path`) used to build
/// dm labels and image file names; `overlay_counter` is this
/// compartment's monotonically increasing overlay-scratch counter.
pub fn assemble(
    ctx: &EntryContext<'_>,
    entry: &MountEntry,
    entry_name: &str,
    key_provider: &dyn KeyProvider,
    verity: &dyn VerityModule,
    userns: Option<&UserNamespace>,
    overlay_counter: u32,
) -> Result<AssembledEntry> {
    let target = ctx.host.mount_target(&entry.path);
    let flags = default_flags(ctx.setup_mode);
    let ro = is_read_only_type(entry.mount_type) && !entry.mount_type.is_writable();

    if entry.mount_type == MountType::Flash {
        // Assumed to already be mounted by firmware before this process runs.
        return Ok(AssembledEntry {
            target,
            loop_device: None,
            dm_label: None,
            overlay_scratch: None,
        });
    }

    if entry.mount_type.is_bind() {
        if ctx.in_user_ns {
            info!(path = %entry.path.display(), "skipping bind mount under user namespace");
            return Ok(AssembledEntry {
                target,
                loop_device: None,
                dm_label: None,
                overlay_scratch: None,
            });
        }
        let src = entry
            .source
            .as_deref()
            .ok_or_else(|| Error::OverlayAssemblyFailed("bind entry missing source path"))?;
        if matches!(entry.mount_type, MountType::BindFile | MountType::BindFileRw) {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            if !target.exists() {
                std::fs::File::create(&target).map_err(Error::Io)?;
            }
        } else {
            ensure_dir(&target)?;
        }
        bind_mount(src, &target, flags, ro)?;
        seal_private(&target)?;
        maybe_idmap(entry, &target, userns)?;
        return Ok(AssembledEntry {
            target,
            loop_device: None,
            dm_label: None,
            overlay_scratch: None,
        });
    }

    // A tmpfs-backed entry (no on-disk image at all) bypasses provisioning,
    // loop attach, and dm entirely, regardless of its nominal MountType.
    // The compartment root itself is typically mounted this way.
    if entry.fs.as_deref() == Some("tmpfs") {
        mount_root_tmpfs(&target, flags, entry.mount_data.as_deref(), ctx.setup_mode)?;
        seal_private(&target)?;
        maybe_idmap(entry, &target, userns)?;
        return Ok(AssembledEntry {
            target,
            loop_device: None,
            dm_label: None,
            overlay_scratch: None,
        });
    }

    if entry.mount_type == MountType::Shared
        || entry.mount_type == MountType::SharedRw
        || entry.mount_type == MountType::Device
        || entry.mount_type == MountType::DeviceRw
        || entry.mount_type == MountType::Empty
        || entry.mount_type == MountType::Copy
        || entry.mount_type == MountType::OverlayRo
        || entry.mount_type == MountType::OverlayRw
    {
        return assemble_image_backed(ctx, entry, entry_name, &target, flags, ro, key_provider, verity, userns, overlay_counter);
    }

    // No remaining MountType maps here; `mount_tmpfs` stays available as
    // the primitive `mount_root_tmpfs` above builds on.
    mount_tmpfs(&target, flags, entry.mount_data.as_deref())?;
    seal_private(&target)?;
    Ok(AssembledEntry {
        target,
        loop_device: None,
        dm_label: None,
        overlay_scratch: None,
    })
}

#[allow(clippy::too_many_arguments)]
fn assemble_image_backed(
    ctx: &EntryContext<'_>,
    entry: &MountEntry,
    entry_name: &str,
    target: &Path,
    flags: MsFlags,
    ro: bool,
    key_provider: &dyn KeyProvider,
    verity: &dyn VerityModule,
    userns: Option<&UserNamespace>,
    overlay_counter: u32,
) -> Result<AssembledEntry> {
    let mode = entry.effective_cryptfs_mode();
    let needs_meta = mode.needs_meta_device();
    let label = ctx.label_for(entry_name);

    let provisioned: ProvisionedImage = provisioner::provision(ctx.host, &label, entry, needs_meta)?;

    if let Some(root_hash) = &entry.root_hash {
        let hash_img = provisioned
            .meta_path
            .clone()
            .unwrap_or_else(|| provisioned.data_path.with_extension("hash.img"));
        verity.create(&label, &provisioned.data_path, &hash_img, root_hash, entry.allow_unverified)?;
        let dev = PathBuf::from(format!("/dev/mapper/{label}"));
        wait_for_device_node(&dev)?;
        return finish_mount(ctx, entry, target, &dev, flags, ro, userns, overlay_counter, None, Some(label));
    }

    let loop_dev = loopdev::attach(&provisioned.data_path)?;
    let meta_loop: Option<LoopDevice> = match &provisioned.meta_path {
        Some(meta_path) => Some(loopdev::attach(meta_path)?),
        None => None,
    };

    if mode == CryptfsMode::NotImplemented {
        let dev = loop_dev.path().to_path_buf();
        let committed = loop_dev.commit();
        if let Some(m) = meta_loop {
            m.commit();
        }
        return finish_mount(ctx, entry, target, &committed, flags, ro, userns, overlay_counter, Some(dev), None);
    }

    let key = key_provider.container_get_key(mode)?;
    let meta_blkdev = meta_loop.as_ref().map(LoopDevice::path);
    let vol: CryptVolume = cryptfs::setup_volume(&label, loop_dev.path(), meta_blkdev, key, mode)?;
    let dev = vol.path().to_path_buf();
    wait_for_device_node(&dev)?;

    let loop_path = loop_dev.path().to_path_buf();
    loop_dev.commit();
    if let Some(m) = meta_loop {
        m.commit();
    }
    let final_path = vol.commit();
    finish_mount(ctx, entry, target, &final_path, flags, ro, userns, overlay_counter, Some(loop_path), Some(label))
}

#[allow(clippy::too_many_arguments)]
fn finish_mount(
    ctx: &EntryContext<'_>,
    entry: &MountEntry,
    target: &Path,
    dev: &Path,
    flags: MsFlags,
    ro: bool,
    userns: Option<&UserNamespace>,
    overlay_counter: u32,
    loop_device: Option<PathBuf>,
    dm_label: Option<String>,
) -> Result<AssembledEntry> {
    let mount_flags = if ro { flags | MsFlags::MS_RDONLY } else { flags };
    let mut overlay_scratch = None;

    if is_overlay_composed(entry.mount_type) {
        let scratch = overlay::scratch_dir(ctx.compartment, overlay_counter);
        ensure_dir(&scratch)?;
        let allow_format = matches!(entry.mount_type, MountType::OverlayRw);
        mount_image_backed(dev, &scratch, entry.effective_fs(), default_flags(ctx.setup_mode), entry.mount_data.as_deref(), allow_format)?;

        if entry.effective_fs() == "btrfs" {
            if let Some(data) = &entry.mount_data {
                if let Some(subvol) = data.strip_prefix("subvol=") {
                    overlay::ensure_btrfs_subvolume(dev, subvol)?;
                }
            }
        }

        let paths = OverlayPaths::new(scratch.clone(), target.to_path_buf());
        overlay::prepare_upper_work(&paths)?;
        overlay::mount_overlay(&paths, target, mount_flags)?;
        overlay_scratch = Some(scratch);
    } else {
        mount_image_backed(dev, target, entry.effective_fs(), mount_flags, entry.mount_data.as_deref(), matches!(entry.mount_type, MountType::Empty))?;
    }

    seal_private(target)?;
    maybe_idmap(entry, target, userns)?;

    info!(path = %entry.path.display(), dev = %dev.display(), "mounted entry");
    Ok(AssembledEntry {
        target: target.to_path_buf(),
        loop_device,
        dm_label,
        overlay_scratch,
    })
}

/// Tear one assembled entry back down: unmount the target (and overlay
/// scratch dir, if any), remove whatever dm device `dm_label` names
/// (probed by current target type, so this works whether it turns out to
/// be a crypt, integrity, or verity device), and release the loop device.
/// Mirrors [`assemble`] in reverse; errors accumulate into `report`
/// rather than aborting partway, per the teardown "log and continue"
/// policy (see [`crate::teardown`]).
pub fn disassemble(entry: &AssembledEntry, verity: &dyn VerityModule) -> crate::error::TeardownReport {
    let mut report = crate::error::TeardownReport::new();

    crate::teardown::unmount_one(&entry.target, &mut report);

    if let Some(scratch) = &entry.overlay_scratch {
        crate::teardown::unmount_one(scratch, &mut report);
        crate::teardown::remove_scratch_dir(scratch, &mut report);
    }

    if let Some(label) = &entry.dm_label {
        crate::teardown::teardown_dm_device(label, verity, &mut report);
    }

    if let Some(loop_path) = &entry.loop_device {
        if let Err(err) = loopdev::release_by_path(loop_path) {
            report.push(err);
        }
    }

    report
}

fn maybe_idmap(entry: &MountEntry, target: &Path, userns: Option<&UserNamespace>) -> Result<()> {
    if !entry.idmap {
        return Ok(());
    }
    let Some(userns) = userns else {
        warn!(path = %entry.path.display(), "idmap requested but no user namespace handle given, skipping");
        return Ok(());
    };
    idmap::apply_idmap(target, userns, !entry.mount_type.is_writable())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_entries_are_skipped_without_touching_anything() {
        let host = Host {
            images_root: PathBuf::from("/var/lib/compartfs/images"),
            shared_store_image: PathBuf::from("/var/lib/compartfs/shared.img"),
            compartment_root: PathBuf::from("/run/compartfs/root-1"),
        };
        let ctx = EntryContext {
            host: &host,
            compartment: Uuid::nil(),
            setup_mode: false,
            in_user_ns: false,
            has_net_ns: false,
        };
        let entry = MountEntry {
            path: "/flash".into(),
            mount_type: MountType::Flash,
            size: None,
            source: None,
            fs: None,
            mount_data: None,
            cryptfs_mode: None,
            root_hash: None,
            allow_unverified: false,
            idmap: false,
        };
        struct NoKeys;
        impl KeyProvider for NoKeys {
            fn container_get_key(&self, _mode: CryptfsMode) -> Result<crate::key::SecretBytes> {
                unreachable!("flash entries never request a key")
            }
        }
        let result = assemble(&ctx, &entry, "flash", &NoKeys, &crate::verity::NoopVerity, None, 0).unwrap();
        assert_eq!(result.target, host.mount_target(Path::new("/flash")));
        assert!(result.dm_label.is_none());
    }

    #[test]
    fn bind_entries_are_skipped_under_user_namespace() {
        let host = Host {
            images_root: PathBuf::from("/var/lib/compartfs/images"),
            shared_store_image: PathBuf::from("/var/lib/compartfs/shared.img"),
            compartment_root: PathBuf::from("/run/compartfs/root-1"),
        };
        let ctx = EntryContext {
            host: &host,
            compartment: Uuid::nil(),
            setup_mode: false,
            in_user_ns: true,
            has_net_ns: false,
        };
        let entry = MountEntry {
            path: "/etc/resolv.conf".into(),
            mount_type: MountType::BindFile,
            size: None,
            source: Some(PathBuf::from("/host/resolv.conf")),
            fs: None,
            mount_data: None,
            cryptfs_mode: None,
            root_hash: None,
            allow_unverified: false,
            idmap: false,
        };
        struct NoKeys;
        impl KeyProvider for NoKeys {
            fn container_get_key(&self, _mode: CryptfsMode) -> Result<crate::key::SecretBytes> {
                unreachable!()
            }
        }
        let result = assemble(&ctx, &entry, "resolv", &NoKeys, &crate::verity::NoopVerity, None, 0).unwrap();
        assert!(result.loop_device.is_none() && result.dm_label.is_none());
    }

    #[test]
    fn disassemble_of_a_bare_entry_is_clean() {
        let entry = AssembledEntry {
            target: PathBuf::from("/nonexistent/compartfs-disassemble-test"),
            loop_device: None,
            dm_label: None,
            overlay_scratch: None,
        };
        let report = disassemble(&entry, &crate::verity::NoopVerity);
        assert!(report.is_clean());
    }
}
