//! Symmetric teardown: unmount everything in reverse order (escalating to
//! a lazy detach when a plain unmount won't take), remove dm devices
//! keyed by their probed target type, and clean up scratch directories.
//! Every step runs regardless of earlier failures — teardown logs and
//! continues rather than aborting, so the kernel never accumulates
//! state that a half-finished teardown left behind.

use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use nix::mount::{umount2, MntFlags};
use tracing::debug;

use crate::crypto;
use crate::dm::control;
use crate::error::{Error, TeardownReport};
use crate::integrity;
use crate::sharedstore::is_mountpoint;
use crate::verity::VerityModule;

/// Remove the `/dev/mapper/<name>` node left behind by `mknod`.
/// Already-missing is not an error.
fn unlink_device_node(name: &str) -> std::io::Result<()> {
    match std::fs::remove_file(format!("/dev/mapper/{name}")) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Bounded rounds for the unmount retry loop: a plain `umount2` is tried
/// first, escalating to `MNT_DETACH` only once plain retries stop making
/// progress.
const UNMOUNT_ITERATION_LIMIT: u32 = 10;
const UNMOUNT_RETRY_SLEEP: Duration = Duration::from_millis(50);

/// Unmount `target`, retrying and eventually lazy-detaching until it's
/// no longer a mountpoint or the iteration limit is hit.
pub fn unmount_one(target: &Path, report: &mut TeardownReport) {
    if !is_mountpoint(target) {
        return;
    }
    for attempt in 0..UNMOUNT_ITERATION_LIMIT {
        let flags = if attempt < UNMOUNT_ITERATION_LIMIT / 2 {
            MntFlags::empty()
        } else {
            MntFlags::MNT_DETACH
        };
        match umount2(target, flags) {
            Ok(()) => {
                if !is_mountpoint(target) {
                    return;
                }
            }
            Err(errno) => {
                debug!(target = %target.display(), attempt, %errno, "unmount attempt failed");
            }
        }
        sleep(UNMOUNT_RETRY_SLEEP);
    }
    if is_mountpoint(target) {
        report.push(Error::TeardownPartial(format!(
            "{target:?} still mounted after {UNMOUNT_ITERATION_LIMIT} attempts"
        )));
    }
}

/// Unmount every target in `targets`, in the given order (callers pass
/// the reverse of their mount order).
pub fn unmount_all(targets: &[std::path::PathBuf]) -> TeardownReport {
    let mut report = TeardownReport::new();
    for target in targets {
        unmount_one(target, &mut report);
    }
    report
}

/// Probe `<label>-integrity` and remove it if it's reporting as an
/// integrity target. Stacked crypt-over-integrity volumes (`AUTHENC`,
/// `INTEGRITY_ENCRYPT`) and integrity-only volumes both leave their
/// integrity device under this fixed suffix regardless of what the
/// caller recorded as the volume's primary label, so every path through
/// `teardown_dm_device` checks it rather than only the stacked case.
fn remove_integrity_companion(label: &str, report: &mut TeardownReport) {
    let companion = format!("{label}-integrity");
    match control::query_target_type(&companion) {
        Ok(Some(t)) if t == "integrity" => {
            if let Err(errno) = integrity::remove(&companion) {
                if errno != nix::errno::Errno::ENXIO {
                    report.push(Error::IoctlFailed {
                        cmd: "DM_DEV_REMOVE(integrity)",
                        errno,
                    });
                }
            }
            if let Err(err) = unlink_device_node(&companion) {
                report.push(Error::Io(err));
            }
        }
        Ok(_) => {}
        Err(err) => report.push(err),
    }
}

/// Remove the dm device named `label`, dispatching to the destructor
/// that matches its currently reported target type, then checking for
/// an `<label>-integrity` companion device left by a stacked crypt or
/// integrity-only volume (see [`remove_integrity_companion`]). Absence
/// of the primary device (`query_target_type` returning `None`) is a
/// no-op, not an error — matches every destructor's own `ENXIO`
/// tolerance — but the companion is still probed, since `INTEGRITY_ONLY`
/// volumes have no device at the bare label at all.
pub fn teardown_dm_device(label: &str, verity: &dyn VerityModule, report: &mut TeardownReport) {
    let target_type = match control::query_target_type(label) {
        Ok(t) => t,
        Err(err) => {
            report.push(err);
            return;
        }
    };

    match target_type.as_deref() {
        None => {
            remove_integrity_companion(label, report);
        }
        Some("crypt") => {
            if let Err(errno) = crypto::remove(label) {
                if errno != nix::errno::Errno::ENXIO {
                    report.push(Error::IoctlFailed {
                        cmd: "DM_DEV_REMOVE(crypt)",
                        errno,
                    });
                }
            }
            if let Err(err) = unlink_device_node(label) {
                report.push(Error::Io(err));
            }
            remove_integrity_companion(label, report);
        }
        Some("integrity") => {
            if let Err(errno) = integrity::remove(label) {
                if errno != nix::errno::Errno::ENXIO {
                    report.push(Error::IoctlFailed {
                        cmd: "DM_DEV_REMOVE(integrity)",
                        errno,
                    });
                }
            }
            if let Err(err) = unlink_device_node(label) {
                report.push(Error::Io(err));
            }
        }
        Some("verity") => {
            if let Err(err) = verity.delete(label) {
                report.push(err);
            }
            if let Err(err) = unlink_device_node(label) {
                report.push(Error::Io(err));
            }
        }
        Some(other) => {
            report.push(Error::TeardownPartial(format!(
                "{label} has unrecognized target type {other:?}"
            )));
        }
    }
}

/// Remove a list of dm devices (already in the caller's intended order,
/// typically the reverse of creation order).
pub fn teardown_dm_devices(labels: &[String], verity: &dyn VerityModule) -> TeardownReport {
    let mut report = TeardownReport::new();
    for label in labels {
        teardown_dm_device(label, verity, &mut report);
    }
    report
}

/// Walk and remove overlay scratch directories, tolerating
/// already-missing entries.
pub fn remove_scratch_dir(dir: &Path, report: &mut TeardownReport) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => report.push(Error::Io(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verity::NoopVerity;

    #[test]
    fn unmount_one_is_a_noop_when_not_mounted() {
        let mut report = TeardownReport::new();
        unmount_one(Path::new("/nonexistent/compartfs-teardown-test"), &mut report);
        assert!(report.is_clean());
    }

    #[test]
    fn remove_scratch_dir_tolerates_missing_dir() {
        let mut report = TeardownReport::new();
        remove_scratch_dir(Path::new("/nonexistent/compartfs-scratch"), &mut report);
        assert!(report.is_clean());
    }

    #[test]
    fn teardown_dm_devices_with_empty_list_is_clean() {
        let report = teardown_dm_devices(&[], &NoopVerity);
        assert!(report.is_clean());
    }
}
