//! Encrypted and integrity-protected block volume layer for compartment
//! root filesystems: device-mapper (crypt/integrity) orchestration, loop
//! device management, image provisioning, mount assembly, idmapped
//! mounts, overlay composition, the shared-files store, root pivot, and
//! teardown.
//!
//! Callers typically: describe a compartment's filesystem as a list of
//! [`mountentry::MountEntry`] values, provision each entry's backing
//! image with [`provisioner::provision`], run [`cryptfs::setup_volume`]
//! for entries that need dm-crypt/dm-integrity, attach loop devices with
//! [`loopdev::attach`], mount everything through [`mount`], pivot into
//! the composed tree with [`rootswitch`], and tear it all back down with
//! [`teardown`] on shutdown.

pub mod blockdev;
pub mod compartment;
pub mod cryptfs;
pub mod crypto;
pub mod dm;
pub mod error;
pub mod host;
pub mod idmap;
pub mod integrity;
pub mod key;
pub mod loopdev;
pub mod mount;
pub mod mountentry;
pub mod overlay;
pub mod provisioner;
pub mod rootswitch;
pub mod sharedstore;
pub mod teardown;
pub mod verifyjob;
pub mod verity;

pub use error::{Error, Result, TeardownReport};
pub use host::{AuditSink, Host, KeyProvider, NoopAudit};
pub use compartment::{assemble, disassemble, AssembledEntry, EntryContext};
pub use mountentry::{parse_entries, CryptfsMode, MountEntry, MountType, VolumeState};
pub use verity::{NoopVerity, VerityModule};

/// Test-only helpers shared across this crate's `#[cfg(test)]` modules.
#[cfg(test)]
pub(crate) mod test_support {
    /// Route `tracing` events to stdout during `cargo test`, same as
    /// every binary in this stack does for real runs
    /// (`vcontrol::mod::tracing_subscriber::fmt::init`) but idempotent
    /// and non-panicking when another test already installed one.
    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }
}
