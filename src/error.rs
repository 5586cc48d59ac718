use std::path::PathBuf;

use nix::errno::Errno;

/// Library-wide error type. Every fallible public entry point returns
/// `Result<_, Error>`; internals may use `anyhow` only in tests/binaries.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("dm ioctl {cmd} failed: {errno}")]
    IoctlFailed { cmd: &'static str, errno: Errno },

    #[error("dm ioctl {cmd} did not succeed after retrying")]
    RetryExhausted { cmd: &'static str },

    #[error("block device {0:?} is unreadable")]
    BlockDeviceUnreadable(PathBuf),

    #[error("key length mismatch: expected {expected} hex chars, got {actual}")]
    KeyLengthMismatch { expected: usize, actual: usize },

    #[error(
        "meta device format mismatch: integrity superblock reports {actual} provided sectors, expected {expected}"
    )]
    MetaDeviceFormatMismatch { expected: u64, actual: u64 },

    #[error("mount {src} -> {dst} (fs={fs:?}) failed: {errno}")]
    MountFailed {
        src: String,
        dst: String,
        fs: Option<String>,
        errno: Errno,
    },

    #[error("failed to format {dev} as {fs}")]
    FormatFailed { dev: String, fs: String },

    #[error("overlay assembly failed at step: {0}")]
    OverlayAssemblyFailed(&'static str),

    #[error("teardown left state behind: {0}")]
    TeardownPartial(String),

    #[error("fs_size must be nonzero")]
    ZeroSizedVolume,

    #[error("meta device required for this cryptfs mode but none was given")]
    MissingMetaDevice,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid mount-entry configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("unexpected nix error: {0}")]
    Nix(#[from] Errno),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Accumulates non-fatal errors during teardown, which always runs every
/// step rather than aborting on the first failure.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub errors: Vec<Error>,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        tracing::warn!("teardown step failed (continuing): {err}");
        self.errors.push(err);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
