//! dm-verity is a collaborator's responsibility, not this crate's: the
//! compartment lifecycle framework already owns root-hash derivation and
//! attestation policy. This module is just the narrow contract it's
//! consumed through, plus a no-op implementation for tests.

use std::path::Path;

use crate::error::Error;

pub trait VerityModule {
    fn create(
        &self,
        label: &str,
        data_img: &Path,
        hash_img: &Path,
        root_hash_hex: &str,
        allow_unverified: bool,
    ) -> Result<(), Error>;

    fn delete(&self, label: &str) -> Result<(), Error>;
}

/// Used by tests and by callers that don't need read-only verified
/// volumes (e.g. `allow_unverified` everywhere).
#[derive(Debug, Default)]
pub struct NoopVerity;

impl VerityModule for NoopVerity {
    fn create(
        &self,
        _label: &str,
        _data_img: &Path,
        _hash_img: &Path,
        _root_hash_hex: &str,
        _allow_unverified: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn delete(&self, _label: &str) -> Result<(), Error> {
        Ok(())
    }
}
