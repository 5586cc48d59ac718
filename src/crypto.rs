//! dm-crypt target: builds the table line for both topologies this crate
//! supports — stacked over dm-integrity (authenticated AEAD cipher) and
//! standalone (plain XTS, no tag).

use std::path::Path;

use zeroize::Zeroizing;

use crate::dm::control;
use crate::error::Result;
use crate::key::SecretBytes;

/// `capi:authenc(hmac(sha256),xts(aes))-random`, used when this dm-crypt
/// target sits on top of a dm-integrity device and needs to authenticate
/// each sector's tag as well as encrypt it.
const AUTHENC_CIPHER: &str = "capi:authenc(hmac(sha256),xts(aes))-random";

/// Plain `aes-xts-plain64`, used when there is no integrity layer
/// underneath and dm-crypt is the only target in the stack.
const PLAIN_CIPHER: &str = "aes-xts-plain64";

pub enum CryptTopology {
    /// Stacked on dm-integrity; `tag_size` must match the integrity
    /// target's authenticated tag size.
    StackedOnIntegrity { tag_size: u32 },
    Standalone,
}

/// `<crypto_type> <hex_key> 0 <real_blkdev> 0 <extra_params>`. Returned
/// wrapped in `Zeroizing` since the hex key is inline in the string; the
/// intermediate `key.to_hex()` buffer is scrubbed the same way before it
/// ever gets interpolated in.
fn build_target_params(
    backing_dev: &Path,
    key: &SecretBytes,
    topology: &CryptTopology,
) -> Zeroizing<String> {
    let hex_key = Zeroizing::new(key.to_hex());
    Zeroizing::new(match topology {
        CryptTopology::StackedOnIntegrity { tag_size } => format!(
            "{} {} 0 {} 0 1 integrity:{}:aead",
            AUTHENC_CIPHER,
            *hex_key,
            backing_dev.display(),
            tag_size
        ),
        CryptTopology::Standalone => format!(
            "{} {} 0 {} 0 1 allow_discards",
            PLAIN_CIPHER,
            *hex_key,
            backing_dev.display()
        ),
    })
}

/// Create and activate a dm-crypt device named `name` over `backing_dev`.
/// `DM_EXISTS_FLAG` is set on the table load, matching how the kernel
/// expects crypt tables to be loaded for an already-created device.
pub fn create(
    name: &str,
    backing_dev: &Path,
    sector_count: u64,
    key: &SecretBytes,
    topology: CryptTopology,
) -> Result<()> {
    control::create(name)?;
    let params = build_target_params(backing_dev, key, &topology);
    control::load_table(name, "crypt", sector_count, &params, true)?;
    control::suspend_or_resume(name)?;
    control::ensure_device_node(name)?;
    Ok(())
}

pub fn remove(name: &str) -> std::result::Result<(), nix::errno::Errno> {
    control::remove(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_uses_plain_cipher_and_allow_discards() {
        let key = SecretBytes::from_hex("00112233").unwrap();
        let params =
            build_target_params(Path::new("/dev/mapper/meta"), &key, &CryptTopology::Standalone);
        assert_eq!(params.as_str(), "aes-xts-plain64 00112233 0 /dev/mapper/meta 0 1 allow_discards");
    }

    #[test]
    fn stacked_uses_authenc_and_integrity_opt() {
        let key = SecretBytes::from_hex("00112233").unwrap();
        let params = build_target_params(
            Path::new("/dev/mapper/meta"),
            &key,
            &CryptTopology::StackedOnIntegrity { tag_size: 32 },
        );
        assert!(params.starts_with(AUTHENC_CIPHER));
        assert!(params.ends_with("integrity:32:aead"));
    }
}
