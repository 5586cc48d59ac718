//! Raw `/dev/mapper/control` wire layout.
//!
//! This mirrors the public Linux UAPI `struct dm_ioctl` / `struct
//! dm_target_spec` (`linux/dm-ioctl.h`) by hand: the crate intentionally
//! stays below `libdevmapper`/`libcryptsetup` abstraction levels.

use crate::error::{Error, Result};

pub const DM_CONTROL_PATH: &str = "/dev/mapper/control";

pub const DM_NAME_LEN: usize = 128;
pub const DM_UUID_LEN: usize = 129;

/// Total ioctl buffer size used for every command here: large enough to
/// hold a header, one target spec, and a generous parameter string.
pub const DM_BUFFER_SIZE: usize = 4096;

pub const DM_VERSION_MAJOR: u32 = 4;
pub const DM_VERSION_MINOR: u32 = 0;
pub const DM_VERSION_PATCH: u32 = 0;

/// Device is present (used on `DM_DEV_STATUS`/`DM_TABLE_LOAD` replies).
pub const DM_EXISTS_FLAG: u32 = 0x0000_0004;

pub const DM_IOCTL_MAGIC: u8 = 0xfd;

// Command numbers from linux/dm-ioctl.h, fixed UAPI constants.
pub const DM_DEV_CREATE_CMD: u8 = 3;
pub const DM_DEV_REMOVE_CMD: u8 = 4;
pub const DM_DEV_SUSPEND_CMD: u8 = 6;
pub const DM_DEV_STATUS_CMD: u8 = 7;
pub const DM_TABLE_LOAD_CMD: u8 = 9;
pub const DM_TABLE_STATUS_CMD: u8 = 12;

/// `struct dm_ioctl` header. Repr(C) layout must match the kernel exactly;
/// field order, not padding rules, is what we rely on (there is no
/// alignment gap in the real struct on any supported arch).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DmIoctl {
    pub version: [u32; 3],
    pub data_size: u32,
    pub data_start: u32,
    pub target_count: u32,
    pub open_count: i32,
    pub flags: u32,
    pub event_nr: u32,
    pub padding: u32,
    pub dev: u64,
    pub name: [u8; DM_NAME_LEN],
    pub uuid: [u8; DM_UUID_LEN],
    pub data: [u8; 7],
}

impl Default for DmIoctl {
    fn default() -> Self {
        DmIoctl {
            version: [DM_VERSION_MAJOR, DM_VERSION_MINOR, DM_VERSION_PATCH],
            data_size: 0,
            data_start: 0,
            target_count: 0,
            open_count: 0,
            flags: 0,
            event_nr: 0,
            padding: 0,
            dev: 0,
            name: [0; DM_NAME_LEN],
            uuid: [0; DM_UUID_LEN],
            data: [0; 7],
        }
    }
}

/// `struct dm_target_spec` header, immediately followed in the buffer by
/// `target_type`'s parameter string.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DmTargetSpec {
    pub sector_start: u64,
    pub length: u64,
    pub status: i32,
    pub next: u32,
    pub target_type: [u8; 16],
}

impl Default for DmTargetSpec {
    fn default() -> Self {
        DmTargetSpec {
            sector_start: 0,
            length: 0,
            status: 0,
            next: 0,
            target_type: [0; 16],
        }
    }
}

fn write_name(buf: &mut [u8], name: &str) -> Result<()> {
    if name.len() >= buf.len() {
        return Err(Error::TeardownPartial(format!(
            "device name {name:?} too long for dm_ioctl.name"
        )));
    }
    buf[..name.len()].copy_from_slice(name.as_bytes());
    Ok(())
}

fn set_target_type(buf: &mut [u8; 16], target_type: &str) {
    let len = target_type.len().min(buf.len() - 1);
    buf[..len].copy_from_slice(&target_type.as_bytes()[..len]);
}

/// Pad `len` up to the next 8-byte boundary.
fn pad8(len: usize) -> usize {
    (len + 7) & !7
}

fn header_size() -> usize {
    std::mem::size_of::<DmIoctl>()
}

fn target_spec_size() -> usize {
    std::mem::size_of::<DmTargetSpec>()
}

/// Build a buffer containing just the `dm_ioctl` header, for commands
/// with no table (`DM_DEV_CREATE`, `DM_DEV_REMOVE`, `DM_DEV_SUSPEND`,
/// `DM_DEV_STATUS`).
pub fn build_header_only(name: &str, flags: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; DM_BUFFER_SIZE];
    let hdr = DmIoctl {
        data_size: DM_BUFFER_SIZE as u32,
        data_start: header_size() as u32,
        flags,
        ..Default::default()
    };
    // SAFETY: `buf` is DM_BUFFER_SIZE >= size_of::<DmIoctl>() and 8-byte
    // aligned because Vec<u8> allocations are at least pointer-aligned.
    unsafe {
        std::ptr::write(buf.as_mut_ptr().cast::<DmIoctl>(), hdr);
    }
    write_name(&mut buf[header_offset_of_name()..], name)?;
    Ok(buf)
}

/// Byte offset of `DmIoctl::name`. Computed by hand (not `offset_of!`,
/// to keep this buildable on the crate's stated MSRV): every field up to
/// `dev` is naturally aligned with no inserted padding on repr(C).
fn header_offset_of_name() -> usize {
    (3 * 4) + 4 + 4 + 4 + 4 + 4 + 4 + 4 + 8
}

/// Build a buffer for `DM_TABLE_LOAD`: header + one `dm_target_spec` +
/// the target's null-terminated parameter string, padded to 8 bytes.
/// `target_spec.next` is set to the offset just past the padded params.
pub fn build_table_load(
    name: &str,
    target_type: &str,
    sector_count: u64,
    params: &str,
    flags: u32,
) -> Result<Vec<u8>> {
    let hdr_len = header_size();
    let spec_len = target_spec_size();
    let params_with_nul_len = params.len() + 1;
    let padded_params_len = pad8(params_with_nul_len);
    let total = hdr_len + spec_len + padded_params_len;
    if total > DM_BUFFER_SIZE {
        return Err(Error::TeardownPartial(format!(
            "dm table params too large: {total} > {DM_BUFFER_SIZE}"
        )));
    }

    let mut buf = vec![0u8; DM_BUFFER_SIZE];

    let hdr = DmIoctl {
        data_size: DM_BUFFER_SIZE as u32,
        data_start: hdr_len as u32,
        target_count: 1,
        flags,
        ..Default::default()
    };
    unsafe {
        std::ptr::write(buf.as_mut_ptr().cast::<DmIoctl>(), hdr);
    }
    write_name(&mut buf[header_offset_of_name()..], name)?;

    let mut spec = DmTargetSpec {
        sector_start: 0,
        length: sector_count,
        next: (spec_len + padded_params_len) as u32,
        ..Default::default()
    };
    set_target_type(&mut spec.target_type, target_type);
    unsafe {
        std::ptr::write(buf[hdr_len..].as_mut_ptr().cast::<DmTargetSpec>(), spec);
    }

    let params_offset = hdr_len + spec_len;
    buf[params_offset..params_offset + params.len()].copy_from_slice(params.as_bytes());
    // byte at params.len() is already zero (nul terminator); padding bytes
    // past that are zero too, left over from the zeroed Vec.

    Ok(buf)
}

/// Read back the `dm_ioctl` header at the front of an ioctl reply buffer.
pub fn read_header(buf: &[u8]) -> DmIoctl {
    // SAFETY: buf is at least DM_BUFFER_SIZE and DmIoctl has no invalid
    // bit patterns for an all-zero/any-byte-pattern repr(C) struct of
    // integers and byte arrays.
    unsafe { std::ptr::read(buf.as_ptr().cast::<DmIoctl>()) }
}

/// Read the `dm_target_spec` + `target_type` that follows the header in a
/// `DM_TABLE_STATUS` reply, if the kernel returned one.
pub fn read_first_target_type(buf: &[u8]) -> Option<String> {
    let hdr = read_header(buf);
    if hdr.target_count == 0 {
        return None;
    }
    let spec_offset = hdr.data_start as usize;
    if spec_offset + target_spec_size() > buf.len() {
        return None;
    }
    let spec: DmTargetSpec =
        unsafe { std::ptr::read(buf[spec_offset..].as_ptr().cast::<DmTargetSpec>()) };
    let nul = spec
        .target_type
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(spec.target_type.len());
    Some(String::from_utf8_lossy(&spec.target_type[..nul]).into_owned())
}

pub fn minor_major(dev: u64) -> (u32, u32) {
    // Linux's `new_encode_dev`/legacy encoding: see <sys/sysmacros.h>.
    let major = ((dev >> 8) & 0xfff) as u32 | ((dev >> 32) & !0xfff) as u32;
    let minor = (dev & 0xff) as u32 | ((dev >> 12) & !0xff) as u32;
    (major, minor)
}
