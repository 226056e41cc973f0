//! header.rs — flattened device tree header
//!
//!   0x00 magic 0xd00dfeed      0x14 version
//!   0x04 totalsize             0x18 last_comp_version
//!   0x08 off_dt_struct         0x1C boot_cpuid_phys
//!   0x0C off_dt_strings        0x20 size_dt_strings
//!   0x10 off_mem_rsvmap        0x24 size_dt_struct
//!
//! All fields big-endian. Read by copy, never by reference into the blob.

use core::ops::Range;

use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::arith::span;
use crate::error::{BootError, BootResult};

pub const FDT_MAGIC: u32 = 0xd00d_feed;
pub const FDT_VERSION: u32 = 17;
pub const FDT_LAST_COMP_VERSION: u32 = 16;
/// Oldest layout we understand (v16 lacks `size_dt_struct`).
pub const FDT_FIRST_SUPPORTED_VERSION: u32 = 16;

#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes, Unaligned)]
pub struct RawFdtHeader {
    pub magic: U32<BigEndian>,
    pub totalsize: U32<BigEndian>,
    pub off_dt_struct: U32<BigEndian>,
    pub off_dt_strings: U32<BigEndian>,
    pub off_mem_rsvmap: U32<BigEndian>,
    pub version: U32<BigEndian>,
    pub last_comp_version: U32<BigEndian>,
    pub boot_cpuid_phys: U32<BigEndian>,
    pub size_dt_strings: U32<BigEndian>,
    pub size_dt_struct: U32<BigEndian>,
}

pub const FDT_HEADER_SIZE: usize = core::mem::size_of::<RawFdtHeader>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdtHeader {
    pub totalsize: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl FdtHeader {
    /// Copy the header at the start of `bytes` and check it against the
    /// blob it claims to describe.
    pub fn read(bytes: &[u8]) -> BootResult<Self> {
        let (lv, _) = LayoutVerified::<_, RawFdtHeader>::new_unaligned_from_prefix(bytes)
            .ok_or(BootError::InvalidFormat("buffer too small for fdt header"))?;
        let raw: RawFdtHeader = *lv;

        if raw.magic.get() != FDT_MAGIC {
            return Err(BootError::InvalidFormat("fdt magic mismatch"));
        }
        let hdr = Self {
            totalsize: raw.totalsize.get(),
            off_dt_struct: raw.off_dt_struct.get(),
            off_dt_strings: raw.off_dt_strings.get(),
            off_mem_rsvmap: raw.off_mem_rsvmap.get(),
            version: raw.version.get(),
            last_comp_version: raw.last_comp_version.get(),
            boot_cpuid_phys: raw.boot_cpuid_phys.get(),
            size_dt_strings: raw.size_dt_strings.get(),
            size_dt_struct: raw.size_dt_struct.get(),
        };
        hdr.check()?;
        Ok(hdr)
    }

    /// `read` without the error, for forward scans that stop at the first
    /// blob that does not parse.
    pub fn probe(bytes: &[u8]) -> Option<Self> {
        Self::read(bytes).ok()
    }

    fn check(&self) -> BootResult<()> {
        if self.version < FDT_FIRST_SUPPORTED_VERSION || self.last_comp_version > FDT_VERSION {
            return Err(BootError::InvalidFormat("unsupported fdt version"));
        }
        if (self.totalsize as usize) < FDT_HEADER_SIZE {
            return Err(BootError::InvalidFormat("fdt totalsize smaller than header"));
        }
        self.struct_block()?;
        self.strings_block()?;
        if (self.off_mem_rsvmap as usize) < FDT_HEADER_SIZE || self.off_mem_rsvmap >= self.totalsize {
            return Err(BootError::InvalidFormat("fdt reserve map out of bounds"));
        }
        Ok(())
    }

    pub fn struct_block(&self) -> BootResult<Range<usize>> {
        let total = self.totalsize as usize;
        let off = self.off_dt_struct as usize;
        let len = if self.version >= FDT_VERSION {
            self.size_dt_struct as usize
        } else {
            total.checked_sub(off).ok_or(BootError::InvalidFormat("fdt struct block out of bounds"))?
        };
        span(off, len, total, "fdt struct block")
    }

    pub fn strings_block(&self) -> BootResult<Range<usize>> {
        span(
            self.off_dt_strings as usize,
            self.size_dt_strings as usize,
            self.totalsize as usize,
            "fdt strings block",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(total: u32) -> [u8; FDT_HEADER_SIZE] {
        let words = [FDT_MAGIC, total, 56, total - 8, 40, 17, 16, 0, 8, total - 64];
        let mut out = [0u8; FDT_HEADER_SIZE];
        for (i, w) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_be_bytes());
        }
        out
    }

    #[test]
    fn reads_valid_header() {
        let h = FdtHeader::read(&raw(128)).unwrap();
        assert_eq!(h.totalsize, 128);
        assert_eq!(h.struct_block().unwrap(), 56..120);
        assert_eq!(h.strings_block().unwrap(), 120..128);
    }

    #[test]
    fn rejects_bad_magic_and_short() {
        let mut b = raw(128);
        b[0] = 0;
        assert!(FdtHeader::probe(&b).is_none());
        assert!(FdtHeader::probe(&b[..10]).is_none());
    }

    #[test]
    fn rejects_blocks_past_total() {
        let mut b = raw(128);
        // size_dt_struct = 0xffff_ffff
        b[36..40].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(FdtHeader::read(&b), Err(BootError::MalformedSizes(_)) | Err(BootError::IntegerOverflow(_))));
    }

    #[test]
    fn rejects_future_version() {
        let mut b = raw(128);
        b[24..28].copy_from_slice(&18u32.to_be_bytes());
        assert!(matches!(FdtHeader::read(&b), Err(BootError::InvalidFormat(_))));
    }
}
