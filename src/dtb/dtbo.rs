//! dtbo.rs — Android `dt_table` (DTBO partition) parsing
//!
//!   +---------------------------+ 0
//!   | dt_table_header (32, BE)  |
//!   +---------------------------+ dt_entries_offset
//!   | dt_table_entry * count    | dt_entry_size each
//!   +---------------------------+
//!   | overlay blobs             | dt_offset / dt_size per entry
//!   +---------------------------+ total_size

use core::ops::Range;

use alloc::vec::Vec;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::arith::{add_usize, mul_usize, span};
use crate::error::{BootError, BootResult};
use crate::logger::log_debug;

pub const DT_TABLE_MAGIC: u32 = 0xd7b7_ab1e;

#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes, Unaligned)]
pub struct RawDtTableHeader {
    pub magic: U32<BigEndian>,
    pub total_size: U32<BigEndian>,
    pub header_size: U32<BigEndian>,
    pub dt_entry_size: U32<BigEndian>,
    pub dt_entry_count: U32<BigEndian>,
    pub dt_entries_offset: U32<BigEndian>,
    pub page_size: U32<BigEndian>,
    pub version: U32<BigEndian>,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes, Unaligned)]
pub struct RawDtTableEntry {
    pub dt_size: U32<BigEndian>,
    pub dt_offset: U32<BigEndian>,
    pub id: U32<BigEndian>,
    pub rev: U32<BigEndian>,
    pub custom: [U32<BigEndian>; 4],
}

pub const DT_TABLE_HEADER_SIZE: usize = core::mem::size_of::<RawDtTableHeader>();
pub const DT_TABLE_ENTRY_SIZE: usize = core::mem::size_of::<RawDtTableEntry>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DtboEntry {
    pub dt_size: u32,
    pub dt_offset: u32,
    pub id: u32,
    pub rev: u32,
    pub custom: [u32; 4],
}

impl DtboEntry {
    pub fn range(&self) -> Range<usize> {
        // checked in DtboTable::parse
        let start = self.dt_offset as usize;
        start..start + self.dt_size as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DtboTable {
    pub total_size: u32,
    pub page_size: u32,
    pub version: u32,
    pub entries: Vec<DtboEntry>,
}

impl DtboTable {
    pub fn parse(buf: &[u8]) -> BootResult<Self> {
        let (lv, _) = LayoutVerified::<_, RawDtTableHeader>::new_unaligned_from_prefix(buf)
            .ok_or(BootError::InvalidFormat("buffer too small for dt_table header"))?;
        let hdr: RawDtTableHeader = *lv;

        if hdr.magic.get() != DT_TABLE_MAGIC {
            return Err(BootError::InvalidFormat("dt_table magic mismatch"));
        }
        let total = hdr.total_size.get() as usize;
        if total > buf.len() || total < DT_TABLE_HEADER_SIZE {
            return Err(BootError::MalformedSizes("dt_table total_size"));
        }
        if (hdr.header_size.get() as usize) < DT_TABLE_HEADER_SIZE {
            return Err(BootError::MalformedSizes("dt_table header_size"));
        }
        let entry_size = hdr.dt_entry_size.get() as usize;
        if entry_size < DT_TABLE_ENTRY_SIZE {
            return Err(BootError::MalformedSizes("dt_table entry size"));
        }

        let count = hdr.dt_entry_count.get() as usize;
        let first = hdr.dt_entries_offset.get() as usize;
        let table_len = mul_usize(count, entry_size, "dt_table entries")?;
        span(first, table_len, total, "dt_table entries")?;

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(count)
            .map_err(|_| BootError::OutOfMemory("dt_table entries"))?;
        for i in 0..count {
            // i * entry_size <= table_len, already checked
            let at = add_usize(first, i * entry_size, "dt_table entry")?;
            let (lv, _) = LayoutVerified::<_, RawDtTableEntry>::new_unaligned_from_prefix(&buf[at..total])
                .ok_or(BootError::MalformedSizes("dt_table entry truncated"))?;
            let raw: RawDtTableEntry = *lv;
            let e = DtboEntry {
                dt_size: raw.dt_size.get(),
                dt_offset: raw.dt_offset.get(),
                id: raw.id.get(),
                rev: raw.rev.get(),
                custom: raw.custom.map(|c| c.get()),
            };
            span(e.dt_offset as usize, e.dt_size as usize, total, "dt_table blob")?;
            entries.push(e);
        }

        log_debug(
            "dtbo",
            &alloc::format!("dt_table v{} with {} entries, {:#x} bytes", hdr.version.get(), count, total),
        );
        Ok(Self {
            total_size: hdr.total_size.get(),
            page_size: hdr.page_size.get(),
            version: hdr.version.get(),
            entries,
        })
    }

    /// Overlay blob of entry `i`.
    pub fn blob<'a>(&self, buf: &'a [u8], i: usize) -> BootResult<&'a [u8]> {
        let e = self
            .entries
            .get(i)
            .ok_or(BootError::InvalidFormat("dt_table index out of range"))?;
        buf.get(e.range())
            .ok_or(BootError::MalformedSizes("dt_table blob beyond buffer"))
    }
}
