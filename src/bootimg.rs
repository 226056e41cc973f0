//! bootimg.rs — Android boot image header validation + payload layout
//!
//! Layout (little-endian, v0 with a device-tree slot):
//!   +----------------------+ 0
//!   | magic = "ANDROID!"   | 8
//!   | kernel_size/addr     | 4 + 4
//!   | ramdisk_size/addr    | 4 + 4
//!   | second_size/addr     | 4 + 4
//!   | tags_addr            | 4
//!   | page_size            | 4
//!   | dt_size              | 4
//!   | unused               | 4
//!   | name                 | 16
//!   | cmdline              | 512 (NUL-terminated before use)
//!   | id                   | 32
//!   +----------------------+ padded to page_size
//!   | kernel               | round_up(kernel_size, page)
//!   | ramdisk              | round_up(ramdisk_size, page)
//!   | second               | round_up(second_size, page)
//!   | device tree          | round_up(dt_size, page)
//!   +----------------------+
//!
//! The header is copied out of the blob into a local struct before any field
//! is looked at, and every derived offset goes through `arith`.

use core::ops::Range;

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::arith::{add_u32, round_up, sum_u32};
use crate::error::{BootError, BootResult};
use crate::logger::{log_debug, log_warn};

pub const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;

/// On-wire header. Only ever read through `LayoutVerified` + copy.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes, Unaligned)]
pub struct BootImgHdr {
    pub magic: [u8; 8],
    pub kernel_size: U32<LittleEndian>,
    pub kernel_addr: U32<LittleEndian>,
    pub ramdisk_size: U32<LittleEndian>,
    pub ramdisk_addr: U32<LittleEndian>,
    pub second_size: U32<LittleEndian>,
    pub second_addr: U32<LittleEndian>,
    pub tags_addr: U32<LittleEndian>,
    pub page_size: U32<LittleEndian>,
    pub dt_size: U32<LittleEndian>,
    pub unused: U32<LittleEndian>,
    pub name: [u8; BOOT_NAME_SIZE],
    pub cmdline: [u8; BOOT_ARGS_SIZE],
    pub id: [U32<LittleEndian>; 8],
}

pub const BOOT_HEADER_SIZE: usize = core::mem::size_of::<BootImgHdr>();

/// Validated, host-endian view of the header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootImageHeader {
    pub kernel_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_size: u32,
    pub ramdisk_addr: u32,
    pub second_size: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub dt_size: u32,
    pub name: [u8; BOOT_NAME_SIZE],
    cmdline: [u8; BOOT_ARGS_SIZE],
}

impl BootImageHeader {
    /// Raw cmdline up to (not including) its terminator.
    pub fn cmdline(&self) -> &[u8] {
        let end = self.cmdline.iter().position(|&b| b == 0).unwrap_or(BOOT_ARGS_SIZE - 1);
        &self.cmdline[..end]
    }

    pub fn name(&self) -> &[u8] {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(BOOT_NAME_SIZE);
        &self.name[..end]
    }
}

/// One payload inside the image: raw `size` bytes at `offset`, occupying
/// `actual` (page-rounded) bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Region {
    pub offset: u32,
    pub size: u32,
    pub actual: u32,
}

impl Region {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn range(&self) -> Range<usize> {
        let start = self.offset as usize;
        // offset + size <= image_size was established with checked adds
        start..start + self.size as usize
    }
}

/// Page-aligned placement of every payload. Built once by
/// [`BootImageValidator::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootImageLayout {
    pub page_size: u32,
    pub kernel: Region,
    pub ramdisk: Region,
    pub second: Region,
    pub device_tree: Region,
    /// Header page plus every rounded payload.
    pub image_size: u32,
}

impl BootImageLayout {
    /// Reject buffers that end before the last payload does.
    pub fn check_fits(&self, buffer_len: usize) -> BootResult<()> {
        if (self.image_size as usize) > buffer_len {
            log_warn(
                "bootimg",
                &alloc::format!("image truncated: need {} bytes, have {}", self.image_size, buffer_len),
            );
            return Err(BootError::MalformedSizes("image shorter than header sizes"));
        }
        Ok(())
    }

    fn slice<'a>(&self, image: &'a [u8], r: &Region) -> BootResult<&'a [u8]> {
        image
            .get(r.range())
            .ok_or(BootError::MalformedSizes("payload beyond image end"))
    }

    pub fn kernel<'a>(&self, image: &'a [u8]) -> BootResult<&'a [u8]> {
        self.slice(image, &self.kernel)
    }

    pub fn ramdisk<'a>(&self, image: &'a [u8]) -> BootResult<&'a [u8]> {
        self.slice(image, &self.ramdisk)
    }

    pub fn second<'a>(&self, image: &'a [u8]) -> BootResult<&'a [u8]> {
        self.slice(image, &self.second)
    }

    pub fn device_tree<'a>(&self, image: &'a [u8]) -> BootResult<&'a [u8]> {
        self.slice(image, &self.device_tree)
    }
}

/// Header checks that depend on the platform posture.
#[derive(Clone, Copy, Debug)]
pub struct BootImageValidator {
    pub max_page_size: u32,
    pub expected_page_size: Option<u32>,
}

impl BootImageValidator {
    pub fn new(max_page_size: u32, expected_page_size: Option<u32>) -> Self {
        Self { max_page_size, expected_page_size }
    }

    pub fn validate(&self, header_bytes: &[u8]) -> BootResult<(BootImageHeader, BootImageLayout)> {
        let (lv, _) = LayoutVerified::<_, BootImgHdr>::new_unaligned_from_prefix(header_bytes)
            .ok_or(BootError::InvalidFormat("buffer too small for boot header"))?;
        let raw: BootImgHdr = *lv;

        if &raw.magic != BOOT_MAGIC {
            log_warn("bootimg", "boot magic mismatch");
            return Err(BootError::InvalidFormat("boot magic mismatch"));
        }

        let mut cmdline = raw.cmdline;
        cmdline[BOOT_ARGS_SIZE - 1] = 0;

        let hdr = BootImageHeader {
            kernel_size: raw.kernel_size.get(),
            kernel_addr: raw.kernel_addr.get(),
            ramdisk_size: raw.ramdisk_size.get(),
            ramdisk_addr: raw.ramdisk_addr.get(),
            second_size: raw.second_size.get(),
            second_addr: raw.second_addr.get(),
            tags_addr: raw.tags_addr.get(),
            page_size: raw.page_size.get(),
            dt_size: raw.dt_size.get(),
            name: raw.name,
            cmdline,
        };

        self.check_sizes(&hdr)?;
        let layout = compute_layout(&hdr)?;

        log_debug(
            "bootimg",
            &alloc::format!(
                "page {} kernel {:#x}@{:#x} ramdisk {:#x}@{:#x} dt {:#x}@{:#x} total {:#x}",
                layout.page_size,
                layout.kernel.size,
                layout.kernel.offset,
                layout.ramdisk.size,
                layout.ramdisk.offset,
                layout.device_tree.size,
                layout.device_tree.offset,
                layout.image_size
            ),
        );
        Ok((hdr, layout))
    }

    fn check_sizes(&self, hdr: &BootImageHeader) -> BootResult<()> {
        if hdr.kernel_size == 0 || hdr.page_size == 0 {
            return Err(BootError::MalformedSizes("zero kernel or page size"));
        }
        if hdr.ramdisk_size == 0 {
            return Err(BootError::MalformedSizes("zero ramdisk size"));
        }
        if hdr.page_size > self.max_page_size {
            return Err(BootError::MalformedSizes("page size above platform maximum"));
        }
        if let Some(expected) = self.expected_page_size {
            if hdr.page_size != expected {
                return Err(BootError::MalformedSizes("page size differs from expected"));
            }
        }
        Ok(())
    }
}

fn compute_layout(hdr: &BootImageHeader) -> BootResult<BootImageLayout> {
    let page = hdr.page_size;
    let kernel_actual = round_up(hdr.kernel_size, page, "kernel size")?;
    let ramdisk_actual = round_up(hdr.ramdisk_size, page, "ramdisk size")?;
    let second_actual = round_up(hdr.second_size, page, "second size")?;
    let dt_actual = round_up(hdr.dt_size, page, "device tree size")?;

    let kernel_offset = page;
    let ramdisk_offset = add_u32(kernel_offset, kernel_actual, "ramdisk offset")?;
    let second_offset = add_u32(ramdisk_offset, ramdisk_actual, "second offset")?;
    let dt_offset = add_u32(second_offset, second_actual, "device tree offset")?;
    let image_size = sum_u32(
        &[page, kernel_actual, ramdisk_actual, second_actual, dt_actual],
        "image size",
    )?;

    Ok(BootImageLayout {
        page_size: page,
        kernel: Region { offset: kernel_offset, size: hdr.kernel_size, actual: kernel_actual },
        ramdisk: Region { offset: ramdisk_offset, size: hdr.ramdisk_size, actual: ramdisk_actual },
        second: Region { offset: second_offset, size: hdr.second_size, actual: second_actual },
        device_tree: Region { offset: dt_offset, size: hdr.dt_size, actual: dt_actual },
        image_size,
    })
}
