//! kernel.rs — kernel payload extraction
//!
//! The kernel slot of a boot image holds one of:
//!   - a gzip member (decompressed here; an appended DTB may follow it),
//!   - a "patched" kernel: `UNCOMPRESSED_IMG` + LE u32 length, then the
//!     kernel, then the appended DTB,
//!   - a raw arm64 `Image` (magic `ARM\x64` at 0x38),
//!   - a raw arm32 `zImage` (appended DTB offset at 0x2C).

use core::ops::Range;

use alloc::vec::Vec;
use miniz_oxide::inflate::core::{decompress, inflate_flags, DecompressorOxide};
use miniz_oxide::inflate::TINFLStatus;

use crate::arith::{add_u64, add_usize, try_copy, try_zeroed};
use crate::bootimg::BootImageLayout;
use crate::error::{BootError, BootResult};
use crate::layout::LoadAddresses;
use crate::logger::{log_debug, log_info, log_warn};

pub const PATCHED_KERNEL_MAGIC: &[u8; 16] = b"UNCOMPRESSED_IMG";
pub const PATCHED_KERNEL_HEADER_SIZE: usize = 20;

pub const KERNEL64_HDR_MAGIC: u32 = 0x644d_5241;
const KERNEL64_MAGIC_OFFSET: usize = 0x38;
const KERNEL64_IMAGE_SIZE_OFFSET: usize = 0x10;
const DTB_OFFSET_LOCATION_IN_ARCH32_KERNEL_HDR: usize = 0x2C;

/// Extracted kernel. Immutable once returned by [`extract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelImage {
    bytes: Vec<u8>,
    is_32bit: bool,
    embedded_dtb_offset: Option<usize>,
    dtb_region: Range<usize>,
    image_size: u64,
}

impl KernelImage {
    pub(crate) fn from_parts(
        bytes: Vec<u8>,
        is_32bit: bool,
        embedded_dtb_offset: Option<usize>,
        dtb_region: Range<usize>,
        image_size: u64,
    ) -> Self {
        Self { bytes, is_32bit, embedded_dtb_offset, dtb_region, image_size }
    }

    /// Bytes to place at the kernel load address.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_32bit(&self) -> bool {
        self.is_32bit
    }

    /// Offset of the first appended DTB, relative to [`Self::dtb_region`].
    pub fn embedded_dtb_offset(&self) -> Option<usize> {
        self.embedded_dtb_offset
    }

    /// Range of the boot image to scan for appended DTBs.
    pub fn dtb_region(&self) -> Range<usize> {
        self.dtb_region.clone()
    }

    /// Memory the kernel occupies once running (arm64 `image_size`).
    pub fn image_size(&self) -> u64 {
        self.image_size
    }
}

/// Extract the kernel payload of `image` according to `layout`.
pub fn extract(image: &[u8], layout: &BootImageLayout, addrs: &LoadAddresses) -> BootResult<KernelImage> {
    let raw = layout.kernel(image)?;
    let region = layout.kernel.range();

    let (bytes, mut embedded, dtb_region) = if is_gzip(raw) {
        // bound: the decompressed kernel may not reach the device-tree window
        let avail = addrs.kernel_window(false)?;
        log_info("kernel", &alloc::format!("decompressing kernel, window {:#x}", avail));
        let (out, consumed) = gunzip(raw, avail)?;
        log_info(
            "kernel",
            &alloc::format!("decompressed {:#x} -> {:#x} bytes", consumed, out.len()),
        );
        (out, Some(consumed), region)
    } else if raw.starts_with(PATCHED_KERNEL_MAGIC) {
        let (body, kernel_len) = patched_kernel(raw)?;
        let start = add_usize(region.start, PATCHED_KERNEL_HEADER_SIZE, "patched kernel start")?;
        log_debug("kernel", &alloc::format!("patched kernel, {:#x} bytes", kernel_len));
        (try_copy(body, "kernel copy")?, Some(kernel_len), start..region.end)
    } else {
        (try_copy(raw, "kernel copy")?, None, region)
    };

    let is_64 = read_le_u32(&bytes, KERNEL64_MAGIC_OFFSET) == Some(KERNEL64_HDR_MAGIC);

    let image_size = if is_64 {
        let declared = read_le_u64(&bytes, KERNEL64_IMAGE_SIZE_OFFSET)
            .ok_or(BootError::MalformedSizes("arm64 header truncated"))?;
        let size = if declared == 0 { bytes.len() as u64 } else { declared.max(bytes.len() as u64) };
        let end = add_u64(addrs.kernel, size, "kernel end")?;
        if end >= addrs.device_tree {
            log_warn(
                "kernel",
                &alloc::format!("kernel end {:#x} reaches device tree {:#x}", end, addrs.device_tree),
            );
            return Err(BootError::LayoutOverflow("kernel overlaps device tree window"));
        }
        size
    } else {
        if embedded.is_none() {
            let off = read_le_u32(&bytes, DTB_OFFSET_LOCATION_IN_ARCH32_KERNEL_HDR)
                .ok_or(BootError::MalformedSizes("32-bit kernel header truncated"))?
                as usize;
            if off > bytes.len() {
                return Err(BootError::MalformedSizes("32-bit dtb offset beyond kernel"));
            }
            embedded = if off == 0 { None } else { Some(off) };
        }
        bytes.len() as u64
    };

    log_debug(
        "kernel",
        &alloc::format!(
            "{} kernel, {:#x} bytes, appended dtb at {:?}",
            if is_64 { "64-bit" } else { "32-bit" },
            bytes.len(),
            embedded
        ),
    );

    Ok(KernelImage {
        bytes,
        is_32bit: !is_64,
        embedded_dtb_offset: embedded,
        dtb_region,
        image_size,
    })
}

fn patched_kernel(raw: &[u8]) -> BootResult<(&[u8], usize)> {
    let len = read_le_u32(raw, PATCHED_KERNEL_MAGIC.len())
        .ok_or(BootError::MalformedSizes("patched kernel header truncated"))? as usize;
    let end = add_usize(PATCHED_KERNEL_HEADER_SIZE, len, "patched kernel length")?;
    let body = raw
        .get(PATCHED_KERNEL_HEADER_SIZE..end)
        .ok_or(BootError::MalformedSizes("patched kernel length beyond payload"))?;
    Ok((body, len))
}

#[inline]
fn read_le_u32(buf: &[u8], at: usize) -> Option<u32> {
    let b = buf.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
fn read_le_u64(buf: &[u8], at: usize) -> Option<u64> {
    let b = buf.get(at..at.checked_add(8)?)?;
    let mut a = [0u8; 8];
    a.copy_from_slice(b);
    Some(u64::from_le_bytes(a))
}

/* ---------- gzip (RFC 1952) ---------- */

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_CM_DEFLATE: u8 = 8;
const GZIP_HEADER_SIZE: usize = 10;
const GZIP_TRAILER_SIZE: usize = 8;
const FHCRC: u8 = 1 << 1;
const FEXTRA: u8 = 1 << 2;
const FNAME: u8 = 1 << 3;
const FCOMMENT: u8 = 1 << 4;
const FRESERVED: u8 = 0xE0;

pub fn is_gzip(buf: &[u8]) -> bool {
    buf.len() > GZIP_HEADER_SIZE && buf[..2] == GZIP_MAGIC
}

/// Inflate one gzip member, producing at most `limit` bytes.
/// Returns the output and the number of input bytes the member occupied.
pub fn gunzip(input: &[u8], limit: usize) -> BootResult<(Vec<u8>, usize)> {
    let body = gzip_body_offset(input)?;
    let deflate = &input[body..];

    let mut state = alloc::boxed::Box::<DecompressorOxide>::default();
    let mut out = try_zeroed(limit.min(deflate.len().saturating_mul(4).max(64 * 1024)), "inflate buffer")?;
    let mut in_pos = 0usize;
    let mut out_pos = 0usize;

    loop {
        let (status, consumed, written) = decompress(
            &mut state,
            &deflate[in_pos..],
            &mut out,
            out_pos,
            inflate_flags::TINFL_FLAG_USING_NON_WRAPPING_OUTPUT_BUF,
        );
        in_pos += consumed;
        out_pos += written;

        match status {
            TINFLStatus::Done => break,
            TINFLStatus::HasMoreOutput => {
                if out.len() >= limit {
                    return Err(BootError::DecompressFailed("kernel exceeds available window"));
                }
                let grow = out.len().saturating_mul(2).min(limit);
                out.try_reserve_exact(grow - out.len())
                    .map_err(|_| BootError::OutOfMemory("inflate buffer"))?;
                out.resize(grow, 0);
            }
            TINFLStatus::NeedsMoreInput => {
                return Err(BootError::DecompressFailed("truncated deflate stream"));
            }
            _ => return Err(BootError::DecompressFailed("corrupt deflate stream")),
        }
    }
    out.truncate(out_pos);

    let trailer_at = add_usize(body, in_pos, "gzip trailer")?;
    let member_end = add_usize(trailer_at, GZIP_TRAILER_SIZE, "gzip trailer")?;
    let trailer = input
        .get(trailer_at..member_end)
        .ok_or(BootError::DecompressFailed("missing gzip trailer"))?;
    let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let isize = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
    if isize != out.len() as u32 {
        return Err(BootError::DecompressFailed("gzip length mismatch"));
    }
    if crc != crc32(&out) {
        return Err(BootError::DecompressFailed("gzip crc mismatch"));
    }

    Ok((out, member_end))
}

fn gzip_body_offset(buf: &[u8]) -> BootResult<usize> {
    if buf.len() < GZIP_HEADER_SIZE || buf[..2] != GZIP_MAGIC {
        return Err(BootError::DecompressFailed("not a gzip member"));
    }
    if buf[2] != GZIP_CM_DEFLATE {
        return Err(BootError::DecompressFailed("unsupported gzip method"));
    }
    let flags = buf[3];
    if flags & FRESERVED != 0 {
        return Err(BootError::DecompressFailed("reserved gzip flags set"));
    }

    let mut pos = GZIP_HEADER_SIZE;
    if flags & FEXTRA != 0 {
        let xlen_end = add_usize(pos, 2, "gzip extra field")?;
        let x = buf
            .get(pos..xlen_end)
            .ok_or(BootError::DecompressFailed("truncated gzip extra field"))?;
        let xlen = u16::from_le_bytes([x[0], x[1]]) as usize;
        pos = add_usize(xlen_end, xlen, "gzip extra field")?;
    }
    if flags & FNAME != 0 {
        pos = skip_cstr(buf, pos)?;
    }
    if flags & FCOMMENT != 0 {
        pos = skip_cstr(buf, pos)?;
    }
    if flags & FHCRC != 0 {
        pos = add_usize(pos, 2, "gzip header crc")?;
    }
    if pos > buf.len() {
        return Err(BootError::DecompressFailed("truncated gzip header"));
    }
    Ok(pos)
}

fn skip_cstr(buf: &[u8], from: usize) -> BootResult<usize> {
    let rest = buf
        .get(from..)
        .ok_or(BootError::DecompressFailed("truncated gzip header"))?;
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(BootError::DecompressFailed("unterminated gzip string"))?;
    add_usize(from, nul + 1, "gzip header string")
}

/// CRC-32 (IEEE, reflected) as used by the gzip trailer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &b in data {
        crc ^= b as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}
