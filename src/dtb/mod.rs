//! dtb — selecting the one device tree this board boots with
//!
//! Sources, in order of preference:
//!   - DTBs appended after the kernel (offset recorded by the extractor),
//!   - otherwise the boot image's own device-tree slot,
//!   - plus, on overlay targets, board overlays from the DTBO partition.
//!
//! Paths:
//!   single    one appended blob and no DTBO: used as-is
//!   legacy    no DTBO: full-identity match over every appended tuple
//!   exact     DTBO present but an appended tuple matches the board exactly:
//!             that blob is used and the overlay step is skipped
//!   overlay   SoC base from the appended set + best DTBO entry, merged

pub mod dtbo;
pub mod filter;
pub mod identity;

use core::ops::Range;

use alloc::format;
use alloc::vec::Vec;

pub use dtbo::{DtboEntry, DtboTable};
pub use filter::{Scope, Stage};
pub use identity::{DtCandidate, DtMatchScore, HardwareIdentity};

use crate::arith::{add_usize, try_copy};
use crate::bootimg::BootImageLayout;
use crate::error::{BootError, BootResult};
use crate::fdt::{apply_overlay, DeviceTree, FdtHeader, FDT_HEADER_SIZE};
use crate::kernel::KernelImage;
use crate::layout::{check_device_tree_fits, LoadAddresses};
use crate::logger::{log_debug, log_info, log_warn};

/// How the final tree was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DtOrigin {
    /// The only blob appended to the kernel.
    Single,
    /// Best full-identity match among appended / image-slot blobs.
    Matched,
    /// An appended blob matched exactly; the DTBO table was not consulted.
    Exact,
    /// SoC base tree with a DTBO board overlay applied.
    Overlay,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDeviceTree {
    pub blob: Vec<u8>,
    pub origin: DtOrigin,
    /// DTBO entry applied, for `androidboot.dtbo_idx`.
    pub dtbo_index: Option<usize>,
}

/// Device-tree selection for one boot attempt.
pub struct DeviceTreeResolver<'a> {
    hw: &'a HardwareIdentity,
    addrs: &'a LoadAddresses,
}

impl<'a> DeviceTreeResolver<'a> {
    pub fn new(hw: &'a HardwareIdentity, addrs: &'a LoadAddresses) -> Self {
        Self { hw, addrs }
    }

    pub fn resolve(
        &self,
        image: &[u8],
        kernel: &KernelImage,
        layout: &BootImageLayout,
        dtbo: Option<&[u8]>,
    ) -> BootResult<ResolvedDeviceTree> {
        let (region, start) = match kernel.embedded_dtb_offset() {
            Some(off) => {
                let r = kernel.dtb_region();
                let region = image
                    .get(r)
                    .ok_or(BootError::MalformedSizes("kernel region beyond image"))?;
                (region, off)
            }
            None if !layout.device_tree.is_empty() => (layout.device_tree(image)?, 0),
            None => (&[][..], 0),
        };

        let blobs = scan(region, start)?;
        log_info("dtb", &format!("found {} device tree blob(s)", blobs.len()));

        let resolved = match dtbo {
            None if blobs.len() == 1 => {
                log_debug("dtb", "single appended device tree");
                ResolvedDeviceTree {
                    blob: try_copy(&region[blobs[0].clone()], "device tree")?,
                    origin: DtOrigin::Single,
                    dtbo_index: None,
                }
            }
            None => {
                let cands = candidates(region, &blobs)?;
                let best = filter::select(cands, self.hw, Scope::Full)?;
                ResolvedDeviceTree {
                    blob: try_copy(&region[best.location], "device tree")?,
                    origin: DtOrigin::Matched,
                    dtbo_index: None,
                }
            }
            Some(dtbo) => self.resolve_with_overlay(region, &blobs, dtbo)?,
        };

        check_device_tree_fits(self.addrs, resolved.blob.len())?;
        log_info(
            "dtb",
            &format!(
                "device tree {:?}, {:#x} bytes, dtbo entry {:?}",
                resolved.origin,
                resolved.blob.len(),
                resolved.dtbo_index
            ),
        );
        Ok(resolved)
    }

    fn resolve_with_overlay(
        &self,
        region: &[u8],
        blobs: &[Range<usize>],
        dtbo: &[u8],
    ) -> BootResult<ResolvedDeviceTree> {
        let cands = candidates(region, blobs)?;

        // An exact appended match wins even when a board overlay exists.
        if let Some(exact) = cands.iter().find(|c| c.is_exact(self.hw)) {
            log_info("dtb", "exact device tree match, overlay not required");
            return Ok(ResolvedDeviceTree {
                blob: try_copy(&region[exact.location.clone()], "device tree")?,
                origin: DtOrigin::Exact,
                dtbo_index: None,
            });
        }

        let soc = filter::select(cands, self.hw, Scope::Soc)?;
        let base = DeviceTree::parse(&region[soc.location.clone()])?;

        let table = DtboTable::parse(dtbo)?;
        let mut board_cands = Vec::new();
        for i in 0..table.entries.len() {
            let blob = table.blob(dtbo, i)?;
            if FdtHeader::probe(blob).is_none() {
                log_warn("dtbo", &format!("entry {} is not a device tree, stopping", i));
                break;
            }
            match DeviceTree::parse(blob) {
                Ok(t) => match DtCandidate::expand(&t.root, table.entries[i].range(), i) {
                    Ok(c) => board_cands.extend(c),
                    Err(e) => log_debug("dtbo", &format!("entry {} skipped: {}", i, e)),
                },
                Err(e) => log_debug("dtbo", &format!("entry {} skipped: {}", i, e)),
            }
        }
        let board = filter::select(board_cands, self.hw, Scope::Full)?;
        let overlay = DeviceTree::parse(&dtbo[board.location.clone()])?;

        let merged = apply_overlay(&base, &overlay)?;
        log_info(
            "dtb",
            &format!("applied dtbo entry {} onto soc blob {}", board.index, soc.index),
        );
        Ok(ResolvedDeviceTree {
            blob: merged.to_bytes()?,
            origin: DtOrigin::Overlay,
            dtbo_index: Some(board.index),
        })
    }
}

/// Walk consecutive FDT blobs in `region` from `start`, stopping at the
/// first header that does not parse or does not fit.
pub fn scan(region: &[u8], start: usize) -> BootResult<Vec<Range<usize>>> {
    let mut out = Vec::new();
    let mut at = start;
    while add_usize(at, FDT_HEADER_SIZE, "dtb scan")? < region.len() {
        let Some(hdr) = FdtHeader::probe(&region[at..]) else {
            break;
        };
        let end = add_usize(at, hdr.totalsize as usize, "dtb scan")?;
        if end > region.len() {
            break;
        }
        out.push(at..end);
        at = end;
    }
    Ok(out)
}

fn candidates(region: &[u8], blobs: &[Range<usize>]) -> BootResult<Vec<DtCandidate>> {
    let mut out = Vec::new();
    for (i, r) in blobs.iter().enumerate() {
        let tree = match DeviceTree::parse(&region[r.clone()]) {
            Ok(t) => t,
            Err(e) => {
                log_debug("dtb", &format!("blob {} does not parse: {}", i, e));
                continue;
            }
        };
        match DtCandidate::expand(&tree.root, r.clone(), i) {
            Ok(c) => out.extend(c),
            Err(e) => log_debug("dtb", &format!("blob {} identity ignored: {}", i, e)),
        }
    }
    Ok(out)
}
