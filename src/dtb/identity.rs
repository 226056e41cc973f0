//! identity.rs — hardware identity and per-blob identity tuples
//!
//! Root-node properties, big-endian cells:
//!   qcom,msm-id   = <platform soc_rev>...           (with board-id)
//!                 = <platform variant soc_rev>...   (legacy, no board-id)
//!   qcom,board-id = <variant subtype>...
//!   qcom,pmic-id  = <pmic0 pmic1 pmic2 pmic3>...
//!
//! platform_id bit layout: [31:24] reserved, [23:16] foundry, [15:0] msm id.

use core::ops::Range;

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::arith::mul_usize;
use crate::error::{BootError, BootResult};
use crate::fdt::Node;

pub const PLATFORM_ID_MASK: u32 = 0x0000_ffff;
pub const FOUNDRY_MASK: u32 = 0x00ff_0000;
pub const FOUNDRY_SHIFT: u32 = 16;
pub const VARIANT_TYPE_MASK: u32 = 0x0000_00ff;
pub const VARIANT_VERSION_MASK: u32 = 0x00ff_ff00;
pub const VARIANT_MATCH_MASK: u32 = 0x00ff_ffff;
pub const SUBTYPE_MASK: u32 = 0x0000_00ff;
pub const PMIC_MODEL_MASK: u32 = 0x0000_00ff;
pub const MAX_PMIC: usize = 4;

/// Snapshot of the running board, taken once per attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardwareIdentity {
    /// Raw chip id; only the low 16 bits identify the SoC.
    pub platform_id: u32,
    pub soc_rev: u32,
    pub foundry_id: u32,
    /// Full target id: type in [7:0], major/minor in [23:8].
    pub variant_id: u32,
    pub subtype: u32,
    pub pmic_rev: [u32; MAX_PMIC],
    pub pmic_model: [u32; MAX_PMIC],
}

bitflags! {
    /// Which identity fields of a candidate equal the hardware exactly.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DtMatchScore: u32 {
        const SOC     = 1 << 0;
        const VERSION = 1 << 1;
        const FOUNDRY = 1 << 2;
        const VARIANT = 1 << 3;
        const SUBTYPE = 1 << 4;
        const PMIC    = 1 << 5;

        const EXACT = Self::SOC.bits()
            | Self::VERSION.bits()
            | Self::VARIANT.bits()
            | Self::SUBTYPE.bits()
            | Self::PMIC.bits();
    }
}

/// One identity tuple of one blob. `None` means the blob does not carry
/// the field and matches any value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DtCandidate {
    pub platform_id: Option<u32>,
    pub soc_rev: Option<u32>,
    pub variant_id: Option<u32>,
    pub subtype: Option<u32>,
    pub pmic_rev: Option<[u32; MAX_PMIC]>,
    /// Where the blob lives in its source buffer.
    pub location: Range<usize>,
    /// Ordinal of the blob in its source (DTBO entry index for overlays).
    pub index: usize,
}

impl DtCandidate {
    /// Foundry bits, `None` when absent or zero.
    pub fn foundry(&self) -> Option<u32> {
        self.platform_id.map(|p| p & FOUNDRY_MASK).filter(|&f| f != 0)
    }

    /// PMIC model bytes, `None` when absent or all zero.
    pub fn pmic_model(&self) -> Option<[u32; MAX_PMIC]> {
        self.pmic_rev
            .map(|r| r.map(|v| v & PMIC_MODEL_MASK))
            .filter(|m| m.iter().any(|&v| v != 0))
    }

    pub fn score(&self, hw: &HardwareIdentity) -> DtMatchScore {
        let mut s = DtMatchScore::empty();
        if let Some(p) = self.platform_id {
            if p & PLATFORM_ID_MASK == hw.platform_id & PLATFORM_ID_MASK {
                s |= DtMatchScore::SOC;
            }
        }
        if self.soc_rev == Some(hw.soc_rev) {
            s |= DtMatchScore::VERSION;
        }
        if self.foundry() == Some(hw.foundry_id << FOUNDRY_SHIFT) {
            s |= DtMatchScore::FOUNDRY;
        }
        if let Some(v) = self.variant_id {
            if v & VARIANT_MATCH_MASK == hw.variant_id & VARIANT_MATCH_MASK {
                s |= DtMatchScore::VARIANT;
            }
        }
        if let Some(st) = self.subtype {
            if st & SUBTYPE_MASK == hw.subtype & SUBTYPE_MASK {
                s |= DtMatchScore::SUBTYPE;
            }
        }
        if self.pmic_rev == Some(hw.pmic_rev) {
            s |= DtMatchScore::PMIC;
        }
        s
    }

    pub fn is_exact(&self, hw: &HardwareIdentity) -> bool {
        self.score(hw).contains(DtMatchScore::EXACT)
    }

    /// Expand a blob's root node into one candidate per identity tuple.
    /// A blob whose identity properties are malformed yields no candidates.
    pub fn expand(root: &Node, location: Range<usize>, index: usize) -> BootResult<Vec<DtCandidate>> {
        let board = root.prop_cells("qcom,board-id");
        let msm = root.prop_cells("qcom,msm-id");
        let pmic = root.prop_cells("qcom,pmic-id");

        if root.prop("qcom,board-id").is_some() && board.as_ref().map_or(true, |b| b.len() % 2 != 0) {
            return Err(BootError::InvalidFormat("qcom,board-id not a list of pairs"));
        }
        if root.prop("qcom,pmic-id").is_some() && pmic.as_ref().map_or(true, |p| p.len() % 4 != 0) {
            return Err(BootError::InvalidFormat("qcom,pmic-id not a list of quads"));
        }

        // (platform, variant from legacy triple, soc_rev)
        let mut platforms: Vec<(Option<u32>, Option<u32>, Option<u32>)> = Vec::new();
        match &msm {
            None if root.prop("qcom,msm-id").is_some() => {
                return Err(BootError::InvalidFormat("qcom,msm-id length"));
            }
            None => platforms.push((None, None, None)),
            Some(c) if board.is_none() && c.len() % 3 == 0 && !c.is_empty() => {
                platforms.extend(c.chunks_exact(3).map(|t| (Some(t[0]), Some(t[1]), Some(t[2]))));
            }
            Some(c) if c.len() % 2 == 0 && !c.is_empty() => {
                platforms.extend(c.chunks_exact(2).map(|t| (Some(t[0]), None, Some(t[1]))));
            }
            Some(_) => return Err(BootError::InvalidFormat("qcom,msm-id length")),
        }

        let boards: Vec<(Option<u32>, Option<u32>)> = match &board {
            Some(c) if !c.is_empty() => c
                .chunks_exact(2)
                .map(|b| {
                    let subtype = if b[1] == 0 { b[0] >> 24 } else { b[1] };
                    (Some(b[0]), Some(subtype))
                })
                .collect(),
            _ => alloc::vec![(None, None)],
        };

        let pmics: Vec<Option<[u32; MAX_PMIC]>> = match &pmic {
            Some(c) if !c.is_empty() => c.chunks_exact(4).map(|q| Some([q[0], q[1], q[2], q[3]])).collect(),
            _ => alloc::vec![None],
        };

        let count = mul_usize(
            mul_usize(platforms.len(), boards.len(), "dt identity count")?,
            pmics.len(),
            "dt identity count",
        )?;
        let mut out = Vec::new();
        out.try_reserve_exact(count)
            .map_err(|_| BootError::OutOfMemory("dt candidates"))?;

        for &(platform_id, legacy_variant, soc_rev) in &platforms {
            for &(variant_id, subtype) in &boards {
                for &pmic_rev in &pmics {
                    out.push(DtCandidate {
                        platform_id,
                        soc_rev,
                        variant_id: variant_id.or(legacy_variant),
                        subtype,
                        pmic_rev,
                        location: location.clone(),
                        index,
                    });
                }
            }
        }
        Ok(out)
    }
}
