//! filter.rs — admission gate and the sequential best-match pipeline
//!
//! Admission drops candidates that can never run on this board (wrong SoC,
//! wrong board type, any version newer than the hardware). The pipeline then
//! narrows the admitted set one field at a time:
//!
//!   1. foundry        exact, else candidates without a foundry
//!   2. pmic model     exact, else candidates without a model
//!   3. soc_rev        highest value <= hardware
//!   4. variant ver    highest (variant & 0x00ffff00) <= hardware
//!   5..8 pmic[0..3]   highest value <= hardware, slot by slot
//!
//! Every stage is a `retain` over the same vector, so no stage can grow the
//! set. The first survivor wins.

use alloc::vec::Vec;

use super::identity::{
    DtCandidate, HardwareIdentity, FOUNDRY_SHIFT, PLATFORM_ID_MASK, SUBTYPE_MASK, VARIANT_TYPE_MASK,
    VARIANT_VERSION_MASK,
};
use crate::error::{BootError, BootResult};
use crate::logger::{log_debug, log_warn};

/// Which identity fields take part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Every field: appended board DTBs and DTBO overlays.
    Full,
    /// Platform, soc revision and foundry only: the SoC base tree.
    Soc,
}

pub fn admits(c: &DtCandidate, hw: &HardwareIdentity, scope: Scope) -> bool {
    if let Some(p) = c.platform_id {
        if p & PLATFORM_ID_MASK != hw.platform_id & PLATFORM_ID_MASK {
            return false;
        }
    }
    if let Some(r) = c.soc_rev {
        if r > hw.soc_rev {
            return false;
        }
    }
    if scope == Scope::Soc {
        return true;
    }
    if let Some(v) = c.variant_id {
        if v & VARIANT_TYPE_MASK != hw.variant_id & VARIANT_TYPE_MASK
            || v & VARIANT_VERSION_MASK > hw.variant_id & VARIANT_VERSION_MASK
        {
            return false;
        }
    }
    if let Some(s) = c.subtype {
        if s & SUBTYPE_MASK != hw.subtype & SUBTYPE_MASK {
            return false;
        }
    }
    if let Some(pm) = c.pmic_rev {
        if pm.iter().zip(hw.pmic_rev.iter()).any(|(d, b)| d > b) {
            return false;
        }
    }
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Foundry,
    PmicModel,
    SocRev,
    VariantVersion,
    Pmic(usize),
}

impl Stage {
    pub const FULL: [Stage; 8] = [
        Stage::Foundry,
        Stage::PmicModel,
        Stage::SocRev,
        Stage::VariantVersion,
        Stage::Pmic(0),
        Stage::Pmic(1),
        Stage::Pmic(2),
        Stage::Pmic(3),
    ];
    pub const SOC: [Stage; 2] = [Stage::Foundry, Stage::SocRev];

    pub fn for_scope(scope: Scope) -> &'static [Stage] {
        match scope {
            Scope::Full => &Self::FULL,
            Scope::Soc => &Self::SOC,
        }
    }

    /// Narrow `set` in place.
    pub fn apply(self, set: &mut Vec<DtCandidate>, hw: &HardwareIdentity) {
        match self {
            Stage::Foundry => {
                let want = hw.foundry_id << FOUNDRY_SHIFT;
                exact_or_absent(set, |c| c.foundry().map(|f| f == want))
            }
            Stage::PmicModel => exact_or_absent(set, |c| c.pmic_model().map(|m| m == hw.pmic_model)),
            Stage::SocRev => reduce(set, hw.soc_rev, |c| c.soc_rev),
            Stage::VariantVersion => reduce(set, hw.variant_id & VARIANT_VERSION_MASK, |c| {
                c.variant_id.map(|v| v & VARIANT_VERSION_MASK)
            }),
            Stage::Pmic(i) => reduce(set, hw.pmic_rev[i], |c| c.pmic_rev.map(|p| p[i])),
        }
    }
}

/// `field` yields `Some(true)` for an exact match, `Some(false)` for a
/// mismatch and `None` when the candidate does not carry the field.
fn exact_or_absent(set: &mut Vec<DtCandidate>, field: impl Fn(&DtCandidate) -> Option<bool>) {
    if set.iter().any(|c| field(c) == Some(true)) {
        set.retain(|c| field(c) == Some(true));
    } else {
        set.retain(|c| field(c).is_none());
    }
}

/// Keep the candidates at the best value not above `board`. An absent field
/// counts as `board`.
fn reduce(set: &mut Vec<DtCandidate>, board: u32, field: impl Fn(&DtCandidate) -> Option<u32>) {
    let value = |c: &DtCandidate| field(c).unwrap_or(board);
    let target = if set.iter().any(|c| value(c) == board) {
        Some(board)
    } else {
        set.iter().map(value).filter(|&v| v < board).max()
    };
    match target {
        Some(t) => set.retain(|c| value(c) == t),
        None => set.clear(),
    }
}

/// Admit, run the pipeline for `scope`, return the first survivor.
pub fn select(candidates: Vec<DtCandidate>, hw: &HardwareIdentity, scope: Scope) -> BootResult<DtCandidate> {
    let mut set = candidates;
    let before = set.len();
    set.retain(|c| {
        let ok = admits(c, hw, scope);
        if !ok {
            log_debug(
                "dtb",
                &alloc::format!(
                    "reject blob {} platform {:x?} soc {:x?} variant {:x?} subtype {:x?} pmic {:x?}",
                    c.index,
                    c.platform_id,
                    c.soc_rev,
                    c.variant_id,
                    c.subtype,
                    c.pmic_rev
                ),
            );
        }
        ok
    });
    log_debug("dtb", &alloc::format!("{:?}: admitted {} of {} candidates", scope, set.len(), before));

    for &stage in Stage::for_scope(scope) {
        if set.is_empty() {
            break;
        }
        stage.apply(&mut set, hw);
        log_debug("dtb", &alloc::format!("{:?}: {} left", stage, set.len()));
    }

    match set.into_iter().next() {
        Some(c) => {
            log_debug(
                "dtb",
                &alloc::format!("selected blob {} at {:#x}..{:#x}", c.index, c.location.start, c.location.end),
            );
            Ok(c)
        }
        None => {
            log_warn("dtb", "no candidate survived the match pipeline");
            Err(BootError::NoDeviceTreeMatch)
        }
    }
}
