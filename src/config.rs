//! config.rs — boot posture read once at orchestration start
//!
//! The same binary can boot a verified, multi-slot, overlay-capable target or
//! a bare development board: the differences live in [`BootCapabilities`]
//! rather than in compile-time switches.

use bitflags::bitflags;

use crate::error::{BootError, BootResult};

bitflags! {
    /// Platform capabilities toggled at runtime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(transparent))]
    pub struct BootCapabilities: u32 {
        /// Consult the trust verdict and emit verified-boot cmdline fields.
        const VERIFIED_BOOT   = 1 << 0;
        /// Verifier supplies its own cmdline fragment (AVB 2.0 style).
        const VERIFIED_BOOT_2 = 1 << 1;
        /// Mobile device theft protection flag on the cmdline.
        const MDTP            = 1 << 2;
        /// A/B slots: slot suffix on the cmdline.
        const MULTI_SLOT      = 1 << 3;
        /// Board overlays come from a DTBO partition.
        const DTBO            = 1 << 4;
        /// Root filesystem is the system partition (no initramfs).
        const SYSTEM_AS_ROOT  = 1 << 5;
        const KASLR_SEED      = 1 << 6;
        const SPLASH_UPDATE   = 1 << 7;
        const FSTAB_UPDATE    = 1 << 8;
        /// Disable fused-off blocks in the tree (partial-goods parts).
        const PARTIAL_GOODS   = 1 << 9;
    }
}

/// Platform-fixed placement offsets, OR-ed into the RAM base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct AddressConfig {
    pub kernel: u64,
    pub kernel_32: u64,
    pub device_tree: u64,
    pub ramdisk: u64,
    pub ramdisk_end: u64,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            kernel: 0x0008_0000,
            kernel_32: 0x0000_8000,
            device_tree: 0x0200_0000,
            ramdisk: 0x0220_0000,
            ramdisk_end: 0x0400_0000,
        }
    }
}

/// Where an aborted attempt goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(rename_all = "snake_case"))]
pub enum FallbackPolicy {
    Fastboot,
    RecoveryThenFastboot,
}

pub const DEFAULT_MAX_PAGE_SIZE: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct BootConfig {
    pub capabilities: BootCapabilities,
    pub addresses: AddressConfig,
    pub max_page_size: u32,
    /// When set, the header page size must equal this value.
    pub expected_page_size: Option<u32>,
    pub fallback: FallbackPolicy,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            capabilities: BootCapabilities::VERIFIED_BOOT | BootCapabilities::KASLR_SEED,
            addresses: AddressConfig::default(),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            expected_page_size: None,
            fallback: FallbackPolicy::Fastboot,
        }
    }
}

impl BootConfig {
    #[inline]
    pub fn has(&self, cap: BootCapabilities) -> bool {
        self.capabilities.contains(cap)
    }

    /// Reject capability sets no target can boot with.
    pub fn validate(&self) -> BootResult<()> {
        if self.has(BootCapabilities::VERIFIED_BOOT_2) && !self.has(BootCapabilities::MULTI_SLOT) {
            return Err(BootError::InvalidFormat("verified boot 2 requires multi slot"));
        }
        Ok(())
    }
}
