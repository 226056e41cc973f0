//! platform.rs — collaborator contracts
//!
//! Flash access, signature checking, board identification, memory writes
//! and the final jump all belong to the surrounding firmware. The
//! orchestrator only sees them through these traits.

use alloc::string::String;
use alloc::vec::Vec;

use crate::cmdline::{SystemPath, VerityMode};
use crate::dtb::HardwareIdentity;
use crate::error::BootResult;
use crate::handoff::KernelHandoff;
use crate::verify::TrustVerdict;

/// Partition reader. Bytes are fully in memory when returned.
pub trait ImageSource {
    fn load_partition(&mut self, name: &str) -> BootResult<Vec<u8>>;
}

pub trait TrustVerifier {
    fn verify(&mut self, partition: &str, image: &[u8]) -> BootResult<TrustVerdict>;
}

pub trait HardwareIdentityProvider {
    fn read_identity(&self) -> BootResult<HardwareIdentity>;
}

/// One contiguous DDR range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RamRegion {
    pub base: u64,
    pub size: u64,
}

pub trait BaseMemoryProvider {
    fn lowest_ram_base(&self) -> BootResult<u64>;

    /// Every usable DDR range, for the `/memory` node.
    fn ram_regions(&self) -> BootResult<Vec<RamRegion>>;
}

/// Present only on overlay-capable targets.
pub trait DtboSource {
    fn load_dtbo_partition(&mut self) -> BootResult<Vec<u8>>;
}

pub trait DtPatcher {
    /// Patch `blob` and return the new blob.
    fn patch(&mut self, blob: &[u8], req: &crate::dtpatch::PatchRequest<'_>) -> BootResult<Vec<u8>>;
}

pub trait PhysicalMemory {
    fn write(&mut self, addr: u64, bytes: &[u8]) -> BootResult<()>;
}

pub trait KernelEntry {
    /// Transfer control. Never returns.
    fn enter(&self, handoff: &KernelHandoff) -> !;
}

/// Device and slot state the firmware already knows when the attempt
/// starts. Feeds the command line and the device-tree patch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub unlocked: bool,
    pub verity: Option<VerityMode>,
    pub boot_device: Option<String>,
    pub serial_no: Option<String>,
    pub ffbm_mode: Option<String>,
    pub charger_pause: bool,
    pub alarm_boot: bool,
    pub baseband: Option<String>,
    pub display_panel: Option<String>,
    pub mdtp_active: bool,
    /// Active slot, e.g. `_a`.
    pub slot_suffix: Option<String>,
    /// Development image: no slot suffix, no root clause.
    pub dev_image: bool,
    pub system_path: Option<SystemPath>,
    pub kaslr_seed: Option<u64>,
    /// Splash frame buffer (address, size).
    pub splash: Option<(u64, u64)>,
    /// Partial-goods fuse mask read from the chip; zero on fully good parts.
    pub disabled_subsystems: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootRequest {
    pub recovery: bool,
    pub metadata: DeviceMetadata,
}
