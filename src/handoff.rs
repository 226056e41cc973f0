//! handoff.rs — what the kernel entry receives
//!
//! Built by the orchestrator as the last step of a successful attempt and
//! handed to the [`KernelEntry`](crate::platform::KernelEntry) collaborator.
//! C-compatible so an assembly trampoline can read it directly.

use crate::layout::MemoryPlan;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHandoff {
    pub magic: u64,          // "NONOSABL"
    pub kernel_entry: u64,   // physical entry point
    pub device_tree: u64,    // patched DTB, passed in x0 / r2
    pub ramdisk_base: u64,
    pub ramdisk_size: u64,
    pub boot_flags: u32,     // BootModeFlags
    pub reserved: u32,
}

impl KernelHandoff {
    pub const MAGIC: u64 = 0x4E4F_4E4F_5341_424C; // "NONOSABL"

    pub fn new(plan: &MemoryPlan, boot_flags: u32) -> Self {
        let mut flags = boot_flags;
        if plan.is_32bit {
            flags |= BootModeFlags::ARCH32;
        }
        Self {
            magic: Self::MAGIC,
            kernel_entry: plan.kernel_addr,
            device_tree: plan.device_tree_addr,
            ramdisk_base: plan.ramdisk_addr,
            ramdisk_size: plan.ramdisk_size,
            boot_flags: flags,
            reserved: 0,
        }
    }

    #[inline]
    pub fn has(&self, flag: u32) -> bool {
        self.boot_flags & flag == flag
    }
}

/// Boot mode bitflag constants carried in `boot_flags`
#[repr(C)]
pub struct BootModeFlags;

impl BootModeFlags {
    pub const RECOVERY: u32 = 0x01;
    pub const ARCH32: u32 = 0x02;
    pub const UNLOCKED: u32 = 0x04;
    pub const VERIFIED: u32 = 0x08;
    pub const DTBO_APPLIED: u32 = 0x10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_plan_addresses() {
        let plan = MemoryPlan {
            kernel_addr: 0x8000_8000,
            kernel_size: 0x1000,
            ramdisk_addr: 0x8220_0000,
            ramdisk_size: 0x200,
            ramdisk_end: 0x8400_0000,
            device_tree_addr: 0x8200_0000,
            is_32bit: true,
        };
        let h = KernelHandoff::new(&plan, BootModeFlags::RECOVERY);
        assert_eq!(h.magic, KernelHandoff::MAGIC);
        assert_eq!(h.kernel_entry, 0x8000_8000);
        assert_eq!(h.device_tree, 0x8200_0000);
        assert!(h.has(BootModeFlags::ARCH32 | BootModeFlags::RECOVERY));
        assert!(!h.has(BootModeFlags::UNLOCKED));
    }
}
