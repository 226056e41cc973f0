//! layout.rs — physical placement of kernel, device tree and ramdisk
//!
//! Load addresses are `base | offset`: the RAM base is OR-ed into a
//! platform-fixed window, never added. The configured windows are ordered
//!
//!   kernel(_32) < device_tree < ramdisk < ramdisk_end
//!
//! so a plan that passes the bound checks below is pairwise disjoint:
//! the kernel ends before the tree window, the tree ends before the ramdisk,
//! and the ramdisk ends before `ramdisk_end`.

use core::ops::Range;

use crate::arith::{add_u64, to_usize};
use crate::bootimg::BootImageLayout;
use crate::config::AddressConfig;
use crate::error::{BootError, BootResult};
use crate::kernel::KernelImage;
use crate::logger::{log_debug, log_warn};

/// Window anchors derived from the RAM base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadAddresses {
    pub kernel: u64,
    pub kernel_32: u64,
    pub device_tree: u64,
    pub ramdisk: u64,
    pub ramdisk_end: u64,
}

impl LoadAddresses {
    pub fn derive(base_memory: u64, cfg: &AddressConfig) -> BootResult<Self> {
        let a = Self {
            kernel: base_memory | cfg.kernel,
            kernel_32: base_memory | cfg.kernel_32,
            device_tree: base_memory | cfg.device_tree,
            ramdisk: base_memory | cfg.ramdisk,
            ramdisk_end: base_memory | cfg.ramdisk_end,
        };
        let ordered = a.kernel < a.device_tree
            && a.kernel_32 < a.device_tree
            && a.device_tree < a.ramdisk
            && a.ramdisk < a.ramdisk_end;
        if !ordered {
            log_warn("layout", &alloc::format!("reserved windows out of order: {:x?}", a));
            return Err(BootError::LayoutOverflow("reserved windows out of order"));
        }
        Ok(a)
    }

    #[inline]
    pub fn kernel_for(&self, is_32bit: bool) -> u64 {
        if is_32bit {
            self.kernel_32
        } else {
            self.kernel
        }
    }

    /// Bytes between a kernel load address and the device-tree window,
    /// as an indexable length.
    pub fn kernel_window(&self, is_32bit: bool) -> BootResult<usize> {
        let len = self
            .device_tree
            .checked_sub(self.kernel_for(is_32bit))
            .ok_or(BootError::IntegerOverflow("kernel window"))?;
        to_usize(len, "kernel window")
    }

    /// Bytes available to the device tree before the ramdisk.
    pub fn device_tree_window(&self) -> u64 {
        // ordering checked in derive()
        self.ramdisk - self.device_tree
    }
}

/// Check a device tree of `size` bytes against `[dt, ramdisk)`.
pub fn check_device_tree_fits(addrs: &LoadAddresses, size: usize) -> BootResult<()> {
    if size as u64 > addrs.device_tree_window() {
        log_warn(
            "layout",
            &alloc::format!(
                "device tree {:#x} bytes exceeds window {:#x}",
                size,
                addrs.device_tree_window()
            ),
        );
        return Err(BootError::LayoutOverflow("device tree overruns ramdisk"));
    }
    Ok(())
}

/// Resolved physical placement for one boot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPlan {
    pub kernel_addr: u64,
    pub kernel_size: u64,
    pub ramdisk_addr: u64,
    pub ramdisk_size: u64,
    pub ramdisk_end: u64,
    pub device_tree_addr: u64,
    pub is_32bit: bool,
}

impl MemoryPlan {
    pub fn kernel_region(&self) -> Range<u64> {
        self.kernel_addr..self.kernel_addr + self.kernel_size
    }

    pub fn ramdisk_region(&self) -> Range<u64> {
        self.ramdisk_addr..self.ramdisk_addr + self.ramdisk_size
    }

    /// The reserved device-tree window; the tree itself may be shorter.
    pub fn device_tree_window(&self) -> Range<u64> {
        self.device_tree_addr..self.ramdisk_addr
    }

    pub fn device_tree_fits(&self, size: usize) -> BootResult<()> {
        let window = self.ramdisk_addr - self.device_tree_addr;
        if size as u64 > window {
            return Err(BootError::LayoutOverflow("device tree overruns ramdisk"));
        }
        Ok(())
    }
}

/// Compute and bound-check the memory plan.
pub fn plan(
    layout: &BootImageLayout,
    kernel: &KernelImage,
    base_memory: u64,
    cfg: &AddressConfig,
) -> BootResult<MemoryPlan> {
    let addrs = LoadAddresses::derive(base_memory, cfg)?;
    let kernel_addr = addrs.kernel_for(kernel.is_32bit());
    let ramdisk_size = layout.ramdisk.size as u64;

    let ramdisk_room = addrs
        .ramdisk_end
        .checked_sub(addrs.ramdisk)
        .ok_or(BootError::LayoutOverflow("ramdisk window inverted"))?;
    if ramdisk_room < ramdisk_size {
        log_warn(
            "layout",
            &alloc::format!("ramdisk {:#x} bytes, window {:#x}", ramdisk_size, ramdisk_room),
        );
        return Err(BootError::LayoutOverflow("ramdisk exceeds reserved window"));
    }

    let kernel_size = if kernel.is_32bit() {
        // copied, not executed in place: the whole rounded payload must fit
        let placed = (layout.kernel.actual as u64).max(kernel.len() as u64);
        let end = add_u64(kernel_addr, placed, "32-bit kernel end")
            .map_err(|_| BootError::LayoutOverflow("32-bit kernel end"))?;
        if end > addrs.device_tree {
            return Err(BootError::LayoutOverflow("32-bit kernel overruns device tree"));
        }
        placed
    } else {
        kernel.image_size()
    };

    let plan = MemoryPlan {
        kernel_addr,
        kernel_size,
        ramdisk_addr: addrs.ramdisk,
        ramdisk_size,
        ramdisk_end: addrs.ramdisk_end,
        device_tree_addr: addrs.device_tree,
        is_32bit: kernel.is_32bit(),
    };
    log_debug(
        "layout",
        &alloc::format!(
            "kernel {:#x}+{:#x} dt {:#x} ramdisk {:#x}+{:#x} (end {:#x})",
            plan.kernel_addr,
            plan.kernel_size,
            plan.device_tree_addr,
            plan.ramdisk_addr,
            plan.ramdisk_size,
            plan.ramdisk_end
        ),
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootimg::Region;
    use alloc::vec;

    fn layout_with_ramdisk(ramdisk: u32) -> BootImageLayout {
        BootImageLayout {
            page_size: 4096,
            kernel: Region { offset: 4096, size: 5000, actual: 8192 },
            ramdisk: Region { offset: 12288, size: ramdisk, actual: 4096 },
            second: Region::default(),
            device_tree: Region::default(),
            image_size: 16384,
        }
    }

    fn arm64(image_size: u64) -> KernelImage {
        KernelImage::from_parts(vec![0u8; 5000], false, None, 0..0, image_size)
    }

    fn arm32(len: usize) -> KernelImage {
        KernelImage::from_parts(vec![0u8; len], true, None, 0..0, len as u64)
    }

    fn disjoint(a: &Range<u64>, b: &Range<u64>) -> bool {
        a.end <= b.start || b.end <= a.start
    }

    #[test]
    fn or_placement_not_addition() {
        let cfg = AddressConfig::default();
        let a = LoadAddresses::derive(0x8000_0000, &cfg).unwrap();
        assert_eq!(a.kernel, 0x8008_0000);
        // base bits already set in the offset do not carry
        let a = LoadAddresses::derive(0x0008_0000, &cfg).unwrap();
        assert_eq!(a.kernel, 0x0008_0000);
    }

    #[test]
    fn ramdisk_window_too_small() {
        let cfg = AddressConfig { ramdisk: 0x0220_0000, ramdisk_end: 0x0220_0005, ..Default::default() };
        let e = plan(&layout_with_ramdisk(10), &arm64(5000), 0x8000_0000, &cfg).unwrap_err();
        assert_eq!(e, BootError::LayoutOverflow("ramdisk exceeds reserved window"));
    }

    #[test]
    fn ramdisk_exact_fit() {
        let cfg = AddressConfig { ramdisk: 0x0220_0000, ramdisk_end: 0x0220_000a, ..Default::default() };
        assert!(plan(&layout_with_ramdisk(10), &arm64(5000), 0x8000_0000, &cfg).is_ok());
    }

    #[test]
    fn arm32_uses_32bit_address_and_bound() {
        let cfg = AddressConfig::default();
        let p = plan(&layout_with_ramdisk(10), &arm32(5000), 0x8000_0000, &cfg).unwrap();
        assert!(p.is_32bit);
        assert_eq!(p.kernel_addr, 0x8000_8000);
        assert_eq!(p.kernel_size, 8192);

        let tight = AddressConfig { kernel_32: 0x01ff_f000, ..Default::default() };
        let e = plan(&layout_with_ramdisk(10), &arm32(5000), 0x8000_0000, &tight).unwrap_err();
        assert_eq!(e, BootError::LayoutOverflow("32-bit kernel overruns device tree"));
    }

    #[test]
    fn unordered_windows_rejected() {
        let cfg = AddressConfig { device_tree: 0x0300_0000, ..Default::default() };
        assert!(matches!(
            LoadAddresses::derive(0, &cfg),
            Err(BootError::LayoutOverflow(_))
        ));
    }

    #[test]
    fn plans_are_disjoint() {
        let cfg = AddressConfig::default();
        for base in [0u64, 0x4000_0000, 0x8000_0000, 0x1_0000_0000] {
            for k in [arm32(5000), arm64(0x10_0000)] {
                let p = plan(&layout_with_ramdisk(0x1000), &k, base, &cfg).unwrap();
                let dt = p.device_tree_window();
                assert!(disjoint(&p.kernel_region(), &dt));
                assert!(disjoint(&p.kernel_region(), &p.ramdisk_region()));
                assert!(disjoint(&dt, &p.ramdisk_region()));
                assert!(p.ramdisk_region().end <= p.ramdisk_end);
            }
        }
    }

    #[test]
    fn device_tree_bound() {
        let a = LoadAddresses::derive(0, &AddressConfig::default()).unwrap();
        assert!(check_device_tree_fits(&a, 0x20_0000).is_ok());
        assert!(check_device_tree_fits(&a, 0x20_0001).is_err());
    }
}
