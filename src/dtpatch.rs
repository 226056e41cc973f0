//! dtpatch.rs — last edits to the selected device tree before hand-off
//!
//! The kernel learns about RAM, the ramdisk and its command line from the
//! tree, not from registers. [`FdtPatcher`] is the default
//! [`DtPatcher`](crate::platform::DtPatcher):
//!
//!   /memory                          reg, one (base, size) per RAM region
//!   /chosen                          bootargs, kaslr-seed, initrd bounds
//!   /reserved-memory/splash_region   reg, splash frame buffer
//!   /firmware/android/fstab/*        dev, rewritten to the boot device
//!   /cpus, /soc                      fused-off blocks disabled (partial goods)

use alloc::format;
use alloc::vec::Vec;

use crate::arith::add_u64;
use crate::cmdline::FinalCommandLine;
use crate::config::BootCapabilities;
use crate::error::{BootError, BootResult};
use crate::fdt::{str_value, DeviceTree, Node};
use crate::layout::MemoryPlan;
use crate::logger::{log_debug, log_info, log_warn};
use crate::platform::{DtPatcher, RamRegion};

pub const MEMORY_NODE: &str = "/memory";
pub const CHOSEN_NODE: &str = "/chosen";
pub const SPLASH_NODE: &str = "/reserved-memory/splash_region";
pub const FSTAB_NODE: &str = "/firmware/android/fstab";

const FSTAB_DEV_PROP: &str = "dev";
const FSTAB_DEVICE_PREFIX: &str = "/soc/";

/// `<0x0 addr 0x0 size>`
const SPLASH_REG_LEN: usize = 16;

/// How a fused-off node is hidden from the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disable {
    /// `status = "disabled"`
    Status,
    /// `device_type = "nak"`; CPU nodes are matched on device_type.
    DeviceType,
}

/// One bit of the partial-goods fuse mask and the nodes it removes.
#[derive(Clone, Copy, Debug)]
pub struct PartialGoodsEntry {
    pub mask: u32,
    pub parent: &'static str,
    pub nodes: &'static [&'static str],
    pub how: Disable,
}

pub const PARTIAL_GOODS_TABLE: &[PartialGoodsEntry] = &[
    PartialGoodsEntry {
        mask: 1 << 0,
        parent: "/cpus",
        nodes: &["cpu@400", "cpu@500", "cpu@600", "cpu@700"],
        how: Disable::DeviceType,
    },
    PartialGoodsEntry {
        mask: 1 << 1,
        parent: "/soc",
        nodes: &["qcom,kgsl-3d0", "qcom,kgsl-iommu", "qcom,gmu"],
        how: Disable::Status,
    },
    PartialGoodsEntry { mask: 1 << 2, parent: "/soc", nodes: &["qcom,vidc"], how: Disable::Status },
    PartialGoodsEntry {
        mask: 1 << 3,
        parent: "/soc",
        nodes: &["qcom,cam-cpas", "qcom,cam-isp"],
        how: Disable::Status,
    },
    PartialGoodsEntry { mask: 1 << 4, parent: "/soc", nodes: &["qcom,mdss_mdp"], how: Disable::Status },
];

/// Everything one patch call writes into the tree.
pub struct PatchRequest<'a> {
    pub cmdline: &'a FinalCommandLine,
    pub plan: &'a MemoryPlan,
    pub ram: &'a [RamRegion],
    pub kaslr_seed: Option<u64>,
    /// Splash frame buffer (address, size).
    pub splash: Option<(u64, u64)>,
    /// Boot storage controller, e.g. `1d84000.ufshc`.
    pub boot_device: Option<&'a str>,
    /// Partial-goods fuse mask, one bit per [`PARTIAL_GOODS_TABLE`] entry.
    pub disabled_subsystems: u32,
    pub capabilities: BootCapabilities,
}

/// Builds `/memory` `reg` across several writes: the first pair replaces
/// whatever the tree carried, later pairs append.
#[derive(Debug)]
pub struct RegAccumulator {
    wide: bool,
    written: usize,
}

impl RegAccumulator {
    /// `wide` selects two cells per value (64-bit kernels).
    pub fn new(wide: bool) -> Self {
        Self { wide, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn push(&mut self, node: &mut Node, region: RamRegion) -> BootResult<()> {
        let mut pair = Vec::with_capacity(16);
        self.encode(&mut pair, region.base)?;
        self.encode(&mut pair, region.size)?;
        if self.written == 0 {
            node.set_prop("reg", pair);
        } else {
            node.append_prop("reg", &pair);
        }
        self.written += 1;
        Ok(())
    }

    fn encode(&self, out: &mut Vec<u8>, v: u64) -> BootResult<()> {
        if self.wide {
            out.extend_from_slice(&v.to_be_bytes());
        } else {
            let narrow = u32::try_from(v).map_err(|_| BootError::IntegerOverflow("32-bit memory cell"))?;
            out.extend_from_slice(&narrow.to_be_bytes());
        }
        Ok(())
    }
}

/// Default tree patcher: parse, edit in place, re-serialize.
#[derive(Debug, Default, Clone, Copy)]
pub struct FdtPatcher;

impl DtPatcher for FdtPatcher {
    fn patch(&mut self, blob: &[u8], req: &PatchRequest<'_>) -> BootResult<Vec<u8>> {
        let mut tree = DeviceTree::parse(blob)?;
        patch_tree(&mut tree, req)?;
        let out = tree.to_bytes()?;
        log_debug("dtpatch", &format!("patched tree {:#x} -> {:#x} bytes", blob.len(), out.len()));
        Ok(out)
    }
}

pub fn patch_tree(tree: &mut DeviceTree, req: &PatchRequest<'_>) -> BootResult<()> {
    update_memory(tree, req.ram, !req.plan.is_32bit)?;

    if req.capabilities.contains(BootCapabilities::SPLASH_UPDATE) {
        if let Some((addr, size)) = req.splash {
            update_splash(tree, addr, size)?;
        }
    }

    update_chosen(tree, req)?;

    if req.capabilities.contains(BootCapabilities::FSTAB_UPDATE) {
        if let Some(dev) = req.boot_device {
            update_fstab(tree, dev);
        }
    }

    if req.capabilities.contains(BootCapabilities::PARTIAL_GOODS) && req.disabled_subsystems != 0 {
        disable_partial_goods(tree, req.disabled_subsystems, PARTIAL_GOODS_TABLE);
    }
    Ok(())
}

/// Hide every node the fuse mask marks as absent. A table entry naming a
/// node this board's tree lacks is skipped. Returns the nodes touched.
pub fn disable_partial_goods(tree: &mut DeviceTree, mask: u32, table: &[PartialGoodsEntry]) -> usize {
    let mut touched = 0;
    for entry in table.iter().filter(|e| mask & e.mask != 0) {
        let Some(parent) = tree.node_mut(entry.parent) else {
            log_debug("dtpatch", &format!("partial goods: no {} node", entry.parent));
            continue;
        };
        for &name in entry.nodes {
            let Some(node) = parent.child_mut(name) else {
                log_debug("dtpatch", &format!("partial goods: no {}/{}", entry.parent, name));
                continue;
            };
            match entry.how {
                Disable::Status => node.set_prop("status", str_value("disabled")),
                Disable::DeviceType => node.set_prop("device_type", str_value("nak")),
            }
            touched += 1;
        }
    }
    log_info("dtpatch", &format!("partial goods mask {:#x}: {} node(s) disabled", mask, touched));
    touched
}

fn update_memory(tree: &mut DeviceTree, ram: &[RamRegion], wide: bool) -> BootResult<()> {
    if ram.is_empty() {
        return Err(BootError::Collaborator("no ram regions reported"));
    }
    let node = tree
        .node_mut(MEMORY_NODE)
        .ok_or(BootError::InvalidFormat("device tree has no /memory node"))?;
    let mut acc = RegAccumulator::new(wide);
    for &r in ram {
        acc.push(node, r)?;
    }
    log_debug("dtpatch", &format!("/memory: {} region(s)", acc.written()));
    Ok(())
}

fn update_chosen(tree: &mut DeviceTree, req: &PatchRequest<'_>) -> BootResult<()> {
    let chosen = tree
        .node_mut(CHOSEN_NODE)
        .ok_or(BootError::InvalidFormat("device tree has no /chosen node"))?;

    chosen.set_prop("bootargs", req.cmdline.as_bytes_with_nul().to_vec());

    if req.capabilities.contains(BootCapabilities::KASLR_SEED) {
        match req.kaslr_seed {
            Some(seed) => chosen.set_prop("kaslr-seed", seed.to_be_bytes().to_vec()),
            None => log_warn("dtpatch", "no kaslr seed available"),
        }
    }

    if req.plan.ramdisk_size != 0 {
        let start = req.plan.ramdisk_addr;
        let end = add_u64(start, req.plan.ramdisk_size, "initrd end")?;
        chosen.set_prop("linux,initrd-start", start.to_be_bytes().to_vec());
        chosen.set_prop("linux,initrd-end", end.to_be_bytes().to_vec());
    }
    Ok(())
}

fn update_splash(tree: &mut DeviceTree, addr: u64, size: u64) -> BootResult<()> {
    let Some(node) = tree.node_mut(SPLASH_NODE) else {
        log_warn("dtpatch", "no splash_region node, splash not reserved");
        return Ok(());
    };
    let Some(reg) = node.prop_mut("reg") else {
        log_warn("dtpatch", "splash_region has no reg");
        return Ok(());
    };
    if reg.len() != SPLASH_REG_LEN {
        return Err(BootError::InvalidFormat("splash_region reg is not four cells"));
    }
    let addr = u32::try_from(addr).map_err(|_| BootError::IntegerOverflow("splash address"))?;
    let size = u32::try_from(size).map_err(|_| BootError::IntegerOverflow("splash size"))?;
    reg[4..8].copy_from_slice(&addr.to_be_bytes());
    reg[12..16].copy_from_slice(&size.to_be_bytes());
    log_debug("dtpatch", &format!("splash at {:#x}, {:#x} bytes", addr, size));
    Ok(())
}

/// Rewrite the controller segment after `/soc/` in every fstab entry.
/// The property keeps its length: a shorter device name is followed by
/// the rest of the path and then space padding.
fn update_fstab(tree: &mut DeviceTree, boot_device: &str) {
    let Some(parent) = tree.node_mut(FSTAB_NODE) else {
        log_debug("dtpatch", "no fstab node");
        return;
    };
    for entry in &mut parent.children {
        let Some(dev) = entry.prop_mut(FSTAB_DEV_PROP) else {
            continue;
        };
        match rewrite_dev_path(dev, boot_device.as_bytes()) {
            Ok(()) => log_debug("dtpatch", &format!("fstab {} -> {}", entry.name, boot_device)),
            Err(why) => log_warn("dtpatch", &format!("fstab {} left as is: {}", entry.name, why)),
        }
    }
    log_info("dtpatch", &format!("fstab boot device {}", boot_device));
}

fn rewrite_dev_path(value: &mut [u8], device: &[u8]) -> Result<(), &'static str> {
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    let text = &value[..end];
    let prefix = FSTAB_DEVICE_PREFIX.as_bytes();
    let seg_start = text
        .windows(prefix.len())
        .position(|w| w == prefix)
        .map(|p| p + prefix.len())
        .ok_or("no /soc/ component")?;
    let seg_len = text
        .get(seg_start + 1..)
        .and_then(|rest| rest.iter().position(|&b| b == b'/'))
        .map(|p| p + 1)
        .ok_or("no path after device")?;
    if seg_len < device.len() {
        return Err("device name longer than the existing one");
    }

    let tail: Vec<u8> = text[seg_start + seg_len..].to_vec();
    let mut at = seg_start;
    value[at..at + device.len()].copy_from_slice(device);
    at += device.len();
    value[at..at + tail.len()].copy_from_slice(&tail);
    at += tail.len();
    for b in &mut value[at..end] {
        *b = b' ';
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::{build, OrderedFieldSet};
    use crate::fdt::cells;
    use alloc::vec;
    use pretty_assertions::assert_eq;

    const UFS_DEV: &str = "/dev/block/platform/soc/1d84000.ufshc/by-name/system";

    fn tree() -> DeviceTree {
        let mut t = DeviceTree::new();
        t.root.child_or_insert("memory").set_prop("reg", cells(&[0, 0, 0, 0]));
        t.root.child_or_insert("chosen").set_prop("bootargs", str_value("stale"));
        t.root
            .child_or_insert("reserved-memory")
            .child_or_insert("splash_region@9c000000")
            .set_prop("reg", cells(&[0, 0x9c00_0000, 0, 0x0230_0000]));
        t.root
            .child_or_insert("firmware")
            .child_or_insert("android")
            .child_or_insert("fstab")
            .child_or_insert("system")
            .set_prop("dev", str_value(UFS_DEV));
        t
    }

    fn plan(is_32bit: bool, ramdisk_size: u64) -> MemoryPlan {
        MemoryPlan {
            kernel_addr: 0x8008_0000,
            kernel_size: 0x1000,
            ramdisk_addr: 0x8220_0000,
            ramdisk_size,
            ramdisk_end: 0x8400_0000,
            device_tree_addr: 0x8200_0000,
            is_32bit,
        }
    }

    const RAM: [RamRegion; 2] = [
        RamRegion { base: 0x8000_0000, size: 0x3a80_0000 },
        RamRegion { base: 0x1_0000_0000, size: 0x8000_0000 },
    ];

    fn request<'a>(cmd: &'a FinalCommandLine, plan: &'a MemoryPlan, caps: BootCapabilities) -> PatchRequest<'a> {
        PatchRequest {
            cmdline: cmd,
            plan,
            ram: &RAM,
            kaslr_seed: Some(0x1122_3344_5566_7788),
            splash: Some((0x9d00_0000, 0x0100_0000)),
            boot_device: Some("1d84000.ufshc"),
            disabled_subsystems: 0,
            capabilities: caps,
        }
    }

    #[test]
    fn accumulator_replaces_then_appends() {
        let mut node = Node::new("memory");
        node.set_prop("reg", cells(&[9, 9]));
        let mut acc = RegAccumulator::new(false);
        acc.push(&mut node, RamRegion { base: 0x8000_0000, size: 0x1000 }).unwrap();
        assert_eq!(node.prop("reg").unwrap(), &cells(&[0x8000_0000, 0x1000])[..]);
        acc.push(&mut node, RamRegion { base: 0x9000_0000, size: 0x2000 }).unwrap();
        assert_eq!(
            node.prop("reg").unwrap(),
            &cells(&[0x8000_0000, 0x1000, 0x9000_0000, 0x2000])[..]
        );

        // A second accumulator starts over.
        let mut fresh = RegAccumulator::new(false);
        fresh.push(&mut node, RamRegion { base: 1, size: 2 }).unwrap();
        assert_eq!(node.prop("reg").unwrap(), &cells(&[1, 2])[..]);
    }

    #[test]
    fn narrow_cells_reject_high_memory() {
        let mut node = Node::new("memory");
        let mut acc = RegAccumulator::new(false);
        let e = acc.push(&mut node, RAM[1]).unwrap_err();
        assert_eq!(e, BootError::IntegerOverflow("32-bit memory cell"));
    }

    #[test]
    fn chosen_and_memory_patched() {
        let cmd = build(b"console=ttyMSM0", &OrderedFieldSet::default()).unwrap();
        let p = plan(false, 0x200);
        let req = request(&cmd, &p, BootCapabilities::KASLR_SEED);
        let mut t = tree();
        patch_tree(&mut t, &req).unwrap();

        let mem = t.node("/memory").unwrap();
        assert_eq!(
            mem.prop("reg").unwrap(),
            &cells(&[0, 0x8000_0000, 0, 0x3a80_0000, 1, 0, 0, 0x8000_0000])[..]
        );
        let chosen = t.node("/chosen").unwrap();
        assert_eq!(chosen.prop_str("bootargs"), Some("console=ttyMSM0"));
        assert_eq!(chosen.prop("kaslr-seed").unwrap(), &0x1122_3344_5566_7788u64.to_be_bytes()[..]);
        assert_eq!(chosen.prop("linux,initrd-start").unwrap(), &0x8220_0000u64.to_be_bytes()[..]);
        assert_eq!(chosen.prop("linux,initrd-end").unwrap(), &0x8220_0200u64.to_be_bytes()[..]);

        // Capabilities off: splash and fstab untouched.
        assert_eq!(
            t.node(SPLASH_NODE).unwrap().prop("reg").unwrap(),
            &cells(&[0, 0x9c00_0000, 0, 0x0230_0000])[..]
        );
        assert_eq!(t.node("/firmware/android/fstab/system").unwrap().prop_str("dev"), Some(UFS_DEV));
    }

    #[test]
    fn no_ramdisk_no_initrd_and_no_seed_without_capability() {
        let cmd = build(b"", &OrderedFieldSet::default()).unwrap();
        let p = plan(false, 0);
        let req = request(&cmd, &p, BootCapabilities::empty());
        let mut t = tree();
        patch_tree(&mut t, &req).unwrap();
        let chosen = t.node("/chosen").unwrap();
        assert!(chosen.prop("linux,initrd-start").is_none());
        assert!(chosen.prop("kaslr-seed").is_none());
    }

    #[test]
    fn missing_nodes_are_errors() {
        let cmd = build(b"", &OrderedFieldSet::default()).unwrap();
        let p = plan(false, 0);
        let req = request(&cmd, &p, BootCapabilities::empty());

        let mut t = tree();
        t.root.children.retain(|c| c.name != "memory");
        assert_eq!(
            patch_tree(&mut t, &req).unwrap_err(),
            BootError::InvalidFormat("device tree has no /memory node")
        );

        let mut t = tree();
        t.root.children.retain(|c| c.name != "chosen");
        assert_eq!(
            patch_tree(&mut t, &req).unwrap_err(),
            BootError::InvalidFormat("device tree has no /chosen node")
        );
    }

    #[test]
    fn splash_and_fstab_updated_when_enabled() {
        let cmd = build(b"", &OrderedFieldSet::default()).unwrap();
        let p = plan(false, 0);
        let caps = BootCapabilities::SPLASH_UPDATE | BootCapabilities::FSTAB_UPDATE;
        let mut req = request(&cmd, &p, caps);
        req.ram = &RAM[..1];
        req.boot_device = Some("msm_sdcc.1");
        let mut t = tree();
        patch_tree(&mut t, &req).unwrap();

        assert_eq!(
            t.node(SPLASH_NODE).unwrap().prop("reg").unwrap(),
            &cells(&[0, 0x9d00_0000, 0, 0x0100_0000])[..]
        );
        let dev = t.node("/firmware/android/fstab/system").unwrap().prop("dev").unwrap();
        assert_eq!(dev.len(), UFS_DEV.len() + 1);
        assert_eq!(
            core::str::from_utf8(&dev[..dev.len() - 1]).unwrap(),
            "/dev/block/platform/soc/msm_sdcc.1/by-name/system   "
        );
    }

    #[test]
    fn splash_reg_length_checked() {
        let cmd = build(b"", &OrderedFieldSet::default()).unwrap();
        let p = plan(false, 0);
        let mut req = request(&cmd, &p, BootCapabilities::SPLASH_UPDATE);
        req.ram = &RAM[..1];
        let mut t = tree();
        t.node_mut(SPLASH_NODE).unwrap().set_prop("reg", cells(&[0x9c00_0000, 0x100]));
        assert_eq!(
            patch_tree(&mut t, &req).unwrap_err(),
            BootError::InvalidFormat("splash_region reg is not four cells")
        );
    }

    #[test]
    fn stale_bootargs_replaced_not_appended() {
        let cmd = build(b"console=ttyMSM0", &OrderedFieldSet::default()).unwrap();
        let p = plan(false, 0);
        let mut req = request(&cmd, &p, BootCapabilities::empty());
        req.ram = &RAM[..1];
        let mut t = tree();
        assert_eq!(t.node("/chosen").unwrap().prop_str("bootargs"), Some("stale"));
        patch_tree(&mut t, &req).unwrap();

        let raw = t.node("/chosen").unwrap().prop("bootargs").unwrap();
        assert_eq!(raw, b"console=ttyMSM0\0");
        assert!(!raw.windows(5).any(|w| w == b"stale"));
    }

    fn soc_tree() -> DeviceTree {
        let mut t = tree();
        let cpus = t.root.child_or_insert("cpus");
        for name in ["cpu@0", "cpu@100", "cpu@400", "cpu@500"] {
            cpus.child_or_insert(name).set_prop("device_type", str_value("cpu"));
        }
        let soc = t.root.child_or_insert("soc");
        soc.child_or_insert("qcom,kgsl-3d0@5000000").set_prop("status", str_value("okay"));
        soc.child_or_insert("qcom,vidc@aa00000").set_prop("status", str_value("okay"));
        t
    }

    #[test]
    fn partial_goods_disables_fused_blocks() {
        let mut t = soc_tree();
        // gold cluster and gpu; the gpu smmu and gmu are absent here
        let n = disable_partial_goods(&mut t, 0b11, PARTIAL_GOODS_TABLE);
        assert_eq!(n, 3);

        let cpus = t.node("/cpus").unwrap();
        assert_eq!(cpus.child("cpu@0").unwrap().prop_str("device_type"), Some("cpu"));
        assert_eq!(cpus.child("cpu@400").unwrap().prop_str("device_type"), Some("nak"));
        assert_eq!(cpus.child("cpu@500").unwrap().prop_str("device_type"), Some("nak"));
        assert_eq!(t.node("/soc/qcom,kgsl-3d0").unwrap().prop_str("status"), Some("disabled"));
        assert_eq!(t.node("/soc/qcom,vidc").unwrap().prop_str("status"), Some("okay"));
    }

    #[test]
    fn partial_goods_needs_capability_and_mask() {
        let cmd = build(b"", &OrderedFieldSet::default()).unwrap();
        let p = plan(false, 0);
        let mut req = request(&cmd, &p, BootCapabilities::empty());
        req.ram = &RAM[..1];
        req.disabled_subsystems = 1 << 2;

        let mut t = soc_tree();
        patch_tree(&mut t, &req).unwrap();
        assert_eq!(t.node("/soc/qcom,vidc").unwrap().prop_str("status"), Some("okay"));

        req.capabilities = BootCapabilities::PARTIAL_GOODS;
        patch_tree(&mut t, &req).unwrap();
        assert_eq!(t.node("/soc/qcom,vidc").unwrap().prop_str("status"), Some("disabled"));
        assert_eq!(t.node("/soc/qcom,kgsl-3d0").unwrap().prop_str("status"), Some("okay"));
    }

    #[test]
    fn longer_device_name_leaves_fstab_alone() {
        let mut v = str_value("/dev/block/platform/soc/abc/by-name/system");
        let before = v.clone();
        assert!(rewrite_dev_path(&mut v, b"1d84000.ufshc").is_err());
        assert_eq!(v, before);

        let mut v = vec![b'x'; 4];
        assert!(rewrite_dev_path(&mut v, b"a").is_err());
    }

    #[test]
    fn patcher_round_trips_through_bytes() {
        let cmd = build(b"quiet", &OrderedFieldSet::default()).unwrap();
        let p = plan(true, 0x100);
        let mut req = request(&cmd, &p, BootCapabilities::empty());
        req.ram = &RAM[..1];
        let out = FdtPatcher.patch(&tree().to_bytes().unwrap(), &req).unwrap();
        let t = DeviceTree::parse(&out).unwrap();
        assert_eq!(t.node("/memory").unwrap().prop("reg").unwrap(), &cells(&[0x8000_0000, 0x3a80_0000])[..]);
        assert_eq!(t.node("/chosen").unwrap().prop_str("bootargs"), Some("quiet"));
    }
}
