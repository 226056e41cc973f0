//! Synthetic boot artefacts and mock firmware shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;

use miniz_oxide::deflate::compress_to_vec;
use nonos_abl::dtb::HardwareIdentity;
use nonos_abl::dtpatch::FdtPatcher;
use nonos_abl::fdt::{cells, str_value, DeviceTree};
use nonos_abl::kernel::crc32;
use nonos_abl::orchestrator::Collaborators;
use nonos_abl::platform::{
    BaseMemoryProvider, DtboSource, HardwareIdentityProvider, ImageSource, PhysicalMemory, RamRegion,
    TrustVerifier,
};
use nonos_abl::verify::{TrustState, TrustVerdict};
use nonos_abl::{BootError, BootResult};

pub const PAGE: u32 = 4096;
pub const RAM_BASE: u64 = 0x8000_0000;

const DT_TABLE_MAGIC: u32 = 0xd7b7_ab1e;

fn pad(n: usize) -> usize {
    let p = PAGE as usize;
    (n + p - 1) / p * p
}

/// v0 boot image: header page, then kernel, ramdisk and dt, page aligned.
pub fn boot_image(kernel: &[u8], ramdisk: &[u8], dt: &[u8], cmdline: &str) -> Vec<u8> {
    let p = PAGE as usize;
    let mut out = vec![0u8; p + pad(kernel.len()) + pad(ramdisk.len()) + pad(dt.len())];
    out[..8].copy_from_slice(b"ANDROID!");
    let le = |out: &mut Vec<u8>, at: usize, v: u32| out[at..at + 4].copy_from_slice(&v.to_le_bytes());
    le(&mut out, 8, kernel.len() as u32);
    le(&mut out, 16, ramdisk.len() as u32);
    le(&mut out, 36, PAGE);
    le(&mut out, 40, dt.len() as u32);
    out[48..48 + 8].copy_from_slice(b"synthetc");
    out[64..64 + cmdline.len()].copy_from_slice(cmdline.as_bytes());

    let mut at = p;
    out[at..at + kernel.len()].copy_from_slice(kernel);
    at += pad(kernel.len());
    out[at..at + ramdisk.len()].copy_from_slice(ramdisk);
    at += pad(ramdisk.len());
    out[at..at + dt.len()].copy_from_slice(dt);
    out
}

/// arm64 Image header with `ARM\x64` at 0x38 and image_size at 0x10.
pub fn arm64_kernel(len: usize) -> Vec<u8> {
    let mut k = vec![0u8; len];
    for (i, b) in k.iter_mut().enumerate().skip(0x40) {
        *b = (i % 251) as u8;
    }
    k[0x10..0x18].copy_from_slice(&(len as u64).to_le_bytes());
    k[0x38..0x3c].copy_from_slice(&0x644d_5241u32.to_le_bytes());
    k
}

/// Single gzip member around a raw deflate stream.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 3];
    out.extend_from_slice(&compress_to_vec(data, 6));
    out.extend_from_slice(&crc32(data).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out
}

/// Identity properties carried on a blob's root node.
#[derive(Clone, Default)]
pub struct Ids<'a> {
    pub msm: Option<&'a [u32]>,
    pub board: Option<&'a [u32]>,
    pub pmic: Option<&'a [u32]>,
}

fn set_ids(t: &mut DeviceTree, ids: &Ids<'_>) {
    if let Some(m) = ids.msm {
        t.root.set_prop("qcom,msm-id", cells(m));
    }
    if let Some(b) = ids.board {
        t.root.set_prop("qcom,board-id", cells(b));
    }
    if let Some(p) = ids.pmic {
        t.root.set_prop("qcom,pmic-id", cells(p));
    }
}

/// Board / SoC tree with the nodes the patcher needs.
pub fn board_dtb(model: &str, ids: Ids<'_>) -> Vec<u8> {
    let mut t = DeviceTree::new();
    t.root.set_prop("model", str_value(model));
    t.root.set_prop("#address-cells", cells(&[2]));
    t.root.set_prop("#size-cells", cells(&[2]));
    set_ids(&mut t, &ids);
    let mem = t.root.child_or_insert("memory");
    mem.set_prop("device_type", str_value("memory"));
    mem.set_prop("reg", cells(&[0, 0, 0, 0]));
    t.root.child_or_insert("chosen");
    t.root.child_or_insert("soc").set_prop("phandle", cells(&[1]));
    t.to_bytes().expect("serialize board dtb")
}

/// Overlay whose single fragment sets `board-name` on the root.
pub fn overlay_dtb(board_name: &str, ids: Ids<'_>) -> Vec<u8> {
    let mut t = DeviceTree::new();
    set_ids(&mut t, &ids);
    let frag = t.root.child_or_insert("fragment@0");
    frag.set_prop("target-path", str_value("/"));
    frag.child_or_insert("__overlay__").set_prop("board-name", str_value(board_name));
    t.to_bytes().expect("serialize overlay")
}

/// Android dt_table holding `blobs` in order.
pub fn dtbo_table(blobs: &[Vec<u8>]) -> Vec<u8> {
    let header = 32usize;
    let entry = 32usize;
    let mut at = header + entry * blobs.len();
    let mut entries = Vec::new();
    for (i, b) in blobs.iter().enumerate() {
        for v in [b.len() as u32, at as u32, i as u32, 0, 0, 0, 0, 0] {
            entries.extend_from_slice(&v.to_be_bytes());
        }
        at += b.len();
    }
    let mut out = Vec::new();
    for v in [
        DT_TABLE_MAGIC,
        at as u32,
        header as u32,
        entry as u32,
        blobs.len() as u32,
        header as u32,
        PAGE,
        0,
    ] {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out.extend_from_slice(&entries);
    for b in blobs {
        out.extend_from_slice(b);
    }
    out
}

pub fn board() -> HardwareIdentity {
    HardwareIdentity {
        platform_id: 0x100,
        soc_rev: 0x10000,
        foundry_id: 0,
        variant_id: 0x08,
        subtype: 0,
        pmic_rev: [0; 4],
        pmic_model: [0; 4],
    }
}

pub struct Partitions {
    pub images: HashMap<String, Vec<u8>>,
    pub requested: Vec<String>,
}

impl ImageSource for Partitions {
    fn load_partition(&mut self, name: &str) -> BootResult<Vec<u8>> {
        self.requested.push(name.to_string());
        self.images
            .get(name)
            .cloned()
            .ok_or(BootError::Collaborator("partition not found"))
    }
}

pub struct Verifier {
    pub verdict: TrustVerdict,
    /// Returned instead of a verdict when set.
    pub failure: Option<BootError>,
    pub calls: usize,
}

impl TrustVerifier for Verifier {
    fn verify(&mut self, _partition: &str, _image: &[u8]) -> BootResult<TrustVerdict> {
        self.calls += 1;
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self.verdict.clone()),
        }
    }
}

pub struct Board(pub HardwareIdentity);

impl HardwareIdentityProvider for Board {
    fn read_identity(&self) -> BootResult<HardwareIdentity> {
        Ok(self.0)
    }
}

/// DDR map; the second region sits above 4 GiB.
pub struct Ddr(pub Vec<RamRegion>);

impl Default for Ddr {
    fn default() -> Self {
        Ddr(vec![
            RamRegion { base: RAM_BASE, size: 0x3a80_0000 },
            RamRegion { base: 0x1_0000_0000, size: 0x8000_0000 },
        ])
    }
}

impl BaseMemoryProvider for Ddr {
    fn lowest_ram_base(&self) -> BootResult<u64> {
        Ok(RAM_BASE)
    }

    fn ram_regions(&self) -> BootResult<Vec<RamRegion>> {
        Ok(self.0.clone())
    }
}

pub struct Dtbo(pub Vec<u8>);

impl DtboSource for Dtbo {
    fn load_dtbo_partition(&mut self) -> BootResult<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// Records every physical write.
#[derive(Default)]
pub struct Memory {
    pub writes: Vec<(u64, Vec<u8>)>,
}

impl Memory {
    pub fn at(&self, addr: u64) -> Option<&[u8]> {
        self.writes.iter().find(|(a, _)| *a == addr).map(|(_, b)| b.as_slice())
    }
}

impl PhysicalMemory for Memory {
    fn write(&mut self, addr: u64, bytes: &[u8]) -> BootResult<()> {
        self.writes.push((addr, bytes.to_vec()));
        Ok(())
    }
}

/// One board's worth of mock firmware.
pub struct Firmware {
    pub partitions: Partitions,
    pub verifier: Verifier,
    pub board: Board,
    pub ddr: Ddr,
    pub dtbo: Option<Dtbo>,
    pub patcher: FdtPatcher,
    pub memory: Memory,
}

impl Firmware {
    pub fn new(partition: &str, image: Vec<u8>) -> Self {
        let mut images = HashMap::new();
        images.insert(partition.to_string(), image);
        Firmware {
            partitions: Partitions { images, requested: Vec::new() },
            verifier: Verifier {
                verdict: TrustVerdict {
                    state: TrustState::Green,
                    cmdline_fragment: String::new(),
                    continue_allowed: true,
                },
                failure: None,
                calls: 0,
            },
            board: Board(board()),
            ddr: Ddr::default(),
            dtbo: None,
            patcher: FdtPatcher,
            memory: Memory::default(),
        }
    }

    pub fn collaborators(&mut self) -> Collaborators<'_> {
        Collaborators {
            images: &mut self.partitions,
            verifier: &mut self.verifier,
            identity: &self.board,
            memory: &self.ddr,
            dtbo: self.dtbo.as_mut().map(|d| d as &mut dyn DtboSource),
            patcher: &mut self.patcher,
            phys: &mut self.memory,
        }
    }
}
