//! cmdline.rs — final kernel command line
//!
//! Field order is fixed:
//!    1. image cmdline
//!    2. verified boot state / verity mode / verifier fragment
//!    3. androidboot.bootdevice
//!    4. androidboot.serialno
//!    5. ffbm mode | charger pause | alarm boot   (first one set wins)
//!    6. androidboot.baseband (lower-cased)
//!    7. display panel configuration
//!    8. mdtp
//!    9. androidboot.slot_suffix
//!   10. skip_initramfs, rootwait ro init=/init, root=<system path>
//!   11. androidboot.dtbo_idx
//!
//! The byte length is summed field by field before anything is allocated;
//! the writer then refuses to go past that figure.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write as _;

use crate::arith::add_usize;
use crate::error::{BootError, BootResult};
use crate::logger::log_info;
use crate::verify::TrustState;

const VERIFIED_STATE: &str = " androidboot.verifiedbootstate=";
const VERITY_MODE: &str = " androidboot.veritymode=";
const BOOT_DEVICE: &str = " androidboot.bootdevice=";
const SERIAL_NO: &str = " androidboot.serialno=";
const BOOT_MODE: &str = " androidboot.mode=";
const QUIET: &str = " quiet";
const CHARGER: &str = " androidboot.mode=charger";
const ALARM_BOOT: &str = " androidboot.alarmboot=true";
const BASEBAND: &str = " androidboot.baseband=";
const MDTP: &str = " mdtp";
const SLOT_SUFFIX: &str = " androidboot.slot_suffix=";
const SKIP_INITRAMFS: &str = " skip_initramfs";
const ROOT_INIT: &str = " rootwait ro init=/init";
const DTBO_IDX: &str = " androidboot.dtbo_idx=";

const LUN_LETTERS: [char; 8] = ['a', 'b', 'c', 'd', 'e', 'f', 'g', 'h'];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerityMode {
    Logging,
    Enforcing,
}

impl VerityMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VerityMode::Logging => "logging",
            VerityMode::Enforcing => "enforcing",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifiedBootField {
    pub state: TrustState,
    pub verity: Option<VerityMode>,
    /// Verbatim text supplied by the verifier (leading space included).
    pub fragment: String,
}

/// Where the system partition lives, for `root=`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemPath {
    /// eMMC, zero-based partition index.
    Emmc { index: u32 },
    /// UFS, logical unit plus one-based partition number within it.
    Ufs { lun: u8, partition: u32 },
}

impl SystemPath {
    pub fn render(&self) -> BootResult<String> {
        let mut s = String::new();
        match *self {
            SystemPath::Emmc { index } => {
                let n = index
                    .checked_add(1)
                    .ok_or(BootError::IntegerOverflow("system partition index"))?;
                let _ = write!(s, " root=/dev/mmcblk0p{}", n);
            }
            SystemPath::Ufs { lun, partition } => {
                let letter = LUN_LETTERS
                    .get(lun as usize)
                    .ok_or(BootError::InvalidFormat("ufs lun out of range"))?;
                let _ = write!(s, " root=/dev/sd{}{}", letter, partition);
            }
        }
        Ok(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootClause {
    /// Not booting recovery: the kernel must not unpack the ramdisk.
    pub skip_initramfs: bool,
    pub system_path: SystemPath,
}

/// Every optional field the builder knows about. `None`/`false` omits it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderedFieldSet {
    pub verified_boot: Option<VerifiedBootField>,
    pub boot_device: Option<String>,
    pub serial_no: Option<String>,
    pub ffbm_mode: Option<String>,
    pub charger_pause: bool,
    pub alarm_boot: bool,
    pub baseband: Option<String>,
    pub display_panel: Option<String>,
    pub mdtp_active: bool,
    pub slot_suffix: Option<String>,
    pub root: Option<RootClause>,
    pub dtbo_index: Option<usize>,
}

/// NUL-terminated command line of known capacity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalCommandLine {
    buf: Vec<u8>,
    capacity: usize,
}

impl FinalCommandLine {
    /// Text without the terminator.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.buf.len() - 1]
    }

    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    /// Precomputed size, terminator included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Writer {
    buf: Vec<u8>,
    capacity: usize,
}

impl Writer {
    fn push(&mut self, s: &[u8]) -> BootResult<()> {
        // one byte stays reserved for the terminator
        if self.buf.len() + s.len() + 1 > self.capacity {
            return Err(BootError::BuildInconsistency("cmdline field exceeds precomputed length"));
        }
        self.buf.extend_from_slice(s);
        Ok(())
    }

    fn push_lower(&mut self, s: &[u8]) -> BootResult<()> {
        let start = self.buf.len();
        self.push(s)?;
        self.buf[start..].make_ascii_lowercase();
        Ok(())
    }
}

fn boot_mode_len(f: &OrderedFieldSet) -> usize {
    if let Some(m) = &f.ffbm_mode {
        BOOT_MODE.len() + m.len() + QUIET.len()
    } else if f.charger_pause {
        CHARGER.len()
    } else if f.alarm_boot {
        ALARM_BOOT.len()
    } else {
        0
    }
}

fn decimal_len(mut v: usize) -> usize {
    let mut n = 1;
    while v >= 10 {
        v /= 10;
        n += 1;
    }
    n
}

/// Bytes `build` will write, terminator included.
pub fn required_len(base: &[u8], f: &OrderedFieldSet, system_path: Option<&str>) -> BootResult<usize> {
    let mut parts: Vec<usize> = Vec::new();
    parts.push(base.len());
    if let Some(vb) = &f.verified_boot {
        parts.push(VERIFIED_STATE.len() + vb.state.as_str().len());
        if let Some(v) = vb.verity {
            parts.push(VERITY_MODE.len() + v.as_str().len());
        }
        parts.push(vb.fragment.len());
    }
    if let Some(d) = &f.boot_device {
        parts.push(BOOT_DEVICE.len() + d.len());
    }
    if let Some(s) = &f.serial_no {
        parts.push(SERIAL_NO.len() + s.len());
    }
    parts.push(boot_mode_len(f));
    if let Some(b) = &f.baseband {
        parts.push(BASEBAND.len() + b.len());
    }
    if let Some(d) = &f.display_panel {
        parts.push(d.len());
    }
    if f.mdtp_active {
        parts.push(MDTP.len());
    }
    if let Some(s) = &f.slot_suffix {
        parts.push(SLOT_SUFFIX.len() + s.len());
    }
    if let Some(r) = &f.root {
        if r.skip_initramfs {
            parts.push(SKIP_INITRAMFS.len());
        }
        parts.push(ROOT_INIT.len());
        parts.push(system_path.map_or(0, str::len));
    }
    if let Some(i) = f.dtbo_index {
        parts.push(DTBO_IDX.len() + decimal_len(i));
    }
    parts.push(1);
    parts.iter().try_fold(0usize, |acc, &p| add_usize(acc, p, "cmdline length"))
}

pub fn build(base: &[u8], f: &OrderedFieldSet) -> BootResult<FinalCommandLine> {
    let system_path = f.root.as_ref().map(|r| r.system_path.render()).transpose()?;
    let capacity = required_len(base, f, system_path.as_deref())?;

    let mut buf = Vec::new();
    buf.try_reserve_exact(capacity)
        .map_err(|_| BootError::OutOfMemory("cmdline"))?;
    let mut w = Writer { buf, capacity };

    w.push(base)?;
    if let Some(vb) = &f.verified_boot {
        w.push(VERIFIED_STATE.as_bytes())?;
        w.push(vb.state.as_str().as_bytes())?;
        if let Some(v) = vb.verity {
            w.push(VERITY_MODE.as_bytes())?;
            w.push(v.as_str().as_bytes())?;
        }
        w.push(vb.fragment.as_bytes())?;
    }
    if let Some(d) = &f.boot_device {
        w.push(BOOT_DEVICE.as_bytes())?;
        w.push(d.as_bytes())?;
    }
    if let Some(s) = &f.serial_no {
        w.push(SERIAL_NO.as_bytes())?;
        w.push(s.as_bytes())?;
    }
    if let Some(m) = &f.ffbm_mode {
        w.push(BOOT_MODE.as_bytes())?;
        w.push(m.as_bytes())?;
        w.push(QUIET.as_bytes())?;
    } else if f.charger_pause {
        w.push(CHARGER.as_bytes())?;
    } else if f.alarm_boot {
        w.push(ALARM_BOOT.as_bytes())?;
    }
    if let Some(b) = &f.baseband {
        w.push(BASEBAND.as_bytes())?;
        w.push_lower(b.as_bytes())?;
    }
    if let Some(d) = &f.display_panel {
        w.push(d.as_bytes())?;
    }
    if f.mdtp_active {
        w.push(MDTP.as_bytes())?;
    }
    if let Some(s) = &f.slot_suffix {
        w.push(SLOT_SUFFIX.as_bytes())?;
        w.push(s.as_bytes())?;
    }
    if let Some(r) = &f.root {
        if r.skip_initramfs {
            w.push(SKIP_INITRAMFS.as_bytes())?;
        }
        w.push(ROOT_INIT.as_bytes())?;
        if let Some(p) = &system_path {
            w.push(p.as_bytes())?;
        }
    }
    if let Some(i) = f.dtbo_index {
        let mut s = String::new();
        let _ = write!(s, "{}", i);
        w.push(DTBO_IDX.as_bytes())?;
        w.push(s.as_bytes())?;
    }
    w.buf.push(0);

    let out = FinalCommandLine { buf: w.buf, capacity };
    log_info("cmdline", &alloc::format!("cmdline: {}", out.as_str()));
    Ok(out)
}
