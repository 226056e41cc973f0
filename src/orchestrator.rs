//! orchestrator.rs — one boot attempt, start to hand-off
//!
//!   Start -> Validated -> Extracted -> DeviceTreeResolved -> LayoutPlanned
//!         -> CmdLineBuilt -> DeviceTreePatched -> Proceed
//!
//! Any failure stops the attempt where it happened and becomes
//! [`BootDecision::Abort`]. The trust gate sits between `Validated` and
//! `Extracted`, so an untrusted image is never decompressed. Nothing is
//! retried in here; [`resolve_fallback`] maps an abort onto the caller's
//! fallback policy.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::bootimg::BootImageValidator;
use crate::cmdline::{self, OrderedFieldSet, RootClause, VerifiedBootField};
use crate::config::{BootCapabilities, BootConfig, FallbackPolicy};
use crate::dtb::{DeviceTreeResolver, ResolvedDeviceTree};
use crate::dtpatch::PatchRequest;
use crate::error::{BootError, ErrorKind};
use crate::handoff::{BootModeFlags, KernelHandoff};
use crate::kernel;
use crate::layout::{self, LoadAddresses};
use crate::logger::{log_critical, log_debug, log_info, log_warn};
use crate::platform::{
    BaseMemoryProvider, BootRequest, DtPatcher, DtboSource, HardwareIdentityProvider, ImageSource,
    KernelEntry, PhysicalMemory, TrustVerifier,
};
use crate::verify::{self, TrustDecision, TrustState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootState {
    Start,
    Validated,
    Extracted,
    DeviceTreeResolved,
    LayoutPlanned,
    CmdLineBuilt,
    DeviceTreePatched,
    Proceed,
    RetryRecovery,
    FallbackToFastboot,
    Abort,
}

impl BootState {
    pub fn as_str(self) -> &'static str {
        match self {
            BootState::Start => "start",
            BootState::Validated => "validated",
            BootState::Extracted => "extracted",
            BootState::DeviceTreeResolved => "device-tree-resolved",
            BootState::LayoutPlanned => "layout-planned",
            BootState::CmdLineBuilt => "cmdline-built",
            BootState::DeviceTreePatched => "device-tree-patched",
            BootState::Proceed => "proceed",
            BootState::RetryRecovery => "retry-recovery",
            BootState::FallbackToFastboot => "fallback-fastboot",
            BootState::Abort => "abort",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BootState::Proceed | BootState::RetryRecovery | BootState::FallbackToFastboot | BootState::Abort
        )
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortCause {
    /// A pipeline stage or collaborator failed.
    Error(BootError),
    /// The trust gate refused the image.
    Untrusted { state: TrustState, reason: &'static str },
}

/// Why an attempt stopped, and the last state it reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootAbort {
    pub state: BootState,
    pub cause: AbortCause,
}

impl BootAbort {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self.cause {
            AbortCause::Error(e) => Some(e.kind()),
            AbortCause::Untrusted { .. } => None,
        }
    }

    /// RED: the device must power off rather than fall back.
    pub fn is_red(&self) -> bool {
        matches!(self.cause, AbortCause::Untrusted { state: TrustState::Red, .. })
    }
}

impl fmt::Display for BootAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cause {
            AbortCause::Error(e) => write!(f, "after {}: {}", self.state, e),
            AbortCause::Untrusted { state, reason } => {
                write!(f, "after {}: {} (boot state {})", self.state, reason, state.as_str())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootDecision {
    Proceed(KernelHandoff),
    RetryRecovery,
    FallbackToFastboot,
    Abort(BootAbort),
}

impl BootDecision {
    pub fn state(&self) -> BootState {
        match self {
            BootDecision::Proceed(_) => BootState::Proceed,
            BootDecision::RetryRecovery => BootState::RetryRecovery,
            BootDecision::FallbackToFastboot => BootState::FallbackToFastboot,
            BootDecision::Abort(_) => BootState::Abort,
        }
    }
}

impl fmt::Display for BootDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootDecision::Proceed(h) => write!(f, "proceed, entry {:#x}", h.kernel_entry),
            BootDecision::RetryRecovery => f.write_str("retry in recovery"),
            BootDecision::FallbackToFastboot => f.write_str("fall back to fastboot"),
            BootDecision::Abort(a) => write!(f, "abort {}", a),
        }
    }
}

/// The surrounding firmware, as seen by one attempt.
pub struct Collaborators<'a> {
    pub images: &'a mut dyn ImageSource,
    pub verifier: &'a mut dyn TrustVerifier,
    pub identity: &'a dyn HardwareIdentityProvider,
    pub memory: &'a dyn BaseMemoryProvider,
    /// Only consulted when the `DTBO` capability is set.
    pub dtbo: Option<&'a mut dyn DtboSource>,
    pub patcher: &'a mut dyn DtPatcher,
    pub phys: &'a mut dyn PhysicalMemory,
}

pub struct BootOrchestrator<'a> {
    config: BootConfig,
    io: Collaborators<'a>,
    state: BootState,
    history: Vec<BootState>,
}

fn abort_at(state: BootState) -> impl Fn(BootError) -> BootAbort {
    move |e| BootAbort { state, cause: AbortCause::Error(e) }
}

/// Trust gate outcome threaded into the command line and handoff flags.
struct Trust {
    state: TrustState,
    fragment: String,
}

impl<'a> BootOrchestrator<'a> {
    pub fn new(config: BootConfig, io: Collaborators<'a>) -> Self {
        Self { config, io, state: BootState::Start, history: Vec::new() }
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Every state entered by the last attempt, in order.
    pub fn history(&self) -> &[BootState] {
        &self.history
    }

    fn enter(&mut self, next: BootState) {
        log_info("orchestrator", &format!("{} -> {}", self.state, next));
        self.state = next;
        self.history.push(next);
    }

    /// Run one attempt. Transient buffers are released before this returns,
    /// whatever the outcome.
    pub fn attempt(&mut self, req: &BootRequest) -> BootDecision {
        self.state = BootState::Start;
        self.history.clear();
        self.history.push(BootState::Start);

        match self.run(req) {
            Ok(handoff) => {
                self.enter(BootState::Proceed);
                BootDecision::Proceed(handoff)
            }
            Err(abort) => {
                log_critical("orchestrator", &format!("boot attempt aborted {}", abort));
                self.enter(BootState::Abort);
                BootDecision::Abort(abort)
            }
        }
    }

    /// `attempt` followed by the configured fallback policy.
    pub fn decide(&mut self, req: &BootRequest) -> BootDecision {
        let decision = self.attempt(req);
        resolve_fallback(decision, self.config.fallback, req.recovery)
    }

    /// Irreversible: every collaborator borrow and buffer is dropped, then
    /// control goes to the kernel.
    pub fn launch(self, handoff: KernelHandoff, entry: &dyn KernelEntry) -> ! {
        log_info(
            "orchestrator",
            &format!(
                "entering kernel at {:#x}, dtb {:#x}, flags {:#x}",
                handoff.kernel_entry, handoff.device_tree, handoff.boot_flags
            ),
        );
        drop(self);
        entry.enter(&handoff)
    }

    fn partition_name(&self, req: &BootRequest) -> String {
        if self.config.has(BootCapabilities::MULTI_SLOT) {
            let mut name = String::from("boot");
            if let Some(s) = &req.metadata.slot_suffix {
                name.push_str(s);
            }
            name
        } else if req.recovery {
            String::from("recovery")
        } else {
            String::from("boot")
        }
    }

    fn run(&mut self, req: &BootRequest) -> Result<KernelHandoff, BootAbort> {
        self.config.validate().map_err(abort_at(self.state))?;
        let meta = &req.metadata;
        let partition = self.partition_name(req);
        log_info("orchestrator", &format!("loading {}", partition));

        let image = self.io.images.load_partition(&partition).map_err(abort_at(self.state))?;
        let validator = BootImageValidator::new(self.config.max_page_size, self.config.expected_page_size);
        let (header, img_layout) = validator.validate(&image).map_err(abort_at(self.state))?;
        img_layout.check_fits(image.len()).map_err(abort_at(self.state))?;
        self.enter(BootState::Validated);

        let trust = if self.config.has(BootCapabilities::VERIFIED_BOOT) {
            let verdict = self.io.verifier.verify(&partition, &image);
            match verify::evaluate(verdict, meta.unlocked) {
                TrustDecision::Continue { state, fragment } => Some(Trust { state, fragment }),
                TrustDecision::Abort { reason, state } => {
                    return Err(BootAbort { state: self.state, cause: AbortCause::Untrusted { state, reason } });
                }
            }
        } else {
            log_debug("orchestrator", "verified boot disabled, trust gate skipped");
            None
        };

        let hw = self.io.identity.read_identity().map_err(abort_at(self.state))?;
        let base = self.io.memory.lowest_ram_base().map_err(abort_at(self.state))?;
        let addrs = LoadAddresses::derive(base, &self.config.addresses).map_err(abort_at(self.state))?;
        let kern = kernel::extract(&image, &img_layout, &addrs).map_err(abort_at(self.state))?;
        self.enter(BootState::Extracted);

        let dtbo = if self.config.has(BootCapabilities::DTBO) {
            match self.io.dtbo.as_mut() {
                Some(src) => Some(src.load_dtbo_partition().map_err(abort_at(self.state))?),
                None => {
                    log_warn("orchestrator", "dtbo capability set but no dtbo source");
                    None
                }
            }
        } else {
            None
        };
        let resolved = DeviceTreeResolver::new(&hw, &addrs)
            .resolve(&image, &kern, &img_layout, dtbo.as_deref())
            .map_err(abort_at(self.state))?;
        drop(dtbo);
        self.enter(BootState::DeviceTreeResolved);

        let plan = layout::plan(&img_layout, &kern, base, &self.config.addresses).map_err(abort_at(self.state))?;
        self.enter(BootState::LayoutPlanned);

        let fields = self.fields(req, trust.as_ref(), &resolved);
        let cmd = cmdline::build(header.cmdline(), &fields).map_err(abort_at(self.state))?;
        self.enter(BootState::CmdLineBuilt);

        let ram = self.io.memory.ram_regions().map_err(abort_at(self.state))?;
        let patch_req = PatchRequest {
            cmdline: &cmd,
            plan: &plan,
            ram: &ram,
            kaslr_seed: meta.kaslr_seed,
            splash: meta.splash,
            boot_device: meta.boot_device.as_deref(),
            disabled_subsystems: meta.disabled_subsystems,
            capabilities: self.config.capabilities,
        };
        let patched = self.io.patcher.patch(&resolved.blob, &patch_req).map_err(abort_at(self.state))?;
        plan.device_tree_fits(patched.len()).map_err(abort_at(self.state))?;

        let ramdisk = img_layout.ramdisk(&image).map_err(abort_at(self.state))?;
        self.io.phys.write(plan.kernel_addr, kern.bytes()).map_err(abort_at(self.state))?;
        self.io.phys.write(plan.ramdisk_addr, ramdisk).map_err(abort_at(self.state))?;
        self.io.phys.write(plan.device_tree_addr, &patched).map_err(abort_at(self.state))?;
        self.enter(BootState::DeviceTreePatched);

        let mut flags = 0;
        if req.recovery {
            flags |= BootModeFlags::RECOVERY;
        }
        if meta.unlocked {
            flags |= BootModeFlags::UNLOCKED;
        }
        if trust.is_some() {
            flags |= BootModeFlags::VERIFIED;
        }
        if resolved.dtbo_index.is_some() {
            flags |= BootModeFlags::DTBO_APPLIED;
        }
        Ok(KernelHandoff::new(&plan, flags))
    }

    fn fields(&self, req: &BootRequest, trust: Option<&Trust>, dt: &ResolvedDeviceTree) -> OrderedFieldSet {
        let meta = &req.metadata;
        let caps = self.config.capabilities;
        let slotted = caps.contains(BootCapabilities::MULTI_SLOT) && !meta.dev_image;

        let verified_boot = trust.map(|t| {
            if caps.contains(BootCapabilities::VERIFIED_BOOT_2) {
                VerifiedBootField { state: t.state, verity: None, fragment: t.fragment.clone() }
            } else {
                VerifiedBootField { state: t.state, verity: meta.verity, fragment: String::new() }
            }
        });

        let root = if caps.contains(BootCapabilities::SYSTEM_AS_ROOT) || slotted {
            match meta.system_path {
                Some(system_path) => Some(RootClause { skip_initramfs: !req.recovery, system_path }),
                None => {
                    log_warn("orchestrator", "system partition unknown, no root= clause");
                    None
                }
            }
        } else {
            None
        };

        OrderedFieldSet {
            verified_boot,
            boot_device: meta.boot_device.clone(),
            serial_no: meta.serial_no.clone(),
            ffbm_mode: meta.ffbm_mode.clone(),
            charger_pause: meta.charger_pause,
            alarm_boot: meta.alarm_boot,
            baseband: meta.baseband.clone(),
            display_panel: meta.display_panel.clone(),
            mdtp_active: caps.contains(BootCapabilities::MDTP) && meta.mdtp_active,
            slot_suffix: if slotted { meta.slot_suffix.clone() } else { None },
            root,
            dtbo_index: dt.dtbo_index,
        }
    }
}

/// Map an abort onto the caller's policy. A RED verdict stays `Abort`:
/// the device powers off instead of offering another image.
pub fn resolve_fallback(decision: BootDecision, policy: FallbackPolicy, booting_recovery: bool) -> BootDecision {
    let abort = match decision {
        BootDecision::Abort(a) => a,
        other => return other,
    };
    if abort.is_red() {
        log_critical("orchestrator", "boot state red, powering off");
        return BootDecision::Abort(abort);
    }
    match policy {
        FallbackPolicy::RecoveryThenFastboot if !booting_recovery => {
            log_warn("orchestrator", "falling back to recovery");
            BootDecision::RetryRecovery
        }
        _ => {
            log_warn("orchestrator", "falling back to fastboot");
            BootDecision::FallbackToFastboot
        }
    }
}
