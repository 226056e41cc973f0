//! NØNOS Android Boot Loader stage — boot-image assembly core
//!
//! Takes a raw boot partition image plus a verified-boot verdict and decides
//! whether the kernel may be entered. The pipeline, leaf first:
//!
//! - [`bootimg`]: header validation and page-rounded payload layout
//! - [`kernel`]: gzip / patched / raw kernel extraction, arm32 vs arm64
//! - [`dtb`]: appended DTB scan, hardware best-match, DTBO overlay
//! - [`layout`]: physical load addresses and reserved-window checks
//! - [`cmdline`]: final kernel command line in a fixed field order
//! - [`dtpatch`]: memory / chosen / fstab patching of the selected tree
//! - [`orchestrator`]: the state machine that sequences all of the above
//!
//! Everything outside the core (partition I/O, crypto verification, board
//! identity, physical memory, the final jump) is reached through the traits
//! in [`platform`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arith;
pub mod bootimg;
pub mod cmdline;
pub mod config;
pub mod dtb;
pub mod dtpatch;
pub mod error;
pub mod fdt;
pub mod handoff;
pub mod kernel;
pub mod layout;
pub mod logger;
pub mod orchestrator;
pub mod platform;
pub mod verify;

pub use error::{BootError, BootResult, ErrorKind};
pub use orchestrator::{BootDecision, BootOrchestrator, BootState};
