//! verify.rs — verified-boot gate
//!
//! The signature engine lives outside this crate and hands back a
//! [`TrustVerdict`]. This module only decides what the verdict means for the
//! current attempt:
//!   - RED                         abort, device powers off
//!   - verifier error              abort, locked or not
//!   - continue not allowed        abort
//!   - otherwise                   continue, state goes on the cmdline
//!
//! An unlocked device is let through by the verifier itself, as an ORANGE
//! verdict with `continue_allowed` set. A verifier that failed to run
//! (I/O, allocation, unreadable metadata) has checked nothing, so its
//! error is never turned into a verdict here.

use alloc::string::String;

use crate::error::BootError;
use crate::logger::{log_critical, log_info, log_warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrustState {
    #[default]
    Green,
    Yellow,
    Orange,
    Red,
}

impl TrustState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustState::Green => "green",
            TrustState::Yellow => "yellow",
            TrustState::Orange => "orange",
            TrustState::Red => "red",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustVerdict {
    pub state: TrustState,
    /// Extra cmdline text from the verifier, leading space included.
    pub cmdline_fragment: String,
    pub continue_allowed: bool,
}

pub enum TrustDecision {
    Continue { state: TrustState, fragment: String },
    Abort { reason: &'static str, state: TrustState },
}

pub fn evaluate(verdict: Result<TrustVerdict, BootError>, unlocked: bool) -> TrustDecision {
    let verdict = match verdict {
        Ok(v) => v,
        Err(e) => {
            log_critical(
                "verify",
                &alloc::format!("verification failed ({}): {}", if unlocked { "unlocked" } else { "locked" }, e),
            );
            return TrustDecision::Abort { reason: "image verification failed", state: TrustState::Red };
        }
    };

    if verdict.state == TrustState::Red {
        log_critical("verify", "boot state RED");
        return TrustDecision::Abort { reason: "boot state red", state: TrustState::Red };
    }
    if !verdict.continue_allowed {
        log_warn("verify", "verifier refused to continue");
        return TrustDecision::Abort { reason: "verifier refused to continue", state: verdict.state };
    }
    log_info("verify", &alloc::format!("boot state {}", verdict.state.as_str()));
    TrustDecision::Continue { state: verdict.state, fragment: verdict.cmdline_fragment }
}
