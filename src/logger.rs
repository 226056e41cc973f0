//! logger.rs — component-tagged log helpers over the `log` facade
//!
//! Call sites name the pipeline component ("bootimg", "dtb", ...) which
//! becomes the log target, so a firmware-side logger can filter per stage.
//! Without the `logging` feature every helper is a no-op.

#[cfg(feature = "logging")]
#[inline]
pub fn log_debug(component: &str, msg: &str) {
    ::log::debug!(target: component, "{}", msg);
}

#[cfg(feature = "logging")]
#[inline]
pub fn log_info(component: &str, msg: &str) {
    ::log::info!(target: component, "{}", msg);
}

#[cfg(feature = "logging")]
#[inline]
pub fn log_warn(component: &str, msg: &str) {
    ::log::warn!(target: component, "{}", msg);
}

/// Unrecoverable conditions: the attempt is about to abort.
#[cfg(feature = "logging")]
#[inline]
pub fn log_critical(component: &str, msg: &str) {
    ::log::error!(target: component, "{}", msg);
}

#[cfg(not(feature = "logging"))]
#[inline]
pub fn log_debug(_component: &str, _msg: &str) {}

#[cfg(not(feature = "logging"))]
#[inline]
pub fn log_info(_component: &str, _msg: &str) {}

#[cfg(not(feature = "logging"))]
#[inline]
pub fn log_warn(_component: &str, _msg: &str) {}

#[cfg(not(feature = "logging"))]
#[inline]
pub fn log_critical(_component: &str, _msg: &str) {}
