//! Bounded busy-wait helpers
//!
//! All hardware waits in this crate are iteration-counted spins rather than
//! wall-clock timeouts, so no timer calibration is needed before the storage
//! stack comes up.

/// Maximum number of poll iterations before a hardware wait is abandoned.
pub const SPIN_BOUND: u32 = 1_000_000;

/// Spin until `cond` returns true or the iteration bound is exhausted.
///
/// Returns `true` if the condition was met, `false` on exhaustion.
pub fn spin_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..SPIN_BOUND {
        if cond() {
            return true;
        }
        core::hint::spin_loop();
    }
    false
}
