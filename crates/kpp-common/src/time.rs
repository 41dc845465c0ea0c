//! ---
//! kpp_section: "01-core-functionality"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Shared primitives and utilities for the core runtime."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Simulation time is a plain `f64` of seconds supplied by the caller on every
//! tick. Nothing in the coordination layer reads a wall clock.

use std::time::Duration;

/// Seconds of simulation time.
pub type SimSeconds = f64;

/// Elapsed simulation time since `start`, saturating at zero when the caller
/// hands in a timestamp that runs backwards or is not finite.
pub fn elapsed(start: SimSeconds, now: SimSeconds) -> Duration {
    let delta = now - start;
    if delta.is_finite() && delta > 0.0 {
        Duration::from_secs_f64(delta)
    } else {
        Duration::ZERO
    }
}

/// True once strictly more than `timeout` has passed since `start`.
pub fn has_expired(start: SimSeconds, now: SimSeconds, timeout: Duration) -> bool {
    elapsed(start, now) > timeout
}

/// Fraction of `window` that has elapsed since `start`, clamped to `[0, 1]`.
pub fn ramp_fraction(start: SimSeconds, now: SimSeconds, window: Duration) -> f64 {
    if window.is_zero() {
        return 1.0;
    }
    (elapsed(start, now).as_secs_f64() / window.as_secs_f64()).clamp(0.0, 1.0)
}

/// Convert a duration into microseconds, saturating at `u64::MAX`.
pub fn duration_to_micros(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_mul(1_000_000)
        .saturating_add(u64::from(duration.subsec_micros()))
}
