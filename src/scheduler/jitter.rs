//! Jitter and reschedule arithmetic.
//!
//! All functions take the RNG explicitly so tests can seed it.

use rand::RngExt;

use crate::clock::signed_millis;
use crate::store::parse_score_secs;

/// Applies a symmetric ±`ratio` perturbation to `base_ms`.
///
/// Non-positive inputs pass through unchanged. A positive base never
/// jitters down to zero.
pub fn apply_jitter<R: RngExt>(rng: &mut R, base_ms: i64, ratio: f64) -> i64 {
    if base_ms <= 0 || ratio <= 0.0 {
        return base_ms;
    }
    let ratio = ratio.min(1.0);
    let delta: f64 = rng.random_range(-ratio..=ratio);
    let jittered = (base_ms as f64 * (1.0 + delta)).round() as i64;
    jittered.max(1)
}

/// Rounds up to whole seconds, since scores have second resolution.
pub fn round_up_to_second(ms: i64) -> i64 {
    if ms <= 0 {
        return 0;
    }
    ((ms + 999) / 1_000) * 1_000
}

/// Random delay in `[0, window_secs]` seconds for a newly registered agent.
pub fn registration_delay_ms<R: RngExt>(rng: &mut R, window_secs: u64) -> i64 {
    if window_secs == 0 {
        return 0;
    }
    rng.random_range(0..=window_secs as i64 * 1_000)
}

/// Random delay of 1 to `window_secs` whole seconds for shutdown requeue.
pub fn shutdown_delay_ms<R: RngExt>(rng: &mut R, window_secs: u64) -> i64 {
    if window_secs == 0 {
        return 0;
    }
    rng.random_range(1..=window_secs as i64) * 1_000
}

/// Offset from `now_ms` to the run the agent would have had without interruption.
///
/// The deadline score is `acquire_time + timeout`, so the intended next run
/// is `deadline - timeout + interval`. Returns `None` for an unparseable
/// score; never returns a negative offset.
pub fn cadence_preserving_offset_ms(
    deadline_score: &str,
    timeout_ms: u64,
    interval_ms: u64,
    now_ms: i64,
) -> Option<i64> {
    let deadline_secs = parse_score_secs(deadline_score)?;
    let next_run_ms = deadline_secs
        .saturating_mul(1_000)
        .saturating_sub(signed_millis(timeout_ms))
        .saturating_add(signed_millis(interval_ms));
    Some(next_run_ms.saturating_sub(now_ms).max(0))
}
