// Clawdbot Gateway — Exponential Backoff
//
// Shared retry policy used by channel supervisors and transport calls:
// exponential growth with symmetric jitter and a hard cap, plus an
// abortable sleep that unwinds cleanly on shutdown.

use crate::atoms::error::{GatewayError, GatewayResult};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

// ── Policy ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    /// Symmetric jitter fraction, e.g. 0.25 for ±25%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy { initial_ms: 1_000, max_ms: 300_000, factor: 2.0, jitter: 0.25 }
    }
}

/// Compute the delay for a 1-based attempt number:
/// `min(initial * factor^(attempt-1), max)` scaled by
/// `1 + uniform(-jitter, +jitter)`, clamped to non-negative.
pub fn compute(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let base = policy.initial_ms as f64 * policy.factor.powi(exp as i32);
    let capped = base.min(policy.max_ms as f64);
    let jittered = capped * (1.0 + jitter_offset(policy.jitter));
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// Uniform offset in [-jitter, +jitter], sourced from the system clock's
/// sub-second nanos. Cheap, and plenty for de-synchronizing retries.
fn jitter_offset(jitter: f64) -> f64 {
    if jitter <= 0.0 {
        return 0.0;
    }
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let unit = (nanos % 1000) as f64 / 999.0; // 0.0 ..= 1.0
    (unit * 2.0 - 1.0) * jitter
}

// ── Abortable sleep ────────────────────────────────────────────────────

/// Sleep for `delay`, or return `Err(Cancelled)` as soon as the token
/// fires.
pub async fn sleep_with_abort(delay: Duration, abort: &CancellationToken) -> GatewayResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = abort.cancelled() => Err(GatewayError::Cancelled("shutdown during backoff".into())),
    }
}
