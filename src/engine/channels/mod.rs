// Clawdbot Gateway — Channel Framework
//
// Common infrastructure every transport adapter inherits:
//   - classify_failover_reason() — pure classification of transport and
//     provider failures into retry classes
//   - run_supervised()           — the shared supervision loop for
//     pull-style transports (classify → backoff → re-enter)
//   - split_message()            — platform message-limit splitting
//   - user_facing_message()      — the one canonical phrasing per error
//     class; adapters never compose their own prose
//
//   access.rs   — dm/group policy + pairing
//   sink.rs     — per-session FIFO queues + the normalized inbound path
//   telegram.rs — long-poll reference adapter
//   webhook.rs  — push-style reference adapter

pub mod access;
pub mod sink;
pub mod telegram;
pub mod webhook;

use crate::atoms::error::GatewayResult;
use crate::engine::backoff::{self, BackoffPolicy};
use log::{info, warn};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ── Failure classification ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverReason {
    Auth,
    RateLimit,
    Format,
    Billing,
    Timeout,
}

impl FailoverReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailoverReason::RateLimit | FailoverReason::Timeout)
    }
}

/// Classify a failure message. `None` means unknown: the supervisor
/// fails fast instead of retrying blindly.
pub fn classify_failover_reason(message: &str) -> Option<FailoverReason> {
    let m = message.to_lowercase();

    if m.contains("invalid api key")
        || m.contains("api key not valid")
        || m.contains("authentication failed")
        || m.contains("unauthorized")
        || m.contains("401")
    {
        return Some(FailoverReason::Auth);
    }
    if m.contains("429")
        || m.contains("too many requests")
        || m.contains("overloaded")
        || m.contains("hit your usage limit")
        || m.contains("rate limit")
        || m.contains("409")
        || m.contains("conflict")
        || m.contains("capacity")
        || m.contains("queue is full")
    {
        return Some(FailoverReason::RateLimit);
    }
    if m.contains("invalid request format")
        || m.contains("schema validation")
        || m.contains("malformed request")
    {
        return Some(FailoverReason::Format);
    }
    if m.contains("credit balance is too low") || m.contains("billing") {
        return Some(FailoverReason::Billing);
    }
    if m.contains("deadline exceeded")
        || m.contains("model unavailable")
        || m.contains("model is unavailable")
        || m.contains("500")
        || m.contains("502")
        || m.contains("503")
        || m.contains("504")
        || m.contains("internal server error")
        || m.contains("timed out")
    {
        return Some(FailoverReason::Timeout);
    }
    None
}

/// The single canonical user-visible phrasing per error class. All
/// adapters consume these — none compose their own.
pub fn user_facing_message(reason: FailoverReason, retry_delay_secs: Option<u64>) -> String {
    match reason {
        FailoverReason::RateLimit => {
            format!("Busy right now, retrying in {}s.", retry_delay_secs.unwrap_or(4))
        }
        FailoverReason::Auth => "Provider needs re-auth.".into(),
        FailoverReason::Billing => "Provider credits exhausted — check billing.".into(),
        FailoverReason::Format => "The request was rejected as malformed.".into(),
        FailoverReason::Timeout => {
            format!("Upstream timed out, retrying in {}s.", retry_delay_secs.unwrap_or(4))
        }
    }
}

// ── Supervision loop ───────────────────────────────────────────────────

pub struct SupervisorOpts {
    pub channel: String,
    pub account_id: String,
    pub policy: BackoffPolicy,
    pub abort: CancellationToken,
}

/// Shared supervision loop for pull-style transports. Runs `task` until
/// it returns Ok (normal termination on abort) or fails with a
/// non-retryable / unknown error. Retryable failures sleep with
/// backoff and re-enter; a task that survived a while resets the
/// attempt counter.
pub async fn run_supervised<F, Fut>(opts: SupervisorOpts, mut task: F) -> GatewayResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<()>>,
{
    let mut restart_attempts: u32 = 0;
    loop {
        if opts.abort.is_cancelled() {
            return Ok(());
        }
        let started = Instant::now();
        match task().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if opts.abort.is_cancelled() || e.is_cancelled() {
                    return Ok(());
                }
                let message = e.to_string();
                let Some(reason) = classify_failover_reason(&message) else {
                    warn!(
                        "[{}] Account {} failed with unclassified error — not retrying: {}",
                        opts.channel, opts.account_id, message
                    );
                    return Err(e);
                };
                if !reason.is_retryable() {
                    warn!(
                        "[{}] Account {} failed ({:?}) — not retrying: {}",
                        opts.channel, opts.account_id, reason, message
                    );
                    return Err(e);
                }

                if started.elapsed() >= Duration::from_secs(60) {
                    restart_attempts = 0;
                }
                restart_attempts += 1;
                let delay = backoff::compute(&opts.policy, restart_attempts);
                info!(
                    "[{}] Account {} hit {:?} — restarting in {}ms (attempt {})",
                    opts.channel,
                    opts.account_id,
                    reason,
                    delay.as_millis(),
                    restart_attempts
                );
                if backoff::sleep_with_abort(delay, &opts.abort).await.is_err() {
                    // Shutdown during backoff is a normal termination.
                    return Ok(());
                }
            }
        }
    }
}

// ── Message splitting ──────────────────────────────────────────────────

/// Split a long message into chunks at a limit, preferring newline then
/// space breaks.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        let window = crate::engine::types::truncate_utf8(remaining, max_len);
        let split_at = window.rfind('\n').or_else(|| window.rfind(' ')).unwrap_or(window.len());
        let split_at = if split_at == 0 { window.len() } else { split_at };
        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}
