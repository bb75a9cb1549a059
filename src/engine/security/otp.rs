// Clawdbot Gateway — OTP Verification Policy
//
// TOTP (RFC 6238, HMAC-SHA1, 30 s step, ±1 step window) gates inbound
// messages per user. Verification state is a per-user record
// {last_verified_at, first_seen_at} persisted 0600 under the agent
// state dir. The channel middleware calls `handle_message` on every
// inbound text: an `/otp <code>` message validates and marks the user
// verified atomically; anything else is gated by `enforce_verification`.

use crate::atoms::error::GatewayResult;
use crate::engine::security::secrets;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::collections::HashMap;
use std::path::PathBuf;
use subtle::ConstantTimeEq;
use thiserror::Error;

const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 6;

// ── Config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpConfig {
    pub enabled: bool,
    /// Base32 TOTP seed. Never logged.
    pub secret: String,
    /// Re-verification window in hours.
    #[serde(default = "default_interval_hours")]
    pub interval_hours: i64,
    /// After expiry, messages within this many minutes get a softer
    /// "grace period" hint.
    #[serde(default = "default_grace_minutes")]
    pub grace_period_minutes: i64,
    /// Strict mode: users who have never verified are refused outright.
    #[serde(default)]
    pub strict: bool,
    /// Per-channel enable map; missing channel → enabled.
    #[serde(default)]
    pub channels: HashMap<String, bool>,
}

fn default_interval_hours() -> i64 {
    24
}
fn default_grace_minutes() -> i64 {
    30
}

impl Default for OtpConfig {
    fn default() -> Self {
        OtpConfig {
            enabled: false,
            secret: String::new(),
            interval_hours: default_interval_hours(),
            grace_period_minutes: default_grace_minutes(),
            strict: false,
            channels: HashMap::new(),
        }
    }
}

impl OtpConfig {
    pub fn applies_to_channel(&self, channel: &str) -> bool {
        self.enabled && self.channels.get(channel).copied().unwrap_or(true)
    }
}

// ── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Verification expired — send your one-time code with /otp <code>.")]
    Expired { grace_period_active: bool },
    #[error("This channel requires verification before first use. Send /otp <code>.")]
    StrictModeViolation,
}

// ── Verification state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserVerification {
    #[serde(default)]
    pub last_verified_at: Option<String>,
    pub first_seen_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VerificationFile {
    #[serde(default)]
    users: HashMap<String, UserVerification>,
}

pub struct OtpPolicy {
    config: OtpConfig,
    store_path: PathBuf,
    state: Mutex<HashMap<String, UserVerification>>,
}

/// Outcome of running the middleware on one inbound message.
#[derive(Debug, PartialEq, Eq)]
pub enum OtpDecision {
    /// Proceed with the turn.
    Allowed,
    /// The message was an `/otp` command and the code was valid; the
    /// user is now verified. Reply with the confirmation, do not run
    /// the agent on this message.
    JustVerified,
    /// Refused; the agent run must not start.
    Denied { message: String },
}

impl OtpPolicy {
    pub fn new(config: OtpConfig, store_path: PathBuf) -> Self {
        let state = std::fs::read_to_string(&store_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<VerificationFile>(&raw).ok())
            .map(|f| f.users)
            .unwrap_or_default();
        OtpPolicy { config, store_path, state: Mutex::new(state) }
    }

    pub fn config(&self) -> &OtpConfig {
        &self.config
    }

    /// Gate a user. Ok(()) when verified and fresh; otherwise the typed
    /// error the middleware maps to a user-visible message.
    pub fn enforce_verification(&self, user_id: &str) -> Result<(), VerificationError> {
        self.enforce_at(user_id, Utc::now())
    }

    fn enforce_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), VerificationError> {
        let mut state = self.state.lock();
        let record = state.entry(user_id.to_string()).or_insert_with(|| UserVerification {
            last_verified_at: None,
            first_seen_at: now.to_rfc3339(),
        });

        let Some(last) = record
            .last_verified_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        else {
            if self.config.strict {
                return Err(VerificationError::StrictModeViolation);
            }
            return Ok(());
        };

        let age = now.signed_duration_since(last.with_timezone(&Utc));
        let interval = Duration::hours(self.config.interval_hours);
        if age <= interval {
            return Ok(());
        }
        let grace_period_active =
            age <= interval + Duration::minutes(self.config.grace_period_minutes);
        Err(VerificationError::Expired { grace_period_active })
    }

    /// Mark a user verified now and persist.
    pub fn mark_user_verified(&self, user_id: &str) -> GatewayResult<()> {
        self.mark_at(user_id, Utc::now())
    }

    fn mark_at(&self, user_id: &str, now: DateTime<Utc>) -> GatewayResult<()> {
        let snapshot = {
            let mut state = self.state.lock();
            let record = state.entry(user_id.to_string()).or_insert_with(|| UserVerification {
                last_verified_at: None,
                first_seen_at: now.to_rfc3339(),
            });
            record.last_verified_at = Some(now.to_rfc3339());
            VerificationFile { users: state.clone() }
        };
        let body = serde_json::to_vec_pretty(&snapshot)?;
        secrets::write_secret_file(&self.store_path, &body)?;
        info!("[otp] User {} verified", user_id);
        Ok(())
    }

    /// Validate a submitted code against the configured seed.
    pub fn validate_code(&self, code: &str) -> bool {
        validate_totp(&self.config.secret, code, Utc::now().timestamp() as u64)
    }

    /// Middleware entrypoint: run on every inbound message for channels
    /// where OTP applies.
    pub fn handle_message(&self, user_id: &str, text: &str) -> OtpDecision {
        let trimmed = text.trim();
        if trimmed == "/otp" || trimmed.starts_with("/otp ") {
            let code = trimmed.strip_prefix("/otp").unwrap_or_default().trim();
            if self.validate_code(code) {
                if let Err(e) = self.mark_user_verified(user_id) {
                    warn!("[otp] Failed to persist verification for {}: {}", user_id, e);
                }
                return OtpDecision::JustVerified;
            }
            warn!("[otp] Invalid code from user {}", user_id);
            return OtpDecision::Denied { message: "Invalid one-time code. Try again.".into() };
        }

        match self.enforce_verification(user_id) {
            Ok(()) => OtpDecision::Allowed,
            Err(e @ VerificationError::Expired { grace_period_active }) => {
                let mut message = e.to_string();
                if grace_period_active {
                    message.push_str(" (grace period active)");
                }
                OtpDecision::Denied { message }
            }
            Err(e) => OtpDecision::Denied { message: e.to_string() },
        }
    }
}

// ── RFC 6238 ───────────────────────────────────────────────────────────

/// Validate a TOTP code with a ±1 step window.
pub fn validate_totp(base32_secret: &str, code: &str, unix_time: u64) -> bool {
    let Some(key) = base32_decode(base32_secret) else {
        return false;
    };
    if code.len() != TOTP_DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let step = unix_time / TOTP_STEP_SECS;
    for candidate_step in [step.wrapping_sub(1), step, step + 1] {
        let expected = hotp(&key, candidate_step);
        if bool::from(expected.as_bytes().ct_eq(code.as_bytes())) {
            return true;
        }
    }
    false
}

/// HOTP (RFC 4226) with dynamic truncation, zero-padded to 6 digits.
fn hotp(key: &[u8], counter: u64) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[19] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);
    format!("{:06}", binary % 10u32.pow(TOTP_DIGITS))
}

/// RFC 4648 base32 decoding (case-insensitive, padding optional).
/// Small and local: nothing else in the gateway needs base32.
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u32 = 0;
    let mut bit_count: u32 = 0;
    let mut out = Vec::new();
    for c in input.chars() {
        if c == '=' || c == ' ' {
            continue;
        }
        let idx = ALPHABET.iter().position(|&a| a == c.to_ascii_uppercase() as u8)? as u32;
        bits = (bits << 5) | idx;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
            bits &= (1 << bit_count) - 1;
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // RFC 6238 test seed: ASCII "12345678901234567890" in base32.
    const SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    fn policy(strict: bool, dir: &std::path::Path) -> OtpPolicy {
        OtpPolicy::new(
            OtpConfig {
                enabled: true,
                secret: SEED.into(),
                interval_hours: 24,
                grace_period_minutes: 30,
                strict,
                channels: HashMap::new(),
            },
            dir.join("otp-verifications.json"),
        )
    }

    #[test]
    fn base32_decodes_rfc_seed() {
        assert_eq!(base32_decode(SEED).unwrap(), b"12345678901234567890");
        assert_eq!(base32_decode("MZXW6===").unwrap(), b"foo");
        assert!(base32_decode("1nv@lid!").is_none());
    }

    #[test]
    fn rfc6238_reference_vectors() {
        // Appendix B of RFC 6238 (SHA-1 rows, truncated to 6 digits).
        assert!(validate_totp(SEED, "287082", 59));
        assert!(validate_totp(SEED, "081804", 1111111109));
        assert!(validate_totp(SEED, "050471", 1111111111));
        assert!(validate_totp(SEED, "279037", 2000000000));
        assert!(!validate_totp(SEED, "000000", 59));
    }

    #[test]
    fn window_accepts_adjacent_steps_only() {
        // 287082 is the code for t=59 (step 1).
        assert!(validate_totp(SEED, "287082", 59 + 30)); // one step late
        assert!(validate_totp(SEED, "287082", 29)); // one step early
        assert!(!validate_totp(SEED, "287082", 59 + 120)); // too late
    }

    #[test]
    fn malformed_codes_are_rejected() {
        assert!(!validate_totp(SEED, "12345", 59)); // wrong length
        assert!(!validate_totp(SEED, "28708a", 59)); // non-digit
        assert!(!validate_totp("", "287082", 59)); // no seed
    }

    #[test]
    fn unverified_user_passes_unless_strict() {
        let dir = tempdir().unwrap();
        assert!(policy(false, dir.path()).enforce_verification("u1").is_ok());
        assert_eq!(
            policy(true, dir.path()).enforce_verification("u1"),
            Err(VerificationError::StrictModeViolation)
        );
    }

    #[test]
    fn expiry_and_grace_period() {
        let dir = tempdir().unwrap();
        let p = policy(false, dir.path());
        let now = Utc::now();

        p.mark_at("u1", now - Duration::hours(25)).unwrap();
        // 25h ago, interval 24h, grace 30m → expired with grace active.
        assert_eq!(
            p.enforce_at("u1", now - Duration::minutes(45)),
            Err(VerificationError::Expired { grace_period_active: true })
        );
        // Well past grace.
        assert_eq!(
            p.enforce_at("u1", now),
            Err(VerificationError::Expired { grace_period_active: false })
        );
        // Fresh verification passes.
        p.mark_at("u1", now).unwrap();
        assert!(p.enforce_at("u1", now).is_ok());
    }

    #[test]
    fn verification_state_survives_reload() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        policy(true, dir.path()).mark_at("u1", now).unwrap();

        let reloaded = policy(true, dir.path());
        assert!(reloaded.enforce_at("u1", now).is_ok());
        assert_eq!(
            reloaded.enforce_at("u2", now),
            Err(VerificationError::StrictModeViolation)
        );
    }

    #[test]
    fn middleware_denies_expired_then_verifies_via_command() {
        let dir = tempdir().unwrap();
        let p = policy(true, dir.path());

        match p.handle_message("u1", "hello") {
            OtpDecision::Denied { message } => assert!(message.contains("verification")),
            other => panic!("expected denial, got {:?}", other),
        }

        // Compute the valid code for the current time and submit it.
        let key = base32_decode(SEED).unwrap();
        let code = hotp(&key, Utc::now().timestamp() as u64 / 30);
        assert_eq!(p.handle_message("u1", &format!("/otp {}", code)), OtpDecision::JustVerified);
        assert_eq!(p.handle_message("u1", "hello again"), OtpDecision::Allowed);
    }

    #[test]
    fn channel_enable_map() {
        let mut cfg = OtpConfig { enabled: true, ..OtpConfig::default() };
        cfg.channels.insert("webhook".into(), false);
        assert!(cfg.applies_to_channel("telegram"));
        assert!(!cfg.applies_to_channel("webhook"));
        let disabled = OtpConfig::default();
        assert!(!disabled.applies_to_channel("telegram"));
    }
}
