// Clawdbot Gateway — Channel Access Control
//
// DM and group policy shared by all adapters. Under the `pairing`
// policy an unknown sender gets a one-time pairing code; the account
// owner approves or denies it out of band. Every pairing transition is
// audited.

use crate::engine::config::{DmPolicy, GroupPolicy};
use crate::engine::security::audit::{AuditEvent, AuditLog};
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUser {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    /// One-time token the sender can quote to the owner.
    pub pairing_code: String,
    pub requested_at: String,
}

/// Outcome of a DM access check.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessDecision {
    Allowed,
    /// Denied with a message to send back to the peer.
    Denied { message: String },
    /// Unknown peer under `pairing`: a request was recorded (or already
    /// pending) and the peer gets the pairing message.
    PairingPending { message: String },
}

/// Short, unambiguous pairing code (no 0/O or 1/I).
pub fn generate_pairing_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut bytes = [0u8; 8];
    // Zero bytes on RNG failure still produce a (weak) code; the code
    // only gates a manual approval step.
    let _ = getrandom::getrandom(&mut bytes);
    bytes.iter().map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char).collect()
}

/// Check DM access for a sender, mutating `pending` under the pairing
/// policy.
pub fn check_dm_access(
    policy: DmPolicy,
    user_id: &str,
    username: &str,
    display_name: &str,
    allow_from: &[String],
    pending: &mut Vec<PendingUser>,
    audit: &AuditLog,
) -> AccessDecision {
    match policy {
        DmPolicy::Open => AccessDecision::Allowed,
        DmPolicy::Disabled => {
            AccessDecision::Denied { message: "Direct messages are disabled.".into() }
        }
        DmPolicy::Allowlist => {
            if allow_from.iter().any(|u| u == user_id) {
                AccessDecision::Allowed
            } else {
                AccessDecision::Denied {
                    message: "You're not on the allowlist. Ask the gateway owner to add you."
                        .into(),
                }
            }
        }
        DmPolicy::Pairing => {
            if allow_from.iter().any(|u| u == user_id) {
                return AccessDecision::Allowed;
            }
            let code = match pending.iter().find(|p| p.user_id == user_id) {
                Some(existing) => existing.pairing_code.clone(),
                None => {
                    let code = generate_pairing_code();
                    pending.push(PendingUser {
                        user_id: user_id.to_string(),
                        username: username.to_string(),
                        display_name: display_name.to_string(),
                        pairing_code: code.clone(),
                        requested_at: Utc::now().to_rfc3339(),
                    });
                    audit
                        .record(
                            AuditEvent::PairingEvent,
                            json!({"event": "requested", "userId": user_id, "username": username}),
                        )
                        .ok();
                    info!("[access] Pairing request from {} ({})", username, user_id);
                    code
                }
            };
            AccessDecision::PairingPending {
                message: format!(
                    "Pairing request sent. Quote code {} to the gateway owner to get approved.",
                    code
                ),
            }
        }
    }
}

/// Check group access.
pub fn check_group_access(
    policy: GroupPolicy,
    group_id: &str,
    allowed_groups: &[String],
) -> AccessDecision {
    match policy {
        GroupPolicy::Open => AccessDecision::Allowed,
        GroupPolicy::Disabled => {
            AccessDecision::Denied { message: "Group chats are disabled.".into() }
        }
        GroupPolicy::Allowlist => {
            if allowed_groups.iter().any(|g| g == group_id) {
                AccessDecision::Allowed
            } else {
                AccessDecision::Denied { message: "This group is not allowlisted.".into() }
            }
        }
    }
}

/// Approve a pending pairing request: moves the user into `allow_from`.
/// Returns false when no such request is pending.
pub fn approve_user(
    user_id: &str,
    allow_from: &mut Vec<String>,
    pending: &mut Vec<PendingUser>,
    audit: &AuditLog,
) -> bool {
    let was_pending = pending.iter().any(|p| p.user_id == user_id);
    if !was_pending {
        return false;
    }
    pending.retain(|p| p.user_id != user_id);
    if !allow_from.iter().any(|u| u == user_id) {
        allow_from.push(user_id.to_string());
    }
    audit
        .record(AuditEvent::PairingEvent, json!({"event": "approved", "userId": user_id}))
        .ok();
    info!("[access] User {} approved", user_id);
    true
}

/// Deny a pending pairing request.
pub fn deny_user(user_id: &str, pending: &mut Vec<PendingUser>, audit: &AuditLog) -> bool {
    let was_pending = pending.iter().any(|p| p.user_id == user_id);
    pending.retain(|p| p.user_id != user_id);
    if was_pending {
        audit
            .record(AuditEvent::PairingEvent, json!({"event": "denied", "userId": user_id}))
            .ok();
        info!("[access] User {} denied", user_id);
    }
    was_pending
}

/// Remove a user from the allowlist.
pub fn remove_user(user_id: &str, allow_from: &mut Vec<String>, audit: &AuditLog) -> bool {
    let had = allow_from.iter().any(|u| u == user_id);
    allow_from.retain(|u| u != user_id);
    if had {
        audit
            .record(AuditEvent::PairingEvent, json!({"event": "removed", "userId": user_id}))
            .ok();
        info!("[access] User {} removed from allowlist", user_id);
    }
    had
}
