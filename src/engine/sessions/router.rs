// Clawdbot Gateway — Session Router
//
// Resolves an inbound origin to its durable session entry, creating one
// on first contact. Session-id stability: every event for the same
// session key observes the same session id, across restarts.

use super::{session_key, SessionEntry, SessionPatch, SessionStore};
use crate::atoms::error::GatewayResult;
use crate::engine::paths;
use crate::engine::types::InboundMessage;
use log::info;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub store_path: PathBuf,
    pub session_key: String,
    pub entry: SessionEntry,
    pub is_new_session: bool,
    /// Whether the system prompt was already delivered before this event.
    pub system_sent: bool,
}

/// Resolve (or create) the session for an inbound message.
///
/// Reuses the existing session id when the key is known; otherwise mints
/// a fresh UUID. The merge is atomic: concurrent writers racing on the
/// same key converge on the earlier session id and the max timestamp.
pub fn resolve_session(
    store: &SessionStore,
    state_dir: &Path,
    agent_id: &str,
    msg: &InboundMessage,
    now: &str,
) -> GatewayResult<ResolvedSession> {
    let store_path = paths::sessions_path(state_dir, agent_id);
    let key = session_key(agent_id, &msg.origin());

    let existing = store.load(&store_path)?.get(&key).cloned();
    let is_new_session = existing.is_none();
    let session_id = existing
        .as_ref()
        .map(|e| e.session_id.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let system_sent = existing.as_ref().map(|e| e.system_sent).unwrap_or(false);

    if is_new_session {
        info!("[sessions] New session {} for key {}", session_id, key);
    }

    let patch = SessionPatch {
        session_id: Some(session_id),
        updated_at: Some(now.to_string()),
        last_channel: Some(msg.transport.clone()),
        channel_of_origin: if is_new_session { Some(msg.transport.clone()) } else { None },
        group_id: msg.group_id.clone(),
        thread_id: msg.thread_id.clone(),
        system_sent: Some(system_sent),
        ..Default::default()
    };

    let map = store.update(&store_path, |map| {
        let current = map.get(&key).cloned().unwrap_or_default();
        map.insert(key.clone(), SessionStore::merge(&current, &patch));
    })?;

    let entry = map.get(&key).cloned().unwrap_or_default();
    Ok(ResolvedSession { store_path, session_key: key, entry, is_new_session, system_sent })
}

/// Destroy a session explicitly (revoke or user-initiated reset).
/// Returns whether an entry existed. The removal is audited as a
/// session end.
pub fn revoke_session(
    store: &SessionStore,
    state_dir: &Path,
    agent_id: &str,
    key: &str,
    audit: &crate::engine::security::audit::AuditLog,
) -> GatewayResult<bool> {
    let store_path = paths::sessions_path(state_dir, agent_id);
    let mut removed: Option<SessionEntry> = None;
    store.update(&store_path, |map| {
        removed = map.remove(key);
    })?;
    if let Some(entry) = removed {
        info!("[sessions] Revoked session {} ({})", entry.session_id, key);
        audit
            .record(
                crate::engine::security::audit::AuditEvent::SessionEnd,
                serde_json::json!({
                    "sessionId": entry.session_id,
                    "sessionKey": key,
                    "reason": "revoked",
                }),
            )
            .ok();
        Ok(true)
    } else {
        Ok(false)
    }
}
