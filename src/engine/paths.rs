// Clawdbot Gateway — State Directory Layout
//
// Everything durable lives under one state root, agent-scoped:
//   {state_dir}/{agent_id}/sessions.json
//   {state_dir}/{agent_id}/auth-profiles.json
//   {state_dir}/{agent_id}/otp-verifications.json
//   {state_dir}/{agent_id}/offsets/<transport>/<account>.json
//   {state_dir}/{agent_id}/usage/<YYYY-MM-DD>.json
//   {state_dir}/{agent_id}/audit.log
//   {state_dir}/workspaces/{agent_id}/...
//
// The root resolves, in priority order:
//   1. explicit path (CLI flag)
//   2. CLAWDBOT_STATE_DIR environment variable
//   3. ~/.clawdbot (optionally suffixed by CLAWDBOT_PROFILE)

use std::path::{Path, PathBuf};

/// Resolve the gateway state root.
pub fn resolve_state_dir(explicit: Option<&str>) -> PathBuf {
    if let Some(p) = explicit {
        return expand_tilde(p);
    }
    if let Ok(env_path) = std::env::var("CLAWDBOT_STATE_DIR") {
        if !env_path.is_empty() {
            return expand_tilde(&env_path);
        }
    }
    let base = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clawdbot");
    match std::env::var("CLAWDBOT_PROFILE") {
        Ok(profile) if !profile.is_empty() && profile != "default" => {
            base.join("profiles").join(profile)
        }
        _ => base,
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Per-agent state directory.
pub fn agent_dir(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir.join(agent_id)
}

/// Path of the agent's durable session store.
pub fn sessions_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    agent_dir(state_dir, agent_id).join("sessions.json")
}

/// Path of the agent's auth-profile store. Mode 0600; never logged.
pub fn auth_profiles_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    agent_dir(state_dir, agent_id).join("auth-profiles.json")
}

/// Path of the agent's OTP verification-state store.
pub fn otp_state_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    agent_dir(state_dir, agent_id).join("otp-verifications.json")
}

/// Path of a per-account update-offset cursor.
pub fn offset_path(state_dir: &Path, agent_id: &str, transport: &str, account_id: &str) -> PathBuf {
    agent_dir(state_dir, agent_id)
        .join("offsets")
        .join(transport)
        .join(format!("{}.json", account_id))
}

/// Path of today's usage counter file for a given local date `YYYY-MM-DD`.
pub fn usage_path(state_dir: &Path, agent_id: &str, date: &str) -> PathBuf {
    agent_dir(state_dir, agent_id)
        .join("usage")
        .join(format!("{}.json", date))
}

/// Path of the agent's append-only audit log (JSONL).
pub fn audit_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    agent_dir(state_dir, agent_id).join("audit.log")
}

/// Per-agent workspace root (exec / file tools default cwd).
pub fn workspace_dir(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir.join("workspaces").join(agent_id)
}
