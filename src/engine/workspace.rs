// Clawdbot Gateway — Workspace Sandbox Policy
//
// Exec and file tools run with a working directory resolved through
// this policy:
//   off         — every session shares the agent's workspace
//   non-main    — per-session dirs, except the agent's main session
//   per-session — always a per-session dir
//
// Per-session dirs live under the agent workspace, keyed by session id,
// so a revoked session leaves no stray state elsewhere.

use crate::atoms::error::GatewayResult;
use crate::engine::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    Off,
    NonMain,
    PerSession,
}

/// Resolve the working directory for a session's tool executions.
pub fn resolve_workspace(
    state_dir: &Path,
    agent_id: &str,
    session_id: &str,
    is_main_session: bool,
    mode: SandboxMode,
) -> PathBuf {
    let base = paths::workspace_dir(state_dir, agent_id);
    match mode {
        SandboxMode::Off => base,
        SandboxMode::NonMain if is_main_session => base,
        SandboxMode::NonMain | SandboxMode::PerSession => base.join("sessions").join(session_id),
    }
}

/// Resolve and create the workspace directory.
pub fn ensure_workspace(
    state_dir: &Path,
    agent_id: &str,
    session_id: &str,
    is_main_session: bool,
    mode: SandboxMode,
) -> GatewayResult<PathBuf> {
    let dir = resolve_workspace(state_dir, agent_id, session_id, is_main_session, mode);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
