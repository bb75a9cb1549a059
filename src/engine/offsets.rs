// Clawdbot Gateway — Update-Offset Store
//
// Per-account persistent cursor over a transport's update stream.
// The cursor is written as soon as an event is accepted into the sink
// (before the agent runs), so a crash never redelivers a consumed
// transport event while the agent's reply remains at-least-once.
//
// Writes are atomic (temp-rename) and strictly monotone: a write that
// does not advance the cursor is skipped.

use crate::atoms::error::GatewayResult;
use crate::engine::paths;
use crate::engine::sessions::write_atomic;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OffsetFile {
    last_update_id: i64,
}

/// Handle to one account's offset file.
pub struct OffsetStore {
    path: PathBuf,
}

impl OffsetStore {
    pub fn new(state_dir: &Path, agent_id: &str, transport: &str, account_id: &str) -> Self {
        OffsetStore { path: paths::offset_path(state_dir, agent_id, transport, account_id) }
    }

    /// Read the persisted cursor. Missing or unreadable file → `None`.
    pub fn read(&self) -> Option<i64> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str::<OffsetFile>(&raw).ok().map(|f| f.last_update_id)
    }

    /// Persist a new cursor value. Returns `true` if the value advanced
    /// and was written, `false` if it was skipped as non-monotone.
    pub fn write(&self, new_id: i64) -> GatewayResult<bool> {
        if let Some(current) = self.read() {
            if new_id <= current {
                debug!(
                    "[offsets] Skipping non-monotone write {} (current {}) at {}",
                    new_id,
                    current,
                    self.path.display()
                );
                return Ok(false);
            }
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec(&OffsetFile { last_update_id: new_id })?;
        write_atomic(&self.path, &body)?;
        Ok(true)
    }
}
