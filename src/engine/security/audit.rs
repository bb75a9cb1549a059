// Clawdbot Gateway — Audit Log
//
// Append-only JSONL, one record per line: {"ts", "type", ...payload}.
// The log file is created 0600 and only ever appended to.

use crate::atoms::error::GatewayResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    SessionStart,
    SessionEnd,
    AuthFailure,
    ToolInvoke,
    ToolDenied,
    ExecRun,
    DangerousCommandBlocked,
    PairingEvent,
    ConfigChange,
    SecretDetected,
    SensitiveFileAccess,
    HardeningInit,
}

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        AuditLog { path, file: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. `payload` must be a JSON object; its fields are
    /// flattened next to `ts` and `type`.
    pub fn record(&self, event: AuditEvent, payload: Value) -> GatewayResult<()> {
        let mut line = serde_json::Map::new();
        line.insert("ts".into(), Value::String(chrono::Utc::now().to_rfc3339()));
        line.insert("type".into(), serde_json::to_value(event)?);
        if let Value::Object(fields) = payload {
            for (k, v) in fields {
                line.entry(k).or_insert(v);
            }
        }

        let mut guard = self.file.lock();
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = open_append_0600(&self.path)?;
            *guard = Some(file);
        }
        let file = guard.as_mut().unwrap();
        let mut buf = serde_json::to_vec(&Value::Object(line))?;
        buf.push(b'\n');
        file.write_all(&buf)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(unix)]
fn open_append_0600(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new().create(true).append(true).mode(0o600).open(path)
}

#[cfg(not(unix))]
fn open_append_0600(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
