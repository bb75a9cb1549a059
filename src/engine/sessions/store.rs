// Clawdbot Gateway — Durable Session Store
//
// A JSON object file mapping session-key → session entry, rewritten
// atomically (temp file + rename). Concurrency contract:
//   • in-process writers serialize on a per-path mutex
//   • cross-process writers serialize on an advisory lock held on a
//     sidecar `<path>.lock` file for the whole read-modify-write
//   • unknown fields ride through untouched (forward compatibility)
//
// A malformed store file is quarantined (renamed `.corrupt.<ts>`) and
// replaced with an empty map. That is a logged warning, not fatal.

use crate::atoms::error::GatewayResult;
use fs4::fs_std::FileExt;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── Session entry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    /// Opaque unique identifier. Never changes after first assignment.
    pub session_id: String,
    pub created_at: String,
    pub updated_at: String,
    /// Channel the most recent event arrived on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    /// Channel the session was first created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_of_origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Parent session id for sub-agent sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_profile_id: Option<String>,
    /// Skills enabled for this session at last resolution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills_snapshot: Vec<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub context_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Monotonically non-decreasing; merged by max.
    #[serde(default)]
    pub compaction_count: u64,
    /// Whether the system prompt has been delivered for this session.
    #[serde(default)]
    pub system_sent: bool,
    /// Last streamed chunk marker, for idempotent resends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_chunk: Option<Value>,
    /// Fields this build does not understand. Preserved verbatim so newer
    /// writers can round-trip through older ones.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub type SessionMap = BTreeMap<String, SessionEntry>;

// ── Patch ──────────────────────────────────────────────────────────────

/// A partial update applied through `SessionStore::merge`. `None` fields
/// leave the existing value alone.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub session_id: Option<String>,
    pub updated_at: Option<String>,
    pub last_channel: Option<String>,
    pub channel_of_origin: Option<String>,
    pub group_id: Option<String>,
    pub group_channel: Option<String>,
    pub space: Option<String>,
    pub thread_id: Option<String>,
    pub spawned_by: Option<String>,
    pub provider_override: Option<String>,
    pub model_override: Option<String>,
    pub auth_profile_id: Option<String>,
    pub skills_snapshot: Option<Vec<String>>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub context_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub compaction_count: Option<u64>,
    pub system_sent: Option<bool>,
    pub last_chunk: Option<Value>,
    pub extra: Map<String, Value>,
}

// ── Store ──────────────────────────────────────────────────────────────

/// Handle to the on-disk session stores. One instance per process, owned
/// by the `Env`; hands out a per-path mutex so concurrent in-process
/// updates to the same file serialize.
pub struct SessionStore {
    path_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        SessionStore { path_locks: Mutex::new(HashMap::new()) }
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.path_locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load the session map at `path`. Missing file → empty map.
    /// A malformed file is quarantined and replaced by an empty map.
    pub fn load(&self, path: &Path) -> GatewayResult<SessionMap> {
        let raw = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SessionMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<SessionMap>(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                let quarantine = quarantine_path(path);
                warn!(
                    "[sessions] Store {} is malformed ({}) — quarantining to {}",
                    path.display(),
                    e,
                    quarantine.display()
                );
                fs::rename(path, &quarantine)?;
                Ok(SessionMap::new())
            }
        }
    }

    /// Atomically mutate the store at `path`: read, apply `mutator` to a
    /// working copy, write via temp-file rename. Serialized per path
    /// in-process and via an advisory file lock across processes.
    /// Returns the map as written.
    pub fn update<F>(&self, path: &Path, mutator: F) -> GatewayResult<SessionMap>
    where
        F: FnOnce(&mut SessionMap),
    {
        let path_lock = self.lock_for(path);
        let _in_process = path_lock.lock();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Advisory cross-process lock on a sidecar file, held for the
        // whole read-modify-write.
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path(path))?;
        lock_file.lock_exclusive()?;

        let result: GatewayResult<SessionMap> = (|| {
            let mut map = self.load(path)?;
            mutator(&mut map);
            write_atomic(path, &serde_json::to_vec_pretty(&map)?)?;
            Ok(map)
        })();

        if let Err(e) = fs4::fs_std::FileExt::unlock(&lock_file) {
            debug!("[sessions] Unlock {} failed: {}", path.display(), e);
        }
        result
    }

    /// Merge a patch into an existing entry. Patch wins field-by-field,
    /// except: session id and created-at keep the earlier value,
    /// compaction count and timestamps merge by max, and unknown fields
    /// from both sides are preserved (patch entries override).
    pub fn merge(existing: &SessionEntry, patch: &SessionPatch) -> SessionEntry {
        let mut merged = existing.clone();

        // The earlier identity wins: only adopt the patch session id when
        // the entry has never been assigned one.
        if merged.session_id.is_empty() {
            if let Some(id) = &patch.session_id {
                merged.session_id = id.clone();
            }
        }
        if merged.created_at.is_empty() {
            merged.created_at = patch.updated_at.clone().unwrap_or_default();
        }
        if let Some(ts) = &patch.updated_at {
            if timestamp_max(&merged.updated_at, ts) {
                merged.updated_at = ts.clone();
            }
        }

        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = &patch.$field {
                    merged.$field = Some(v.clone());
                }
            };
        }
        take!(last_channel);
        take!(channel_of_origin);
        take!(group_id);
        take!(group_channel);
        take!(space);
        take!(thread_id);
        take!(spawned_by);
        take!(provider_override);
        take!(model_override);
        take!(auth_profile_id);

        if let Some(skills) = &patch.skills_snapshot {
            merged.skills_snapshot = skills.clone();
        }
        if let Some(v) = patch.input_tokens {
            merged.input_tokens = v;
        }
        if let Some(v) = patch.output_tokens {
            merged.output_tokens = v;
        }
        if let Some(v) = patch.context_tokens {
            merged.context_tokens = v;
        }
        if let Some(v) = patch.total_tokens {
            merged.total_tokens = v;
        }
        // total-tokens invariant: ≥ max(input+output, context)
        merged.total_tokens = merged
            .total_tokens
            .max(merged.input_tokens + merged.output_tokens)
            .max(merged.context_tokens);

        if let Some(v) = patch.compaction_count {
            merged.compaction_count = merged.compaction_count.max(v);
        }
        if let Some(v) = patch.system_sent {
            merged.system_sent = v;
        }
        if let Some(v) = &patch.last_chunk {
            merged.last_chunk = Some(v.clone());
        }
        for (k, v) in &patch.extra {
            merged.extra.insert(k.clone(), v.clone());
        }
        merged
    }
}

// ── File helpers ───────────────────────────────────────────────────────

fn lock_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(".lock");
    PathBuf::from(p)
}

fn quarantine_path(path: &Path) -> PathBuf {
    let ts = chrono::Utc::now().timestamp();
    let mut p = path.as_os_str().to_os_string();
    p.push(format!(".corrupt.{}", ts));
    PathBuf::from(p)
}

/// Write bytes to `path` atomically: temp file in the same directory,
/// flushed, then renamed over the target.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = {
        let mut p = path.as_os_str().to_os_string();
        p.push(format!(".tmp.{}", std::process::id()));
        PathBuf::from(p)
    };
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// True if candidate `b` is at or after `a` (RFC 3339). Unparseable
/// values are treated as older so a valid timestamp always wins.
fn timestamp_max(a: &str, b: &str) -> bool {
    use chrono::DateTime;
    match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
        (Ok(ta), Ok(tb)) => tb >= ta,
        (Err(_), Ok(_)) => true,
        (Ok(_), Err(_)) => false,
        (Err(_), Err(_)) => b >= a,
    }
}
