// Clawdbot Gateway — Daily Usage Tracker
//
// Per-model per-day counters backing the smart router's quota fallback.
// One JSON file per local day: usage/<YYYY-MM-DD>.json mapping
// model-id → count. Rollover is lazy: a new day simply reads (and then
// writes) a fresh file; prior-day files are left behind as history.

use crate::atoms::error::GatewayResult;
use crate::engine::paths;
use crate::engine::sessions::write_atomic;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

type Counters = BTreeMap<String, u64>;

pub struct UsageTracker {
    state_dir: PathBuf,
    agent_id: String,
    /// Serializes read-modify-write of the day file.
    lock: Mutex<()>,
}

impl UsageTracker {
    pub fn new(state_dir: &Path, agent_id: &str) -> Self {
        UsageTracker {
            state_dir: state_dir.to_path_buf(),
            agent_id: agent_id.to_string(),
            lock: Mutex::new(()),
        }
    }

    fn today() -> String {
        chrono::Local::now().format("%Y-%m-%d").to_string()
    }

    fn file_for(&self, date: &str) -> PathBuf {
        paths::usage_path(&self.state_dir, &self.agent_id, date)
    }

    fn load(&self, date: &str) -> Counters {
        std::fs::read_to_string(self.file_for(date))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Increment today's counter for a model; returns the new count.
    pub fn increment(&self, model_id: &str) -> GatewayResult<u64> {
        self.increment_on(model_id, &Self::today())
    }

    fn increment_on(&self, model_id: &str, date: &str) -> GatewayResult<u64> {
        let _guard = self.lock.lock();
        let mut counters = self.load(date);
        let count = counters.entry(model_id.to_string()).or_insert(0);
        *count += 1;
        let new_count = *count;
        let path = self.file_for(date);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &serde_json::to_vec_pretty(&counters)?)?;
        Ok(new_count)
    }

    /// Today's count for a model (0 if unused).
    pub fn count(&self, model_id: &str) -> u64 {
        self.count_on(model_id, &Self::today())
    }

    fn count_on(&self, model_id: &str, date: &str) -> u64 {
        self.load(date).get(model_id).copied().unwrap_or(0)
    }

    /// True iff the model's daily count has reached `limit`.
    /// A `None` limit means unlimited.
    pub fn is_at_limit(&self, model_id: &str, limit: Option<u64>) -> bool {
        match limit {
            Some(l) => self.count(model_id) >= l,
            None => false,
        }
    }
}
