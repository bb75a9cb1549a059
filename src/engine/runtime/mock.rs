// Clawdbot Gateway — Scripted Runtime
//
// A deterministic AgentRuntime used by tests and dry runs: replays
// canned turns through the real callback sequence, honors abort and
// timeout, and records every run it receives. No network, no model.

use super::{AgentRuntime, RunMeta, RunParams, RunPayload, RunResult};
use crate::atoms::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One canned turn.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub blocks: Vec<String>,
    /// Reported as `meta.agent_meta` (e.g. orchestrator delegations).
    pub agent_meta: Value,
    /// When set, the turn fails with this message instead of replying.
    pub fail: Option<String>,
}

impl ScriptedTurn {
    pub fn reply(blocks: Vec<String>) -> Self {
        ScriptedTurn { blocks, agent_meta: Value::Null, fail: None }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        ScriptedTurn { blocks: Vec::new(), agent_meta: Value::Null, fail: Some(message.into()) }
    }
}

/// One observed `run()` invocation.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub prompt: String,
    pub session_id: String,
    pub session_key: String,
    pub model_override: Option<String>,
    pub started_at: Instant,
    pub finished_at: Instant,
}

pub struct ScriptedRuntime {
    /// Queued turns; when exhausted, `default_reply` is used.
    turns: Mutex<VecDeque<ScriptedTurn>>,
    default_reply: String,
    /// Artificial per-turn latency, for ordering tests.
    delay: Duration,
    runs: Mutex<Vec<RecordedRun>>,
}

impl ScriptedRuntime {
    pub fn with_reply(reply: impl Into<String>) -> Self {
        ScriptedRuntime {
            turns: Mutex::new(VecDeque::new()),
            default_reply: reply.into(),
            delay: Duration::ZERO,
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Each script is the block list for one turn, consumed FIFO.
    pub fn with_scripts(scripts: Vec<Vec<String>>) -> Self {
        Self::with_turns(scripts.into_iter().map(ScriptedTurn::reply).collect())
    }

    pub fn with_turns(turns: Vec<ScriptedTurn>) -> Self {
        ScriptedRuntime {
            turns: Mutex::new(turns.into()),
            default_reply: "ok".into(),
            delay: Duration::ZERO,
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn recorded_runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().clone()
    }

    fn record(&self, params: &RunParams, started_at: Instant) -> Instant {
        let finished_at = Instant::now();
        self.runs.lock().push(RecordedRun {
            prompt: params.prompt.clone(),
            session_id: params.session_id.clone(),
            session_key: params.session_key.clone(),
            model_override: params.model_override.clone(),
            started_at,
            finished_at,
        });
        finished_at
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    fn kind(&self) -> &str {
        "scripted"
    }

    fn display_name(&self) -> &str {
        "Scripted (test)"
    }

    async fn run(&self, params: RunParams) -> GatewayResult<RunResult> {
        let started_at = Instant::now();
        let turn = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::reply(vec![self.default_reply.clone()]));

        if !self.delay.is_zero() {
            let sleep = tokio::time::sleep(self.delay);
            match &params.abort {
                Some(token) => {
                    tokio::select! {
                        _ = sleep => {}
                        _ = token.cancelled() => {
                            self.record(&params, started_at);
                            return Err(GatewayError::Cancelled("run aborted".into()));
                        }
                    }
                }
                None => sleep.await,
            }
        }
        if started_at.elapsed().as_millis() as u64 > params.timeout_ms {
            self.record(&params, started_at);
            return Err(GatewayError::Cancelled("run timed out".into()));
        }

        if let Some(message) = &turn.fail {
            self.record(&params, started_at);
            return Err(GatewayError::Other(message.clone()));
        }

        (params.callbacks.on_assistant_message_start)();
        let mut payloads = Vec::new();
        for block in &turn.blocks {
            (params.callbacks.on_block_reply)(block);
            payloads.push(RunPayload { text: Some(block.clone()), is_error: false });
        }
        (params.callbacks.on_block_reply_flush)();

        let finished_at = self.record(&params, started_at);
        Ok(RunResult {
            payloads,
            meta: RunMeta {
                duration_ms: finished_at.duration_since(started_at).as_millis() as u64,
                agent_meta: turn.agent_meta,
            },
        })
    }
}
