// Clawdbot Gateway — Agent Runtime Boundary
//
// The abstract contract over model + tool execution backends. The core
// never talks to a provider directly: it hands a `RunParams` to an
// `AgentRuntime` and consumes streamed output through `RunCallbacks`.
//
// Callback ordering contract (backends that violate it are buggy):
//   • on_assistant_message_start precedes any on_partial_reply /
//     on_block_reply for that assistant message
//   • within one block, chunks arrive in order; on_block_reply_flush is
//     the close delimiter
//   • on_tool_result fires after the dispatch pipeline returns for the
//     corresponding call
//   • on_agent_event is free-form telemetry and carries no ordering
//     guarantee

mod mock;
mod registry;

pub use mock::{RecordedRun, ScriptedRuntime, ScriptedTurn};
pub use registry::RuntimeRegistry;

use crate::atoms::error::GatewayResult;
use crate::engine::config::GatewayConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ── Callbacks ──────────────────────────────────────────────────────────

pub type TextCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type UnitCallback = Arc<dyn Fn() + Send + Sync>;
pub type ToolResultCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub type AgentEventCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Clone)]
pub struct RunCallbacks {
    pub on_assistant_message_start: UnitCallback,
    pub on_partial_reply: TextCallback,
    pub on_block_reply: TextCallback,
    pub on_block_reply_flush: UnitCallback,
    pub on_reasoning_stream: TextCallback,
    pub on_tool_result: ToolResultCallback,
    pub on_agent_event: AgentEventCallback,
}

impl Default for RunCallbacks {
    fn default() -> Self {
        RunCallbacks {
            on_assistant_message_start: Arc::new(|| {}),
            on_partial_reply: Arc::new(|_| {}),
            on_block_reply: Arc::new(|_| {}),
            on_block_reply_flush: Arc::new(|| {}),
            on_reasoning_stream: Arc::new(|_| {}),
            on_tool_result: Arc::new(|_| {}),
            on_agent_event: Arc::new(|_, _| {}),
        }
    }
}

// ── Parameters ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerboseLevel {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// Reply threaded onto the triggering message where supported.
    #[default]
    Thread,
    /// Plain send into the conversation.
    Direct,
}

/// Where the triggering message came from, for backends that tailor
/// output to the transport.
#[derive(Debug, Clone, Default)]
pub struct MessagingContext {
    pub channel: String,
    pub account_id: String,
    pub group_id: Option<String>,
    pub thread_id: Option<String>,
    pub reply_mode: ReplyMode,
    /// Whether something was already posted for this turn (an ack).
    pub has_replied: bool,
}

#[derive(Clone)]
pub struct RunParams {
    pub session_id: String,
    pub session_key: String,
    /// The session store file this session lives in.
    pub session_file: PathBuf,
    pub workspace_dir: PathBuf,
    pub config: Arc<GatewayConfig>,
    pub prompt: String,
    pub images: Vec<String>,
    pub provider_override: Option<String>,
    pub model_override: Option<String>,
    pub auth_profile_override: Option<String>,
    pub thinking_level: ThinkingLevel,
    pub verbose_level: VerboseLevel,
    pub timeout_ms: u64,
    pub run_id: String,
    pub abort: Option<CancellationToken>,
    pub extra_system_prompt: Option<String>,
    pub messaging: MessagingContext,
    pub callbacks: RunCallbacks,
}

impl RunParams {
    /// Minimal params for one prompt; callers override what they need.
    pub fn for_prompt(config: Arc<GatewayConfig>, prompt: impl Into<String>) -> Self {
        RunParams {
            session_id: String::new(),
            session_key: String::new(),
            session_file: PathBuf::new(),
            workspace_dir: PathBuf::new(),
            config,
            prompt: prompt.into(),
            images: Vec::new(),
            provider_override: None,
            model_override: None,
            auth_profile_override: None,
            thinking_level: ThinkingLevel::default(),
            verbose_level: VerboseLevel::default(),
            timeout_ms: 600_000,
            run_id: uuid::Uuid::new_v4().to_string(),
            abort: None,
            extra_system_prompt: None,
            messaging: MessagingContext::default(),
            callbacks: RunCallbacks::default(),
        }
    }
}

// ── Result ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub duration_ms: u64,
    #[serde(default)]
    pub agent_meta: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    pub payloads: Vec<RunPayload>,
    pub meta: RunMeta,
}

impl RunResult {
    /// All non-error payload text, joined.
    pub fn text(&self) -> String {
        self.payloads
            .iter()
            .filter(|p| !p.is_error)
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── The contract ───────────────────────────────────────────────────────

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Stable backend identifier used for config selection.
    fn kind(&self) -> &str;
    fn display_name(&self) -> &str;

    /// Execute one turn. Must honor `params.abort` and `timeout_ms`,
    /// emit callbacks in the documented order, and clean up spawned
    /// resources on abort.
    async fn run(&self, params: RunParams) -> GatewayResult<RunResult>;
}

impl std::fmt::Debug for dyn AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("kind", &self.kind())
            .field("display_name", &self.display_name())
            .finish()
    }
}
