// Clawdbot Gateway — Tool Contract & Registry
//
// A tool is {name, label, description, parameter schema, execute}.
// Execution returns {details, result_for_assistant}: `details` is
// serializable structure for logs/UI, `result_for_assistant` is the
// string fed back to the model. Tools must be re-entrant — the same
// tool runs concurrently with different call ids on different sessions.

pub mod dispatch;
pub mod exec;
pub mod fetch;
pub mod fs;
pub mod hooks;

use crate::atoms::error::GatewayResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub details: Value,
    pub result_for_assistant: String,
}

impl ToolOutput {
    pub fn text(result: impl Into<String>) -> Self {
        let result = result.into();
        ToolOutput { details: Value::Null, result_for_assistant: result }
    }
}

/// Progress callback. Tools may call it; delivery is best-effort and
/// must not be relied on.
pub type OnUpdate = Arc<dyn Fn(Value) + Send + Sync>;

pub fn noop_update() -> OnUpdate {
    Arc::new(|_| {})
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn label(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-schema object describing `params`.
    fn parameters_schema(&self) -> Value;

    /// Execute one call. Cancellation must be honored by returning a
    /// `Cancelled` error, never by reporting partial success.
    async fn execute(
        &self,
        call_id: &str,
        params: Value,
        signal: CancellationToken,
        on_update: OnUpdate,
    ) -> GatewayResult<ToolOutput>;
}

// ── Name normalization ─────────────────────────────────────────────────

/// Canonical tool name used in logs and policy decisions.
pub fn normalize_tool_name(name: &str) -> &str {
    match name {
        "bash" | "shell" | "sh" | "run_terminal_command" => "exec",
        "http_request" | "http" => "fetch",
        other => other,
    }
}

// ── Registry ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { tools: BTreeMap::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Resolve by raw or normalized name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .or_else(|| self.tools.get(normalize_tool_name(name)))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Tool definitions in the wire shape given to the model.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters_schema(),
                    }
                })
            })
            .collect()
    }
}

/// The built-in tool set for one session: shell, HTTP, and guarded file
/// access, all scoped to the session workspace. Runtime backends hand
/// these (plus their own) to the model and route every emitted call
/// through the dispatch pipeline.
pub fn builtin_registry(
    workspace: std::path::PathBuf,
    guard: Arc<crate::engine::security::fs_guard::FsGuard>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(exec::ExecTool::new(workspace.clone())));
    registry.register(Arc::new(fetch::FetchTool::new()));
    registry.register(Arc::new(fs::ReadFileTool::new(workspace.clone(), guard.clone())));
    registry.register(Arc::new(fs::WriteFileTool::new(workspace.clone(), guard.clone())));
    registry.register(Arc::new(fs::ListDirectoryTool::new(workspace, guard)));
    registry
}

// ── Schema validation ──────────────────────────────────────────────────

/// Validate model-supplied params against a declared schema: required
/// keys present, and present keys matching their declared primitive
/// type. Returns the first problem as a message.
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), String> {
    let Some(obj) = params.as_object() else {
        return Err("params must be an object".into());
    };
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(format!("missing required parameter '{}'", key));
            }
        }
    }
    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            let Some(decl) = props.get(key) else { continue };
            let Some(expected) = decl.get("type").and_then(|t| t.as_str()) else { continue };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("parameter '{}' must be a {}", key, expected));
            }
        }
    }
    Ok(())
}
