// Clawdbot Gateway — Tool Hooks
//
// Plugins register handlers by name for two lifecycle points:
//   before_tool_call — may block the call or rewrite its params
//   after_tool_call  — observe-only, fire-and-forget
//
// Handlers are referenced by package name only; filesystem paths are
// refused at registration. Execution order is registration order, and
// it is deterministic.

use crate::atoms::error::{GatewayError, GatewayResult};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BeforeToolCall {
    /// Normalized tool name.
    pub tool_name: String,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub struct AfterToolCall {
    pub tool_name: String,
    /// The params that were actually executed (post rewrite).
    pub params: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What a before-hook wants done with the call.
#[derive(Debug, Clone, Default)]
pub struct HookDecision {
    pub block: bool,
    pub block_reason: Option<String>,
    /// Replacement params; subsequent steps see these.
    pub params: Option<Value>,
}

impl HookDecision {
    pub fn block(reason: impl Into<String>) -> Self {
        HookDecision { block: true, block_reason: Some(reason.into()), params: None }
    }

    pub fn rewrite(params: Value) -> Self {
        HookDecision { block: false, block_reason: None, params: Some(params) }
    }
}

pub type BeforeHook = Arc<dyn Fn(&BeforeToolCall) -> Option<HookDecision> + Send + Sync>;
pub type AfterHook = Arc<dyn Fn(&AfterToolCall) + Send + Sync>;

#[derive(Default)]
pub struct HookRunner {
    before: Vec<(String, BeforeHook)>,
    after: Vec<(String, AfterHook)>,
}

fn check_hook_name(name: &str) -> GatewayResult<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with('.')
        || name.contains("..")
    {
        return Err(GatewayError::Config(format!(
            "Hook handlers are referenced by package name, not path: {:?}",
            name
        )));
    }
    Ok(())
}

impl HookRunner {
    pub fn new() -> Self {
        HookRunner::default()
    }

    pub fn register_before(&mut self, name: &str, hook: BeforeHook) -> GatewayResult<()> {
        check_hook_name(name)?;
        self.before.push((name.to_string(), hook));
        Ok(())
    }

    pub fn register_after(&mut self, name: &str, hook: AfterHook) -> GatewayResult<()> {
        check_hook_name(name)?;
        self.after.push((name.to_string(), hook));
        Ok(())
    }

    /// Run before-hooks in registration order. The first block wins;
    /// param rewrites compose (each hook sees the previous rewrite).
    pub fn run_before(&self, tool_name: &str, params: Value) -> HookDecision {
        let mut current = params;
        for (_, hook) in &self.before {
            let event = BeforeToolCall { tool_name: tool_name.to_string(), params: current.clone() };
            match hook(&event) {
                Some(decision) if decision.block => return decision,
                Some(decision) => {
                    if let Some(new_params) = decision.params {
                        current = new_params;
                    }
                }
                None => {}
            }
        }
        HookDecision { block: false, block_reason: None, params: Some(current) }
    }

    /// Run after-hooks in registration order. Failures here never reach
    /// the caller — handlers are plain observers.
    pub fn run_after(&self, event: &AfterToolCall) {
        for (_, hook) in &self.after {
            hook(event);
        }
    }

    pub fn has_after_hooks(&self) -> bool {
        !self.after.is_empty()
    }
}
