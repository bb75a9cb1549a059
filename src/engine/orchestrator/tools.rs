// Clawdbot Gateway — Delegation Tool Definitions
//
// The orchestrator model sees the sub-agents as tools. Calling one does
// not execute inline — the runtime reports the calls back and the
// orchestrator fans them out in parallel after its turn.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegationTarget {
    /// Session-id prefix for the derived sub-agent session.
    pub prefix: &'static str,
    /// Tag carried on the aggregated result entry.
    pub tag: &'static str,
}

/// Resolve a delegation tool name to its target.
pub fn delegation_target(tool_name: &str) -> Option<DelegationTarget> {
    match tool_name {
        "delegate_to_opencode" => Some(DelegationTarget { prefix: "opencode", tag: "coding" }),
        "delegate_to_research" => Some(DelegationTarget { prefix: "research", tag: "research" }),
        "delegate_to_moltbot" => Some(DelegationTarget { prefix: "moltbot", tag: "moltbot" }),
        _ => None,
    }
}

fn delegation_tool(name: &str, description: &str) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "Clear, specific description of what the sub-agent should do"
                    },
                    "context": {
                        "type": "string",
                        "description": "Additional context, requirements, or constraints"
                    }
                },
                "required": ["task"]
            }
        }
    })
}

/// The delegation tool set handed to the orchestrator backend.
pub fn delegation_tools() -> Vec<Value> {
    vec![
        delegation_tool(
            "delegate_to_opencode",
            "Delegate a coding task (implementation, refactoring, debugging) to the coding agent.",
        ),
        delegation_tool(
            "delegate_to_research",
            "Delegate a research task (web search, source reading, synthesis) to the research agent.",
        ),
        delegation_tool(
            "delegate_to_moltbot",
            "Delegate a general assistant task to the embedded assistant.",
        ),
    ]
}
