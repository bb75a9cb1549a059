// Clawdbot Gateway — Orchestrator
//
// The meta-agent: one user turn may fan out into N parallel sub-agent
// runs (coding, research, embedded assistant) whose results are merged
// into a composite response.
//
// Contract with the runtime: the orchestrator turn is a normal C6 run
// given the delegation tool definitions; the backend reports emitted
// delegation calls in `meta.agent_meta["delegations"]` as
// [{"tool": ..., "task": ..., "context"?}] instead of executing them.
//
//   tools.rs     — delegation tool definitions + target mapping
//   sub_agent.rs — derived-session sub-agent runner

pub mod sub_agent;
pub mod tools;

use crate::atoms::error::GatewayResult;
use crate::engine::runtime::{AgentRuntime, RunParams};
use crate::engine::state::Env;
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use sub_agent::{run_sub_agent, DelegationRequest};
use tools::{delegation_target, delegation_tools};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResultEntry {
    /// "embedded", "coding", "research", "moltbot".
    pub agent: String,
    pub session_id: String,
    /// "ok" or "error".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorOutcome {
    /// The orchestrator's own messages (its turn's text).
    pub messages: Vec<String>,
    pub agent_results: Vec<AgentResultEntry>,
    /// Composite presented to the user.
    pub summary: String,
}

fn orchestrator_system_prompt() -> String {
    let roster = delegation_tools()
        .iter()
        .map(|t| {
            format!(
                "- **{}**: {}",
                t["function"]["name"].as_str().unwrap_or(""),
                t["function"]["description"].as_str().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "## Orchestrator Mode\n\n\
         You coordinate specialist sub-agents. Decompose the user's request and \
         delegate the parts that fit a specialist:\n{}\n\n\
         Delegate in the same turn when parts are independent — they run in \
         parallel. If nothing needs delegation, just answer directly.",
        roster
    )
}

/// Parse the delegation list a backend reported in its run meta.
fn parse_delegations(agent_meta: &Value) -> Vec<DelegationRequest> {
    let Some(items) = agent_meta.get("delegations").and_then(|d| d.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let tool = item.get("tool")?.as_str()?;
            let Some(target) = delegation_target(tool) else {
                warn!("[orchestrator] Ignoring unknown delegation tool {:?}", tool);
                return None;
            };
            Some(DelegationRequest {
                target,
                task: item.get("task")?.as_str()?.to_string(),
                context: item.get("context").and_then(|c| c.as_str()).map(String::from),
            })
        })
        .collect()
}

fn summarize(messages: &[String], results: &[AgentResultEntry]) -> String {
    if results.iter().all(|r| r.agent == "embedded") {
        return messages.join("\n");
    }
    let mut parts: Vec<String> = Vec::new();
    for r in results {
        match (&r.output, &r.error) {
            (Some(output), _) if !output.is_empty() => {
                parts.push(format!("## {}\n{}", r.agent, output));
            }
            (_, Some(error)) => {
                parts.push(format!("## {}\n(failed: {})", r.agent, error));
            }
            _ => {}
        }
    }
    if parts.is_empty() {
        messages.join("\n")
    } else {
        parts.join("\n\n")
    }
}

/// Run one user turn through the orchestrator. Disabled → pass-through
/// to the default embedded runtime with a single `embedded` entry.
pub async fn orchestrate(
    user_message: &str,
    session_id: &str,
    env: &Arc<Env>,
    runtime: &Arc<dyn AgentRuntime>,
) -> GatewayResult<OrchestratorOutcome> {
    if !env.config.orchestrator.enabled {
        let mut params = RunParams::for_prompt(env.config.clone(), user_message);
        params.session_id = session_id.to_string();
        params.abort = Some(env.abort.child_token());
        let started = std::time::Instant::now();
        let result = runtime.run(params).await?;
        let text = result.text();
        return Ok(OrchestratorOutcome {
            messages: vec![text.clone()],
            agent_results: vec![AgentResultEntry {
                agent: "embedded".into(),
                session_id: session_id.to_string(),
                status: "ok".into(),
                output: Some(text.clone()),
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
            }],
            summary: text,
        });
    }

    // ── Orchestrator turn ──────────────────────────────────────────────
    let mut params = RunParams::for_prompt(env.config.clone(), user_message);
    params.session_id = format!("orchestrator-{}", session_id);
    params.model_override = env.config.orchestrator.model.clone();
    params.extra_system_prompt = Some(orchestrator_system_prompt());
    params.abort = Some(env.abort.child_token());
    let result = runtime.run(params).await?;

    let messages: Vec<String> =
        result.payloads.iter().filter_map(|p| p.text.clone()).collect();
    let delegations = parse_delegations(&result.meta.agent_meta);

    if delegations.is_empty() {
        // No tool calls: the orchestrator's text is the response.
        let summary = messages.join("\n");
        return Ok(OrchestratorOutcome {
            messages,
            agent_results: Vec::new(),
            summary,
        });
    }

    info!("[orchestrator] Fanning out {} delegation(s)", delegations.len());
    let futures: Vec<_> = delegations
        .into_iter()
        .map(|request| {
            run_sub_agent(env.clone(), runtime.clone(), session_id.to_string(), request)
        })
        .collect();
    let agent_results = futures::future::join_all(futures).await;

    let summary = summarize(&messages, &agent_results);
    Ok(OrchestratorOutcome { messages, agent_results, summary })
}
