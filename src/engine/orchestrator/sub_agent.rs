// Clawdbot Gateway — Sub-Agent Runner
//
// Executes one delegated task as an independent runtime run on a
// derived session (`{prefix}-{parent}`). A failing sub-agent never
// fails the orchestrator — its slot carries the error.

use super::tools::DelegationTarget;
use super::AgentResultEntry;
use crate::engine::runtime::{AgentRuntime, RunParams};
use crate::engine::state::Env;
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;

/// One delegation request collected from the orchestrator's turn.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub target: DelegationTarget,
    pub task: String,
    pub context: Option<String>,
}

pub(crate) async fn run_sub_agent(
    env: Arc<Env>,
    runtime: Arc<dyn AgentRuntime>,
    parent_session_id: String,
    request: DelegationRequest,
) -> AgentResultEntry {
    let session_id = format!("{}-{}", request.target.prefix, parent_session_id);
    info!(
        "[orchestrator] Delegating to {} (session {}): {}",
        request.target.tag,
        session_id,
        crate::engine::types::truncate_utf8(&request.task, 120)
    );

    let mut prompt = format!("Your assigned task: {}", request.task);
    if let Some(context) = &request.context {
        if !context.is_empty() {
            prompt.push_str("\n\nAdditional context:\n");
            prompt.push_str(context);
        }
    }

    let mut params = RunParams::for_prompt(env.config.clone(), prompt);
    params.session_id = session_id.clone();
    params.timeout_ms = env.config.agent_timeout_secs * 1000;
    params.abort = Some(env.abort.child_token());
    params.extra_system_prompt = Some(format!(
        "You are the {} sub-agent, working on one delegated task for an orchestrator. \
         Focus on completing the task thoroughly; your final message is your report back.",
        request.target.tag
    ));

    let started = Instant::now();
    match runtime.run(params).await {
        Ok(result) => AgentResultEntry {
            agent: request.target.tag.to_string(),
            session_id,
            status: "ok".into(),
            output: Some(result.text()),
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        },
        Err(e) => {
            warn!("[orchestrator] Sub-agent {} failed: {}", request.target.tag, e);
            AgentResultEntry {
                agent: request.target.tag.to_string(),
                session_id,
                status: "error".into(),
                output: None,
                error: Some(e.to_string()),
                duration_ms: started.elapsed().as_millis() as u64,
            }
        }
    }
}
