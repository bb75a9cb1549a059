// Clawdbot Gateway — Tool Dispatch Pipeline
//
// Every tool call a model emits goes through here — this is the
// security enforcement point. Pipeline, in order:
//   1. before_tool_call hooks (block / param rewrite)
//   2. security pre-checks (dangerous-command detector + exec limiter)
//   3. schema validation, then execute
//   4. error containment (everything except cancellation)
//   5. after_tool_call hooks, fire-and-forget
//
// Guarantees: at most one execution per call id; hooks run in
// registration order; post-hooks observe the executed params.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::security::audit::{AuditEvent, AuditLog};
use crate::engine::security::dangerous;
use crate::engine::security::rate_limit::RateLimiter;
use crate::engine::tools::hooks::{AfterToolCall, HookRunner};
use crate::engine::tools::{normalize_tool_name, noop_update, validate_params, Tool};
use log::{debug, error, info};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

// ── Result shape ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchResult {
    Ok {
        tool: String,
        details: Value,
        result_for_assistant: String,
        duration_ms: u64,
    },
    Blocked {
        tool: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
    },
    RateLimited {
        tool: String,
        error: String,
    },
    Error {
        tool: String,
        error: String,
    },
}

#[derive(Clone)]
pub struct DispatchContext {
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
    pub signal: CancellationToken,
}

impl Default for DispatchContext {
    fn default() -> Self {
        DispatchContext { agent_id: None, session_key: None, signal: CancellationToken::new() }
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────────

const SEEN_CALL_IDS_CAP: usize = 10_000;

pub struct Dispatcher {
    hooks: Arc<HookRunner>,
    audit: Arc<AuditLog>,
    exec_limiter: Arc<RateLimiter>,
    seen_call_ids: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl Dispatcher {
    pub fn new(hooks: Arc<HookRunner>, audit: Arc<AuditLog>, exec_limiter: Arc<RateLimiter>) -> Self {
        Dispatcher {
            hooks,
            audit,
            exec_limiter,
            seen_call_ids: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// True the first time a call id is seen.
    fn claim_call_id(&self, call_id: &str) -> bool {
        let mut guard = self.seen_call_ids.lock();
        let (set, order) = &mut *guard;
        if !set.insert(call_id.to_string()) {
            return false;
        }
        order.push_back(call_id.to_string());
        while order.len() > SEEN_CALL_IDS_CAP {
            if let Some(old) = order.pop_front() {
                set.remove(&old);
            }
        }
        true
    }

    /// Run one tool call through the pipeline.
    ///
    /// `Err` is returned only for cancellation, which must unwind the
    /// turn; every other failure is contained in the result.
    pub async fn dispatch(
        &self,
        tool: Arc<dyn Tool>,
        call_id: &str,
        params: Value,
        ctx: &DispatchContext,
    ) -> GatewayResult<DispatchResult> {
        let tool_name = normalize_tool_name(tool.name()).to_string();

        if !self.claim_call_id(call_id) {
            debug!("[dispatch] Duplicate call id {} for {} — refusing re-execution", call_id, tool_name);
            return Ok(DispatchResult::Error {
                tool: tool_name,
                error: format!("call id {} was already executed", call_id),
            });
        }

        self.audit
            .record(
                AuditEvent::ToolInvoke,
                json!({
                    "tool": tool_name,
                    "callId": call_id,
                    "sessionKey": ctx.session_key,
                    "agentId": ctx.agent_id,
                }),
            )
            .ok();

        // ── 1. Pre-hooks ───────────────────────────────────────────────
        let decision = self.hooks.run_before(&tool_name, params);
        if decision.block {
            let reason = decision.block_reason.unwrap_or_else(|| "blocked by hook".into());
            info!("[dispatch] {} blocked by hook: {}", tool_name, reason);
            self.audit
                .record(
                    AuditEvent::ToolDenied,
                    json!({"tool": tool_name, "callId": call_id, "reason": reason}),
                )
                .ok();
            return Ok(DispatchResult::Blocked {
                tool: tool_name,
                error: reason,
                pattern: None,
                suggestion: None,
            });
        }
        let params = decision.params.unwrap_or(Value::Null);

        // ── 2. Security pre-checks ─────────────────────────────────────
        if tool_name == "exec" {
            let command = params.get("command").and_then(|c| c.as_str()).unwrap_or("");
            if let Some(hit) = dangerous::check_command(command) {
                info!("[dispatch] exec blocked: {} ({})", hit.pattern, hit.explanation);
                self.audit
                    .record(
                        AuditEvent::DangerousCommandBlocked,
                        json!({
                            "callId": call_id,
                            "pattern": hit.pattern,
                            "sessionKey": ctx.session_key,
                        }),
                    )
                    .ok();
                return Ok(DispatchResult::Blocked {
                    tool: tool_name,
                    error: hit.explanation.to_string(),
                    pattern: Some(hit.pattern.to_string()),
                    suggestion: hit.suggestion.map(String::from),
                });
            }

            let limiter_key = ctx.session_key.as_deref().unwrap_or("global");
            if !self.exec_limiter.check(limiter_key) {
                self.audit
                    .record(
                        AuditEvent::ToolDenied,
                        json!({"tool": "exec", "callId": call_id, "reason": "rate_limited"}),
                    )
                    .ok();
                return Ok(DispatchResult::RateLimited {
                    tool: tool_name,
                    error: "Too many shell commands — slow down and retry shortly".into(),
                });
            }
            self.audit
                .record(AuditEvent::ExecRun, json!({"callId": call_id, "sessionKey": ctx.session_key}))
                .ok();
        }

        // ── 3. Schema validation + execute ─────────────────────────────
        if let Err(problem) = validate_params(&tool.parameters_schema(), &params) {
            return Ok(DispatchResult::Error { tool: tool_name, error: problem });
        }

        let started = Instant::now();
        let outcome = tool
            .execute(call_id, params.clone(), ctx.signal.clone(), noop_update())
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // ── 4. Containment ─────────────────────────────────────────────
        let (result, after_result, after_error) = match outcome {
            Ok(output) => {
                let details = output.details.clone();
                (
                    DispatchResult::Ok {
                        tool: tool_name.clone(),
                        details: output.details,
                        result_for_assistant: output.result_for_assistant,
                        duration_ms,
                    },
                    Some(details),
                    None,
                )
            }
            Err(e) if e.is_cancelled() => {
                // Cancellation unwinds the turn; post-hooks are abandoned.
                return Err(e);
            }
            Err(e) => {
                let message = e.to_string();
                error!("[dispatch] {} failed: {}", tool_name, message);
                debug!("[dispatch] {} failure detail: {:?}", tool_name, e);
                (
                    DispatchResult::Error { tool: tool_name.clone(), error: message.clone() },
                    None,
                    Some(message),
                )
            }
        };

        // ── 5. Post-hooks, fire-and-forget ─────────────────────────────
        if self.hooks.has_after_hooks() {
            let hooks = self.hooks.clone();
            let event = AfterToolCall {
                tool_name,
                params,
                result: after_result,
                error: after_error,
                duration_ms,
            };
            tokio::spawn(async move {
                hooks.run_after(&event);
            });
        }

        Ok(result)
    }
}

// Keep the unused-variant lint honest: every status is constructed here.
impl DispatchResult {
    pub fn status(&self) -> &'static str {
        match self {
            DispatchResult::Ok { .. } => "ok",
            DispatchResult::Blocked { .. } => "blocked",
            DispatchResult::RateLimited { .. } => "rate_limited",
            DispatchResult::Error { .. } => "error",
        }
    }

    /// The string handed back to the model for this call.
    pub fn result_for_assistant(&self) -> String {
        match self {
            DispatchResult::Ok { result_for_assistant, .. } => result_for_assistant.clone(),
            DispatchResult::Blocked { error, suggestion, .. } => match suggestion {
                Some(s) => format!("Blocked: {}. {}", error, s),
                None => format!("Blocked: {}", error),
            },
            DispatchResult::RateLimited { error, .. } => format!("Rate limited: {}", error),
            DispatchResult::Error { error, .. } => format!("Error: {}", error),
        }
    }
}
