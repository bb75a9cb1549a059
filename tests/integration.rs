// Clawdbot Gateway — integration scenarios
//
// Cross-component flows that unit tests cannot cover: quota-aware
// prefix routing, dangerous-command containment through the live
// dispatcher, supervisor behavior under poll conflicts, OTP gating at
// the sink, per-session serialization, and orchestrator fan-out.

use clawdbot::atoms::error::{GatewayError, GatewayResult};
use clawdbot::engine::backoff::BackoffPolicy;
use clawdbot::engine::channels::sink::{ChannelSink, TransportSender};
use clawdbot::engine::channels::{
    classify_failover_reason, run_supervised, FailoverReason, SupervisorOpts,
};
use clawdbot::engine::config::GatewayConfig;
use clawdbot::engine::orchestrator;
use clawdbot::engine::router::{PrefixOverride, Tier};
use clawdbot::engine::runtime::{AgentRuntime, ScriptedRuntime, ScriptedTurn};
use clawdbot::engine::state::Env;
use clawdbot::engine::tools::dispatch::{DispatchContext, DispatchResult};
use clawdbot::engine::tools::exec::ExecTool;
use clawdbot::engine::types::{InboundMessage, PeerKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

// ── Helpers ────────────────────────────────────────────────────────────

struct RecordingSender {
    sent: Mutex<Vec<String>>,
}

impl RecordingSender {
    fn new() -> Arc<Self> {
        Arc::new(RecordingSender { sent: Mutex::new(Vec::new()) })
    }
    fn messages(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl TransportSender for RecordingSender {
    async fn send_text(&self, _msg: &InboundMessage, text: &str) -> GatewayResult<()> {
        self.sent.lock().push(text.to_string());
        Ok(())
    }
}

fn inbound(peer: &str, text: &str) -> InboundMessage {
    InboundMessage {
        transport: "telegram".into(),
        account_id: "default".into(),
        peer_id: peer.into(),
        username: Some("tester".into()),
        display_name: None,
        peer_kind: PeerKind::Dm,
        group_id: None,
        thread_id: None,
        text: text.into(),
        message_id: Some("1".into()),
        update_id: None,
        received_at: chrono::Utc::now().to_rfc3339(),
    }
}

async fn wait_idle(sink: &Arc<ChannelSink>) {
    for _ in 0..1000 {
        if sink.is_idle() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("sink never went idle");
}

fn audit_types(state_dir: &std::path::Path, agent: &str) -> Vec<String> {
    std::fs::read_to_string(clawdbot::engine::paths::audit_path(state_dir, agent))
        .unwrap_or_default()
        .lines()
        .map(|l| {
            serde_json::from_str::<Value>(l).unwrap()["type"].as_str().unwrap().to_string()
        })
        .collect()
}

// ── Scenario: prefix override under quota ──────────────────────────────

#[tokio::test]
async fn prefix_override_under_quota_falls_back() {
    let dir = tempdir().unwrap();
    let mut cfg = GatewayConfig::default();
    cfg.router.prefixes =
        vec![PrefixOverride { prefix: "!flash".into(), model: "google/gemini-flash".into() }];
    for d in &mut cfg.router.tiers {
        match d.tier {
            Tier::Tier1Fast => {
                d.primary_model = "google/gemini-flash".into();
                d.daily_limit = Some(10);
            }
            Tier::Tier3Complex => {
                d.fallback_models =
                    vec!["anthropic/claude-sonnet".into(), "google/gemini-pro".into()];
            }
            _ => {}
        }
    }
    let env = Env::new(cfg, dir.path().to_path_buf()).unwrap();

    // Exhaust the forced model's daily quota.
    for _ in 0..10 {
        env.usage.increment("google/gemini-flash").unwrap();
    }

    let result = env.router.route("!flash what time is it").await;
    assert_eq!(result.tier, Tier::Override);
    assert!(result.used_fallback);
    assert_eq!(result.model.as_deref(), Some("anthropic/claude-sonnet"));
    assert_eq!(result.clean_query.as_deref(), Some("what time is it"));
    assert!(result.error.is_none());
}

// ── Scenario: dangerous-command block via the live dispatcher ──────────

#[tokio::test]
async fn dangerous_command_is_blocked_and_audited() {
    let dir = tempdir().unwrap();
    let env = Env::new(GatewayConfig::default(), dir.path().to_path_buf()).unwrap();
    let exec = Arc::new(ExecTool::new(dir.path().join("ws")));

    let result = env
        .dispatcher
        .dispatch(
            exec,
            "call-1",
            json!({"command": "rm -rf / --no-preserve-root"}),
            &DispatchContext::default(),
        )
        .await
        .unwrap();

    match result {
        DispatchResult::Blocked { tool, .. } => assert_eq!(tool, "exec"),
        other => panic!("expected blocked, got {:?}", other),
    }
    let types = audit_types(dir.path(), "default");
    assert_eq!(types.iter().filter(|t| *t == "dangerous_command_blocked").count(), 1);
}

// ── Scenario: 409 getUpdates conflict keeps both supervisors alive ─────

#[tokio::test]
async fn conflicting_pollers_classify_as_rate_limit_and_survive() {
    assert_eq!(
        classify_failover_reason("409 getUpdates conflict: terminated by other getUpdates request"),
        Some(FailoverReason::RateLimit)
    );

    // Two supervisors racing on the same token: each sees 409s, backs
    // off, and keeps running until shutdown. Neither exits with an
    // error.
    let abort = CancellationToken::new();
    let mut handles = Vec::new();
    for name in ["a", "b"] {
        let abort = abort.clone();
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        handles.push(tokio::spawn(run_supervised(
            SupervisorOpts {
                channel: "telegram".into(),
                account_id: name.into(),
                policy: BackoffPolicy { initial_ms: 1, max_ms: 4, factor: 2.0, jitter: 0.0 },
                abort: abort.clone(),
            },
            move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::channel("telegram", "409 getUpdates conflict"))
                }
            },
        )));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    abort.cancel();
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.is_ok(), "supervisor must survive 409 storms");
    }
}

// ── Scenario: OTP expired with grace ───────────────────────────────────

#[tokio::test]
async fn otp_expired_within_grace_blocks_with_grace_hint() {
    let dir = tempdir().unwrap();

    // Last verified 24h10m ago: expired (24h interval) but inside the
    // 30-minute grace window.
    let last = chrono::Utc::now() - chrono::Duration::hours(24) - chrono::Duration::minutes(10);
    let state = json!({
        "users": {
            "42": {
                "lastVerifiedAt": last.to_rfc3339(),
                "firstSeenAt": last.to_rfc3339(),
            }
        }
    });
    let otp_path = clawdbot::engine::paths::otp_state_path(dir.path(), "default");
    std::fs::create_dir_all(otp_path.parent().unwrap()).unwrap();
    std::fs::write(&otp_path, state.to_string()).unwrap();

    let mut cfg = GatewayConfig::default();
    cfg.otp.enabled = true;
    cfg.otp.secret = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".into();
    cfg.otp.interval_hours = 24;
    cfg.otp.grace_period_minutes = 30;
    let env = Env::new(cfg, dir.path().to_path_buf()).unwrap();

    let runtime = Arc::new(ScriptedRuntime::with_reply("should not run"));
    let sender = RecordingSender::new();
    let sink = ChannelSink::new(env, runtime.clone(), sender.clone());

    sink.submit(inbound("42", "good morning"));
    wait_idle(&sink).await;

    assert!(runtime.recorded_runs().is_empty(), "agent run must not start");
    let sent = sender.messages();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("expired"), "got: {}", sent[0]);
    assert!(sent[0].contains("grace period active"), "got: {}", sent[0]);
}

// ── Scenario: per-session serialization ────────────────────────────────

#[tokio::test]
async fn second_turn_starts_only_after_first_completes() {
    let dir = tempdir().unwrap();
    let env = Env::new(GatewayConfig::default(), dir.path().to_path_buf()).unwrap();
    let runtime =
        Arc::new(ScriptedRuntime::with_reply("reply").with_delay(Duration::from_millis(50)));
    let sender = RecordingSender::new();
    let sink = ChannelSink::new(env, runtime.clone(), sender);

    sink.submit(inbound("7", "message one"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    sink.submit(inbound("7", "message two"));
    wait_idle(&sink).await;

    let runs = runtime.recorded_runs();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].prompt, "message one");
    assert_eq!(runs[1].prompt, "message two");
    assert!(
        runs[0].finished_at <= runs[1].started_at,
        "turn two must not start before turn one completes"
    );
}

// ── Scenario: orchestrator parallel delegation ─────────────────────────

#[tokio::test]
async fn orchestrator_fans_out_research_and_coding_in_parallel() {
    let dir = tempdir().unwrap();
    let mut cfg = GatewayConfig::default();
    cfg.orchestrator.enabled = true;
    cfg.orchestrator.model = Some("google/gemini-flash".into());
    let env = Env::new(cfg, dir.path().to_path_buf()).unwrap();

    let scripted = Arc::new(
        ScriptedRuntime::with_turns(vec![ScriptedTurn {
            blocks: vec!["splitting the work".into()],
            agent_meta: json!({"delegations": [
                {"tool": "delegate_to_research", "task": "research X"},
                {"tool": "delegate_to_opencode", "task": "implement Y"},
            ]}),
            fail: None,
        }])
        .with_delay(Duration::from_millis(30)),
    );
    let runtime: Arc<dyn AgentRuntime> = scripted.clone();

    let outcome = orchestrator::orchestrate("research X and implement Y", "parent", &env, &runtime)
        .await
        .unwrap();

    let mut tags: Vec<&str> = outcome.agent_results.iter().map(|r| r.agent.as_str()).collect();
    tags.sort();
    assert_eq!(tags, vec!["coding", "research"]);
    for entry in &outcome.agent_results {
        assert_eq!(entry.status, "ok");
        assert!(entry.duration_ms >= 30);
    }

    // Both sub-agent runs started within 50ms of each other.
    let runs = scripted.recorded_runs();
    assert_eq!(runs.len(), 3);
    let delta = runs[2]
        .started_at
        .saturating_duration_since(runs[1].started_at)
        .max(runs[1].started_at.saturating_duration_since(runs[2].started_at));
    assert!(delta < Duration::from_millis(50), "fan-out not parallel: {:?}", delta);
}

// ── Cross-component: full telegram-shaped flow through the sink ────────

#[tokio::test]
async fn full_flow_resolves_session_routes_and_replies() {
    let dir = tempdir().unwrap();
    let env = Env::new(GatewayConfig::default(), dir.path().to_path_buf()).unwrap();
    let runtime = Arc::new(ScriptedRuntime::with_reply("the answer is 42"));
    let sender = RecordingSender::new();
    let sink = ChannelSink::new(env.clone(), runtime.clone(), sender.clone());

    sink.submit(inbound("99", "what is the answer to everything"));
    wait_idle(&sink).await;

    // Reply delivered.
    assert_eq!(sender.messages(), vec!["the answer is 42".to_string()]);

    // Session persisted with a stable id, and audited.
    let store_path = clawdbot::engine::paths::sessions_path(dir.path(), "default");
    let map = env.sessions.load(&store_path).unwrap();
    let key = "agent:default:telegram:default:dm:99";
    assert!(map.contains_key(key));
    assert!(!map[key].session_id.is_empty());
    assert!(map[key].system_sent);
    assert!(audit_types(dir.path(), "default").contains(&"session_start".to_string()));

    // Usage counted against the default tier model.
    assert_eq!(env.usage.count("claude-sonnet-4-6"), 1);

    // A second message reuses the same session id.
    let first_id = map[key].session_id.clone();
    sink.submit(inbound("99", "and why"));
    wait_idle(&sink).await;
    let map = env.sessions.load(&store_path).unwrap();
    assert_eq!(map[key].session_id, first_id);
}
