// Clawdbot Gateway — Process Environment
//
// The single dependency-injection container built once at startup and
// handed to every component. Nothing in the engine reaches into a
// process-wide registry: loggers aside, all shared state (stores,
// trackers, limiters, hook runner, abort signal) lives here.

use crate::atoms::error::GatewayResult;
use crate::engine::config::{resolve_agent_max_concurrent, GatewayConfig};
use crate::engine::paths;
use crate::engine::router::SmartRouter;
use crate::engine::security::audit::{AuditEvent, AuditLog};
use crate::engine::security::fs_guard::{default_sensitive_paths, FsGuard};
use crate::engine::security::otp::OtpPolicy;
use crate::engine::security::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::engine::sessions::SessionStore;
use crate::engine::tools::dispatch::Dispatcher;
use crate::engine::tools::hooks::HookRunner;
use crate::engine::usage::UsageTracker;
use log::info;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Exec calls per session within a minute before the limiter pushes
/// back.
const EXEC_LIMIT_PER_MINUTE: u32 = 30;

pub struct Env {
    pub state_dir: PathBuf,
    pub config: Arc<GatewayConfig>,
    pub sessions: Arc<SessionStore>,
    pub usage: Arc<UsageTracker>,
    pub router: Arc<SmartRouter>,
    pub otp: Arc<OtpPolicy>,
    pub audit: Arc<AuditLog>,
    pub hooks: Arc<HookRunner>,
    pub dispatcher: Arc<Dispatcher>,
    pub fs_guard: Arc<FsGuard>,
    /// Bounds concurrent agent runs across all sessions of this agent.
    pub run_semaphore: Arc<Semaphore>,
    /// Broadcast to every supervisor on shutdown.
    pub abort: CancellationToken,
}

impl Env {
    pub fn new(config: GatewayConfig, state_dir: PathBuf) -> GatewayResult<Arc<Env>> {
        Self::with_hooks(config, state_dir, HookRunner::new())
    }

    /// Build the environment with pre-registered hooks.
    pub fn with_hooks(
        config: GatewayConfig,
        state_dir: PathBuf,
        hooks: HookRunner,
    ) -> GatewayResult<Arc<Env>> {
        let agent_id = config.agent_id.clone();
        std::fs::create_dir_all(paths::agent_dir(&state_dir, &agent_id))?;

        let config = Arc::new(config);
        let audit = Arc::new(AuditLog::new(paths::audit_path(&state_dir, &agent_id)));
        let usage = Arc::new(UsageTracker::new(&state_dir, &agent_id));
        let router = Arc::new(SmartRouter::new(config.router.clone(), usage.clone()));
        let otp = Arc::new(OtpPolicy::new(
            config.otp.clone(),
            paths::otp_state_path(&state_dir, &agent_id),
        ));
        let fs_guard = Arc::new(FsGuard::new(
            config.fs_guard_mode,
            default_sensitive_paths(&state_dir),
            audit.clone(),
        ));
        let hooks = Arc::new(hooks);
        let exec_limiter = Arc::new(RateLimiter::new(RateLimitPolicy {
            max_requests: EXEC_LIMIT_PER_MINUTE,
            window_ms: 60_000,
            block_duration_ms: None,
        }));
        let dispatcher =
            Arc::new(Dispatcher::new(hooks.clone(), audit.clone(), exec_limiter));
        let max_concurrent = resolve_agent_max_concurrent(&config);

        audit
            .record(
                AuditEvent::HardeningInit,
                json!({
                    "agentId": agent_id,
                    "fsGuardMode": config.fs_guard_mode,
                    "maxConcurrentRuns": max_concurrent,
                }),
            )
            .ok();
        info!(
            "[env] Initialized for agent '{}' (state={}, concurrency={})",
            agent_id,
            state_dir.display(),
            max_concurrent
        );

        Ok(Arc::new(Env {
            state_dir,
            config,
            sessions: Arc::new(SessionStore::new()),
            usage,
            router,
            otp,
            audit,
            hooks,
            dispatcher,
            fs_guard,
            run_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            abort: CancellationToken::new(),
        }))
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    /// Signal every supervisor to drain and stop.
    pub fn shutdown(&self) {
        info!("[env] Shutdown requested");
        self.abort.cancel();
    }
}
