// Clawdbot Gateway — daemon entrypoint
//
// Headless service: load config, build the process environment, start
// one supervisor per enabled transport account, run until SIGINT.

use clap::Parser;
use clawdbot::engine::channels::telegram::TelegramAdapter;
use clawdbot::engine::channels::webhook::WebhookAdapter;
use clawdbot::engine::config::GatewayConfig;
use clawdbot::engine::paths;
use clawdbot::engine::runtime::{RuntimeRegistry, ScriptedRuntime};
use clawdbot::engine::state::Env;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "clawdbot", version, about = "Multi-channel AI agent gateway")]
struct Args {
    /// Config file path (default: {state_dir}/config.json)
    #[arg(long, env = "CLAWDBOT_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// State directory (default: ~/.clawdbot, or CLAWDBOT_STATE_DIR)
    #[arg(long)]
    state_dir: Option<String>,

    /// Validate the config and exit.
    #[arg(long)]
    validate: bool,
}

fn load_config(path: &PathBuf) -> GatewayConfig {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) => GatewayConfig::parse(value),
            Err(e) => {
                warn!("[main] Config {} is not valid JSON ({}) — using defaults", path.display(), e);
                GatewayConfig::default()
            }
        },
        Err(_) => {
            info!("[main] No config at {} — using defaults", path.display());
            GatewayConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let state_dir = paths::resolve_state_dir(args.state_dir.as_deref());
    let config_path = args.config.clone().unwrap_or_else(|| state_dir.join("config.json"));
    let config = load_config(&config_path);

    // Fatal-config policy: invalid configuration exits non-zero before
    // anything starts.
    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("[main] Config error: {}", e);
        }
        std::process::exit(1);
    }
    if args.validate {
        info!("[main] Config OK");
        return;
    }

    let env = match Env::new(config, state_dir) {
        Ok(env) => env,
        Err(e) => {
            error!("[main] Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    // Runtime backends register here. The scripted backend ships for
    // dry runs; provider backends are linked by embedders.
    let mut registry = RuntimeRegistry::new();
    registry.register(Arc::new(ScriptedRuntime::with_reply(
        "The scripted runtime is active — configure a real runtime backend.",
    )));
    let runtime = match registry.select(&env.config.runtime_kind) {
        Ok(r) => r,
        Err(e) => {
            error!("[main] {}", e);
            std::process::exit(1);
        }
    };
    info!("[main] Using runtime backend '{}'", runtime.display_name());

    let mut supervisors = Vec::new();

    if env.config.telegram.enabled {
        for account_id in env.config.telegram.list_account_ids() {
            if !env.config.telegram.is_enabled(&account_id, "telegram") {
                info!("[main] Telegram account '{}' disabled — skipping", account_id);
                continue;
            }
            match TelegramAdapter::new(env.clone(), runtime.clone(), &account_id) {
                Ok(adapter) => {
                    supervisors.push(tokio::spawn(async move {
                        if let Err(e) = adapter.monitor().await {
                            error!("[telegram] Account supervisor exited: {}", e);
                        }
                    }));
                }
                Err(e) => error!("[main] Telegram account '{}': {}", account_id, e),
            }
        }
    }

    if env.config.webhook.enabled {
        match WebhookAdapter::new(env.clone(), runtime.clone()) {
            Ok(adapter) => {
                supervisors.push(tokio::spawn(async move {
                    if let Err(e) = adapter.monitor().await {
                        error!("[webhook] Supervisor exited: {}", e);
                    }
                }));
            }
            Err(e) => error!("[main] Webhook endpoint: {}", e),
        }
    }

    if supervisors.is_empty() {
        error!("[main] No transports enabled — nothing to do");
        std::process::exit(1);
    }
    info!("[main] {} supervisor(s) running — Ctrl-C to stop", supervisors.len());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("[main] Signal handler failed: {}", e);
    }
    env.shutdown();

    // Bounded drain: supervisors observe the abort token and return.
    let drain = futures::future::join_all(supervisors);
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("[main] Drain timed out — exiting anyway");
    }
    info!("[main] Bye");
}
