// Clawdbot Gateway — Configuration & Multi-Account Resolution
//
// Parsing is total: any JSON value yields a config (defaults fill the
// gaps). Validation is separate and returns human-readable errors — an
// empty list means valid.
//
// Multi-account is the same pattern for every transport: a top-level
// default account (present iff top-level credentials resolve) plus
// named accounts under `accounts`, each inheriting the top-level
// settings with per-account overrides.

use crate::engine::router::RouterConfig;
use crate::engine::security::fs_guard::FsGuardMode;
use crate::engine::security::otp::OtpConfig;
use crate::engine::workspace::SandboxMode;
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ── Policies ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    #[default]
    Pairing,
    Allowlist,
    Open,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    #[default]
    Open,
    Allowlist,
    Disabled,
}

// ── Per-transport account config ───────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountOverrides {
    pub display_name: Option<String>,
    pub enabled: Option<bool>,
    /// Opaque to the core; the adapter validates it.
    pub credentials: Option<String>,
    pub dm_policy: Option<DmPolicy>,
    pub group_policy: Option<GroupPolicy>,
    pub allow_from: Option<Vec<String>>,
    /// Durable local state path (MLS databases and the like).
    pub db_path: Option<String>,
    /// Network environment tag ("production", "dev", …).
    pub network_env: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    pub enabled: bool,
    pub credentials: Option<String>,
    pub dm_policy: DmPolicy,
    pub group_policy: GroupPolicy,
    pub allow_from: Vec<String>,
    pub db_path: Option<String>,
    pub network_env: Option<String>,
    pub accounts: BTreeMap<String, AccountOverrides>,
}

/// Fully-resolved view of one account after inheritance.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAccount {
    pub account_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub credentials: Option<String>,
    pub dm_policy: DmPolicy,
    pub group_policy: GroupPolicy,
    pub allow_from: Vec<String>,
    pub db_path: String,
    pub network_env: Option<String>,
}

pub const DEFAULT_ACCOUNT: &str = "default";

impl TransportConfig {
    fn has_top_level_credentials(&self) -> bool {
        self.credentials.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// Union of the default account (iff top-level credentials resolve)
    /// and the named accounts.
    pub fn list_account_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if self.has_top_level_credentials() {
            ids.push(DEFAULT_ACCOUNT.to_string());
        }
        for key in self.accounts.keys() {
            if key != DEFAULT_ACCOUNT {
                ids.push(key.clone());
            }
        }
        ids
    }

    /// "default" if top-level credentials resolve, else the first named
    /// account, else None.
    pub fn resolve_default(&self) -> Option<String> {
        if self.has_top_level_credentials() {
            return Some(DEFAULT_ACCOUNT.to_string());
        }
        self.accounts.keys().next().cloned()
    }

    /// Strip an optional "<transport>:" prefix; empty / None maps to the
    /// default account.
    pub fn normalize_account_id(&self, raw: Option<&str>, transport: &str) -> Option<String> {
        let raw = raw.unwrap_or("").trim();
        let stripped = raw.strip_prefix(&format!("{}:", transport)).unwrap_or(raw);
        if stripped.is_empty() {
            self.resolve_default()
        } else {
            Some(stripped.to_string())
        }
    }

    /// Merge top-level defaults with per-account overrides. Named
    /// accounts without an explicit db path get a unique auto path
    /// `<base>/accounts/<id>/db`.
    pub fn resolve_account(&self, account_id: &str, base_dir: &str) -> Option<ResolvedAccount> {
        let overrides = if account_id == DEFAULT_ACCOUNT {
            if !self.has_top_level_credentials() && !self.accounts.contains_key(DEFAULT_ACCOUNT) {
                return None;
            }
            self.accounts.get(DEFAULT_ACCOUNT).cloned().unwrap_or_default()
        } else {
            self.accounts.get(account_id)?.clone()
        };

        let db_path = overrides
            .db_path
            .clone()
            .or_else(|| if account_id == DEFAULT_ACCOUNT { self.db_path.clone() } else { None })
            .unwrap_or_else(|| format!("{}/accounts/{}/db", base_dir, account_id));

        Some(ResolvedAccount {
            account_id: account_id.to_string(),
            display_name: overrides.display_name.clone().unwrap_or_else(|| account_id.to_string()),
            enabled: overrides.enabled.unwrap_or(true),
            credentials: overrides.credentials.clone().or_else(|| self.credentials.clone()),
            dm_policy: overrides.dm_policy.unwrap_or(self.dm_policy),
            group_policy: overrides.group_policy.unwrap_or(self.group_policy),
            allow_from: overrides.allow_from.clone().unwrap_or_else(|| self.allow_from.clone()),
            db_path,
            network_env: overrides.network_env.clone().or_else(|| self.network_env.clone()),
        })
    }

    /// True only if the account resolves AND is not explicitly disabled.
    pub fn is_enabled(&self, account_id: &str, base_dir: &str) -> bool {
        self.resolve_account(account_id, base_dir).map(|a| a.enabled).unwrap_or(false)
    }

    /// Cross-account validation: duplicate credentials and duplicate
    /// durable paths are errors; mixed network environments is a
    /// warning.
    pub fn validate_multi_account(&self, transport: &str, base_dir: &str) -> MultiAccountReport {
        let mut report = MultiAccountReport::default();
        let accounts: Vec<ResolvedAccount> = self
            .list_account_ids()
            .iter()
            .filter_map(|id| self.resolve_account(id, base_dir))
            .collect();

        let mut seen_creds: BTreeMap<String, String> = BTreeMap::new();
        let mut seen_paths: BTreeMap<String, String> = BTreeMap::new();
        let mut envs: Vec<String> = Vec::new();
        for account in &accounts {
            if let Some(creds) = &account.credentials {
                let fp = fingerprint(creds);
                if let Some(other) = seen_creds.insert(fp, account.account_id.clone()) {
                    report.errors.push(format!(
                        "{}: accounts '{}' and '{}' share the same credentials",
                        transport, other, account.account_id
                    ));
                }
            }
            if let Some(other) =
                seen_paths.insert(account.db_path.clone(), account.account_id.clone())
            {
                report.errors.push(format!(
                    "{}: accounts '{}' and '{}' share the same db path {}",
                    transport, other, account.account_id, account.db_path
                ));
            }
            if let Some(env) = &account.network_env {
                if !envs.contains(env) {
                    envs.push(env.clone());
                }
            }
        }
        if envs.len() > 1 {
            report.warnings.push(format!(
                "{}: accounts span multiple network environments ({})",
                transport,
                envs.join(", ")
            ));
        }
        report
    }
}

#[derive(Debug, Default)]
pub struct MultiAccountReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Credentials are compared by SHA-256 fingerprint so raw secrets never
/// sit in error paths.
fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

// ── Gateway config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelDefaults {
    pub primary: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub model: ModelDefaults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    pub enabled: bool,
    /// Orchestrator model — typically a fast router model.
    pub model: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig { enabled: false, model: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Agent identity this process serves.
    pub agent_id: String,
    pub agents: AgentsConfig,
    /// Bounded parallelism of the per-account sinks.
    pub max_concurrent_runs: u32,
    pub agent_timeout_secs: u64,
    pub sandbox: SandboxMode,
    pub fs_guard_mode: FsGuardMode,
    pub otp: OtpConfig,
    pub router: RouterConfig,
    pub orchestrator: OrchestratorConfig,
    /// Runtime backend kind ("pi", "claude-code", …).
    pub runtime_kind: String,
    pub telegram: TransportConfig,
    pub webhook: WebhookEndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookEndpointConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    /// Shared secret checked on every request.
    pub token: Option<String>,
}

impl Default for WebhookEndpointConfig {
    fn default() -> Self {
        WebhookEndpointConfig {
            enabled: false,
            bind_address: "127.0.0.1".into(),
            port: 3900,
            token: None,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            agent_id: "default".into(),
            agents: AgentsConfig::default(),
            max_concurrent_runs: 4,
            agent_timeout_secs: 600,
            sandbox: SandboxMode::Off,
            fs_guard_mode: FsGuardMode::Audit,
            otp: OtpConfig::default(),
            router: RouterConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            runtime_kind: "pi".into(),
            telegram: TransportConfig::default(),
            webhook: WebhookEndpointConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Total parse: any JSON value yields a config. Non-objects and
    /// unreadable shapes fall back to defaults.
    pub fn parse(value: serde_json::Value) -> GatewayConfig {
        if !value.is_object() {
            return GatewayConfig::default();
        }
        match serde_json::from_value::<GatewayConfig>(value) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("[config] Unreadable config ({}) — using defaults", e);
                GatewayConfig::default()
            }
        }
    }

    /// Validate. Empty list means valid. Warnings are logged here, not
    /// returned.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.agent_id.is_empty() {
            errors.push("agentId must not be empty".into());
        }
        if self.max_concurrent_runs == 0 {
            errors.push("maxConcurrentRuns must be at least 1".into());
        }
        if self.otp.enabled && self.otp.secret.is_empty() {
            errors.push("otp.secret is required when OTP is enabled".into());
        }
        if self.telegram.enabled && self.telegram.resolve_default().is_none() {
            errors.push("telegram is enabled but no account has credentials".into());
        }
        if self.webhook.enabled && self.webhook.token.as_deref().unwrap_or("").is_empty() {
            errors.push("webhook.token is required when the webhook endpoint is enabled".into());
        }
        for tier in &self.router.tiers {
            if tier.primary_model.is_empty() {
                errors.push(format!("router tier {:?} has an empty primary model", tier.tier));
            }
        }

        let report = self.telegram.validate_multi_account("telegram", "telegram");
        errors.extend(report.errors);
        for w in report.warnings {
            warn!("[config] {}", w);
        }
        errors
    }
}

/// Global cap on concurrent agent runs; transport-specific knobs inherit
/// from this.
pub fn resolve_agent_max_concurrent(cfg: &GatewayConfig) -> usize {
    cfg.max_concurrent_runs.max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn named(creds: &str) -> AccountOverrides {
        AccountOverrides { credentials: Some(creds.into()), ..Default::default() }
    }

    #[test]
    fn parse_accepts_any_input() {
        assert_eq!(GatewayConfig::parse(json!(null)).agent_id, "default");
        assert_eq!(GatewayConfig::parse(json!(42)).agent_id, "default");
        assert_eq!(GatewayConfig::parse(json!([1, 2])).agent_id, "default");
        let cfg = GatewayConfig::parse(json!({"agentId": "ops", "maxConcurrentRuns": 8}));
        assert_eq!(cfg.agent_id, "ops");
        assert_eq!(cfg.max_concurrent_runs, 8);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(GatewayConfig::default().validate().is_empty());
    }

    #[test]
    fn validation_reports_human_readable_errors() {
        let mut cfg = GatewayConfig::default();
        cfg.max_concurrent_runs = 0;
        cfg.telegram.enabled = true;
        let errors = cfg.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("maxConcurrentRuns")));
        assert!(errors.iter().any(|e| e.contains("telegram")));
    }

    #[test]
    fn list_account_ids_unions_default_and_named() {
        let mut t = TransportConfig { credentials: Some("tok".into()), ..Default::default() };
        t.accounts.insert("work".into(), named("tok2"));
        assert_eq!(t.list_account_ids(), vec!["default", "work"]);

        let mut no_top = TransportConfig::default();
        no_top.accounts.insert("work".into(), named("tok2"));
        assert_eq!(no_top.list_account_ids(), vec!["work"]);
    }

    #[test]
    fn resolve_default_prefers_top_level() {
        let t = TransportConfig { credentials: Some("tok".into()), ..Default::default() };
        assert_eq!(t.resolve_default().as_deref(), Some("default"));

        let mut named_only = TransportConfig::default();
        named_only.accounts.insert("alpha".into(), named("a"));
        named_only.accounts.insert("beta".into(), named("b"));
        assert_eq!(named_only.resolve_default().as_deref(), Some("alpha"));

        assert_eq!(TransportConfig::default().resolve_default(), None);
    }

    #[test]
    fn normalize_account_id_strips_transport_prefix() {
        let t = TransportConfig { credentials: Some("tok".into()), ..Default::default() };
        assert_eq!(t.normalize_account_id(Some("telegram:work"), "telegram").as_deref(), Some("work"));
        assert_eq!(t.normalize_account_id(Some("work"), "telegram").as_deref(), Some("work"));
        assert_eq!(t.normalize_account_id(Some(""), "telegram").as_deref(), Some("default"));
        assert_eq!(t.normalize_account_id(None, "telegram").as_deref(), Some("default"));
    }

    #[test]
    fn resolve_account_inherits_and_overrides() {
        let mut t = TransportConfig {
            credentials: Some("top-token".into()),
            dm_policy: DmPolicy::Allowlist,
            allow_from: vec!["1".into()],
            ..Default::default()
        };
        t.accounts.insert(
            "work".into(),
            AccountOverrides {
                credentials: Some("work-token".into()),
                dm_policy: Some(DmPolicy::Open),
                ..Default::default()
            },
        );

        let default = t.resolve_account("default", "tg").unwrap();
        assert_eq!(default.credentials.as_deref(), Some("top-token"));
        assert_eq!(default.dm_policy, DmPolicy::Allowlist);
        assert_eq!(default.allow_from, vec!["1".to_string()]);

        let work = t.resolve_account("work", "tg").unwrap();
        assert_eq!(work.credentials.as_deref(), Some("work-token"));
        assert_eq!(work.dm_policy, DmPolicy::Open);
        // Inherited allow-from.
        assert_eq!(work.allow_from, vec!["1".to_string()]);
        // Auto db path is unique per account.
        assert_eq!(work.db_path, "tg/accounts/work/db");

        assert!(t.resolve_account("missing", "tg").is_none());
    }

    #[test]
    fn is_enabled_requires_existence_and_not_disabled() {
        let mut t = TransportConfig { credentials: Some("tok".into()), ..Default::default() };
        t.accounts.insert(
            "off".into(),
            AccountOverrides { credentials: Some("x".into()), enabled: Some(false), ..Default::default() },
        );
        assert!(t.is_enabled("default", "tg"));
        assert!(!t.is_enabled("off", "tg"));
        assert!(!t.is_enabled("ghost", "tg"));
    }

    #[test]
    fn duplicate_credentials_and_paths_are_errors() {
        let mut t = TransportConfig { credentials: Some("same".into()), ..Default::default() };
        t.accounts.insert("work".into(), named("same"));
        let report = t.validate_multi_account("telegram", "tg");
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("share the same credentials"));

        let mut p = TransportConfig::default();
        p.accounts.insert(
            "a".into(),
            AccountOverrides {
                credentials: Some("ca".into()),
                db_path: Some("/same/db".into()),
                ..Default::default()
            },
        );
        p.accounts.insert(
            "b".into(),
            AccountOverrides {
                credentials: Some("cb".into()),
                db_path: Some("/same/db".into()),
                ..Default::default()
            },
        );
        let report = p.validate_multi_account("telegram", "tg");
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("db path"));
    }

    #[test]
    fn mixed_network_envs_is_a_warning_not_error() {
        let mut t = TransportConfig::default();
        t.accounts.insert(
            "a".into(),
            AccountOverrides {
                credentials: Some("ca".into()),
                network_env: Some("production".into()),
                ..Default::default()
            },
        );
        t.accounts.insert(
            "b".into(),
            AccountOverrides {
                credentials: Some("cb".into()),
                network_env: Some("dev".into()),
                ..Default::default()
            },
        );
        let report = t.validate_multi_account("xmtp", "x");
        assert!(report.errors.is_empty());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("network environments"));
    }

    #[test]
    fn max_concurrent_floor_is_one() {
        let mut cfg = GatewayConfig::default();
        cfg.max_concurrent_runs = 0;
        assert_eq!(resolve_agent_max_concurrent(&cfg), 1);
        cfg.max_concurrent_runs = 6;
        assert_eq!(resolve_agent_max_concurrent(&cfg), 6);
    }
}
