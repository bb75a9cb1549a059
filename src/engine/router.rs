// Clawdbot Gateway — Smart Query Router
//
// Cost/latency-aware pre-filter that assigns each incoming user query
// to a model tier before the agent runtime is invoked. Routing order:
//   P0  prefix override ("!flash …", "sonnet: …")
//   P1  ordered rules (pattern and/or length bounds; skip / direct answer)
//   P2  category keyword detection (word boundaries)
//   P3  optional LLM router fallback (failures are swallowed)
//   P-default  TIER2_STANDARD
//
// Quota: every resolved model is checked against its tier's daily limit;
// an exhausted model falls back down the tier's fallback chain. The
// router never errors on quota — it flags `used_fallback` and, when no
// fallback is left, carries `error: "quota_exceeded_no_fallback"`.

use crate::atoms::error::GatewayResult;
use crate::engine::usage::UsageTracker;
use futures::future::BoxFuture;
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ── Tiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "TIER0_TRIVIAL")]
    Tier0Trivial,
    #[serde(rename = "TIER1_FAST")]
    Tier1Fast,
    #[serde(rename = "TIER2_STANDARD")]
    Tier2Standard,
    #[serde(rename = "TIER3_COMPLEX")]
    Tier3Complex,
    #[serde(rename = "OVERRIDE")]
    Override,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDescriptor {
    pub tier: Tier,
    pub primary_model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    /// Short acknowledgement posted while the turn runs, where supported.
    #[serde(default)]
    pub ack: Option<String>,
    /// Daily usage limit for the primary model; `None` = unlimited.
    #[serde(default)]
    pub daily_limit: Option<u64>,
}

// ── Config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixOverride {
    /// Case-insensitive prefix, e.g. "!flash" or "sonnet:".
    pub prefix: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterRule {
    pub name: String,
    /// Regex; anchored with word boundaries by the author where needed.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Regex flags; only "i" is meaningful.
    #[serde(default)]
    pub flags: Option<String>,
    /// Rule also matches when the query length satisfies these bounds.
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub tier: Option<Tier>,
    /// The caller should bypass the agent entirely.
    #[serde(default)]
    pub skip: bool,
    /// Canned response; still selects a tier for bookkeeping.
    #[serde(default)]
    pub direct_answer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    pub name: String,
    pub keywords: Vec<String>,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub prefixes: Vec<PrefixOverride>,
    #[serde(default)]
    pub rules: Vec<RouterRule>,
    #[serde(default)]
    pub categories: Vec<CategoryRule>,
    pub tiers: Vec<TierDescriptor>,
    /// Platforms whose messages can be edited in place after posting.
    #[serde(default)]
    pub edit_in_place_platforms: HashSet<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            prefixes: vec![],
            rules: vec![],
            categories: vec![],
            tiers: vec![
                TierDescriptor {
                    tier: Tier::Tier0Trivial,
                    primary_model: "gemini-3-flash".into(),
                    fallback_models: vec![],
                    ack: None,
                    daily_limit: None,
                },
                TierDescriptor {
                    tier: Tier::Tier1Fast,
                    primary_model: "gemini-3-flash".into(),
                    fallback_models: vec!["claude-3-haiku".into()],
                    ack: Some("⚡".into()),
                    daily_limit: None,
                },
                TierDescriptor {
                    tier: Tier::Tier2Standard,
                    primary_model: "claude-sonnet-4-6".into(),
                    fallback_models: vec!["gemini-3-flash".into()],
                    ack: None,
                    daily_limit: None,
                },
                TierDescriptor {
                    tier: Tier::Tier3Complex,
                    primary_model: "claude-opus-4-1".into(),
                    fallback_models: vec!["claude-sonnet-4-6".into(), "gemini-3-pro".into()],
                    ack: Some("🧠 thinking hard".into()),
                    daily_limit: None,
                },
            ],
            edit_in_place_platforms: ["telegram", "discord", "slack", "matrix"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

// ── Result ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RouterResult {
    pub tier: Tier,
    /// Resolved model: the tier primary, or a fallback under quota.
    pub model: Option<String>,
    pub ack: Option<String>,
    /// Where the decision came from: "prefix:x", "rule:y", "category:z",
    /// "llm", "default:no-match".
    pub source: String,
    pub used_fallback: bool,
    /// A skip-rule matched: answer without running the agent.
    pub skip: bool,
    pub direct_answer: Option<String>,
    /// Query with the routing prefix stripped, when one matched.
    pub clean_query: Option<String>,
    pub error: Option<String>,
}

/// Hint from the optional LLM router stage.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmRouteHint {
    pub tier: Tier,
    #[serde(default)]
    pub ack: Option<String>,
}

pub type LlmRouterFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, GatewayResult<LlmRouteHint>> + Send + Sync>;

// ── Router ─────────────────────────────────────────────────────────────

struct CompiledRule {
    rule: RouterRule,
    regex: Option<Regex>,
}

struct CompiledCategory {
    name: String,
    regex: Regex,
    tier: Tier,
}

pub struct SmartRouter {
    config: RouterConfig,
    rules: Vec<CompiledRule>,
    categories: Vec<CompiledCategory>,
    usage: Arc<UsageTracker>,
    llm_router: Option<LlmRouterFn>,
}

impl SmartRouter {
    pub fn new(config: RouterConfig, usage: Arc<UsageTracker>) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let regex = rule.pattern.as_ref().and_then(|p| {
                    let pattern = if rule.flags.as_deref().is_some_and(|f| f.contains('i')) {
                        format!("(?i){}", p)
                    } else {
                        p.clone()
                    };
                    match Regex::new(&pattern) {
                        Ok(r) => Some(r),
                        Err(e) => {
                            warn!("[router] Rule '{}' has a bad pattern: {}", rule.name, e);
                            None
                        }
                    }
                });
                CompiledRule { rule: rule.clone(), regex }
            })
            .collect();

        let categories = config
            .categories
            .iter()
            .filter_map(|c| {
                let joined = c.keywords.iter().map(|k| regex::escape(k)).collect::<Vec<_>>().join("|");
                match Regex::new(&format!(r"(?i)\b(?:{})\b", joined)) {
                    Ok(regex) => Some(CompiledCategory { name: c.name.clone(), regex, tier: c.tier }),
                    Err(e) => {
                        warn!("[router] Category '{}' failed to compile: {}", c.name, e);
                        None
                    }
                }
            })
            .collect();

        SmartRouter { config, rules, categories, usage, llm_router: None }
    }

    pub fn with_llm_router(mut self, f: LlmRouterFn) -> Self {
        self.llm_router = Some(f);
        self
    }

    fn descriptor(&self, tier: Tier) -> Option<&TierDescriptor> {
        self.config.tiers.iter().find(|d| d.tier == tier)
    }

    /// Daily limit applying to a model: the limit of the tier whose
    /// primary it is, if any.
    fn limit_for(&self, model: &str) -> Option<u64> {
        self.config
            .tiers
            .iter()
            .find(|d| d.primary_model == model)
            .and_then(|d| d.daily_limit)
    }

    /// Route a query. Pure in (query, config, usage-tracker state).
    pub async fn route(&self, query: &str) -> RouterResult {
        // ── P0: prefix override ────────────────────────────────────────
        let lower = query.to_lowercase();
        for p in &self.config.prefixes {
            let prefix = p.prefix.to_lowercase();
            if prefix.is_empty() {
                continue;
            }
            if lower.starts_with(&prefix) && query.is_char_boundary(p.prefix.len()) {
                let clean = query[p.prefix.len()..].trim_start().to_string();
                return self.prefix_result(p, clean);
            }
        }

        // ── P1: ordered rules, first match wins ────────────────────────
        for c in &self.rules {
            if !rule_matches(c, query) {
                continue;
            }
            let rule = &c.rule;
            let tier = rule.tier.unwrap_or(Tier::Tier0Trivial);
            let source = format!("rule:{}", rule.name);
            if rule.skip {
                return RouterResult {
                    tier,
                    model: None,
                    ack: None,
                    source,
                    used_fallback: false,
                    skip: true,
                    direct_answer: rule.direct_answer.clone(),
                    clean_query: None,
                    error: None,
                };
            }
            let mut result = self.create_result(tier, source);
            result.direct_answer = rule.direct_answer.clone();
            return result;
        }

        // ── P2: category detection ─────────────────────────────────────
        for c in &self.categories {
            if c.regex.is_match(query) {
                return self.create_result(c.tier, format!("category:{}", c.name));
            }
        }

        // ── P3: LLM router fallback ────────────────────────────────────
        if let Some(llm) = &self.llm_router {
            match llm(query.to_string()).await {
                Ok(hint) => {
                    let mut result = self.create_result(hint.tier, "llm".to_string());
                    if hint.ack.is_some() {
                        result.ack = hint.ack;
                    }
                    return result;
                }
                Err(e) => warn!("[router] LLM router failed, using default: {}", e),
            }
        }

        self.create_result(Tier::Tier2Standard, "default:no-match".to_string())
    }

    fn prefix_result(&self, p: &PrefixOverride, clean_query: String) -> RouterResult {
        let mut result = RouterResult {
            tier: Tier::Override,
            model: Some(p.model.clone()),
            ack: None,
            source: format!("prefix:{}", p.prefix),
            used_fallback: false,
            skip: false,
            direct_answer: None,
            clean_query: Some(clean_query),
            error: None,
        };
        if self.usage.is_at_limit(&p.model, self.limit_for(&p.model)) {
            // Forced model exhausted: borrow the TIER3 fallback chain.
            let chain = self
                .descriptor(Tier::Tier3Complex)
                .map(|d| d.fallback_models.clone())
                .unwrap_or_default();
            match self.first_under_limit(&chain) {
                Some(fallback) => {
                    info!(
                        "[router] Forced model {} at daily limit — falling back to {}",
                        p.model, fallback
                    );
                    result.model = Some(fallback);
                    result.used_fallback = true;
                }
                None => {
                    result.error = Some("quota_exceeded_no_fallback".into());
                }
            }
        }
        result
    }

    /// Resolve a tier into a concrete model, walking the fallback chain
    /// when the primary is at its daily limit. Never errors on quota.
    fn create_result(&self, tier: Tier, source: String) -> RouterResult {
        let Some(desc) = self.descriptor(tier) else {
            return RouterResult {
                tier,
                model: None,
                ack: None,
                source,
                used_fallback: false,
                skip: false,
                direct_answer: None,
                clean_query: None,
                error: Some(format!("no descriptor for tier {:?}", tier)),
            };
        };

        let mut model = Some(desc.primary_model.clone());
        let mut used_fallback = false;
        let mut error = None;
        if self.usage.is_at_limit(&desc.primary_model, desc.daily_limit) {
            match self.first_under_limit(&desc.fallback_models) {
                Some(fb) => {
                    info!(
                        "[router] {} at daily limit — falling back to {}",
                        desc.primary_model, fb
                    );
                    model = Some(fb);
                    used_fallback = true;
                }
                None => error = Some("quota_exceeded_no_fallback".into()),
            }
        }

        let ack = desc.ack.clone().map(|a| {
            if used_fallback {
                format!("{} (fallback)", a)
            } else {
                a
            }
        });

        RouterResult {
            tier,
            model,
            ack,
            source,
            used_fallback,
            skip: false,
            direct_answer: None,
            clean_query: None,
            error,
        }
    }

    fn first_under_limit(&self, chain: &[String]) -> Option<String> {
        chain
            .iter()
            .find(|m| !self.usage.is_at_limit(m, self.limit_for(m)))
            .cloned()
    }

    /// Strip a routing prefix, if the query carries one.
    pub fn cleanup_prompt(&self, query: &str) -> String {
        let lower = query.to_lowercase();
        for p in &self.config.prefixes {
            if lower.starts_with(&p.prefix.to_lowercase()) && query.is_char_boundary(p.prefix.len())
            {
                return query[p.prefix.len()..].trim_start().to_string();
            }
        }
        query.to_string()
    }

    /// Count one use of a model; returns the new daily count.
    pub fn increment_usage(&self, model_id: &str) -> GatewayResult<u64> {
        self.usage.increment(model_id)
    }

    /// Whether the platform supports editing a posted ack into the final
    /// reply (vs posting separate messages).
    pub fn supports_edit_in_place(&self, platform: &str) -> bool {
        self.config.edit_in_place_platforms.contains(platform)
    }
}

fn rule_matches(c: &CompiledRule, query: &str) -> bool {
    if let Some(regex) = &c.regex {
        if regex.is_match(query) {
            return true;
        }
    }
    let len = query.chars().count();
    let max_ok = c.rule.max_length.map(|m| len <= m);
    let min_ok = c.rule.min_length.map(|m| len >= m);
    match (max_ok, min_ok) {
        (None, None) => false,
        (a, b) => a.unwrap_or(true) && b.unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn router_with(config: RouterConfig, dir: &std::path::Path) -> SmartRouter {
        SmartRouter::new(config, Arc::new(UsageTracker::new(dir, "main")))
    }

    fn base_config() -> RouterConfig {
        let mut cfg = RouterConfig::default();
        cfg.prefixes = vec![
            PrefixOverride { prefix: "!flash".into(), model: "gemini-3-flash".into() },
            PrefixOverride { prefix: "sonnet:".into(), model: "claude-sonnet-4-6".into() },
        ];
        cfg.rules = vec![
            RouterRule {
                name: "greeting".into(),
                pattern: Some(r"^\s*(?:hi|hello|hey|yo)[\s!.]*$".into()),
                flags: Some("i".into()),
                skip: true,
                ..Default::default()
            },
            RouterRule {
                name: "ping".into(),
                pattern: Some(r"^ping$".into()),
                tier: Some(Tier::Tier0Trivial),
                direct_answer: Some("pong".into()),
                ..Default::default()
            },
            RouterRule {
                name: "short-query".into(),
                max_length: Some(12),
                tier: Some(Tier::Tier1Fast),
                ..Default::default()
            },
        ];
        cfg.categories = vec![CategoryRule {
            name: "coding".into(),
            keywords: vec!["refactor".into(), "compile".into(), "stacktrace".into()],
            tier: Tier::Tier3Complex,
        }];
        cfg
    }

    #[tokio::test]
    async fn prefix_override_strips_and_forces_model() {
        let dir = tempdir().unwrap();
        let r = router_with(base_config(), dir.path());
        let result = r.route("!flash what time is it").await;
        assert_eq!(result.tier, Tier::Override);
        assert_eq!(result.model.as_deref(), Some("gemini-3-flash"));
        assert_eq!(result.clean_query.as_deref(), Some("what time is it"));
        assert_eq!(result.source, "prefix:!flash");
        assert!(!result.used_fallback);
    }

    #[tokio::test]
    async fn prefix_is_case_insensitive() {
        let dir = tempdir().unwrap();
        let r = router_with(base_config(), dir.path());
        let result = r.route("SONNET: review this").await;
        assert_eq!(result.model.as_deref(), Some("claude-sonnet-4-6"));
        assert_eq!(result.clean_query.as_deref(), Some("review this"));
    }

    #[tokio::test]
    async fn skip_rule_bypasses_the_agent() {
        let dir = tempdir().unwrap();
        let r = router_with(base_config(), dir.path());
        let result = r.route("hello!").await;
        assert!(result.skip);
        assert_eq!(result.source, "rule:greeting");
    }

    #[tokio::test]
    async fn direct_answer_rule_selects_tier_for_bookkeeping() {
        let dir = tempdir().unwrap();
        let r = router_with(base_config(), dir.path());
        let result = r.route("ping").await;
        assert_eq!(result.direct_answer.as_deref(), Some("pong"));
        assert_eq!(result.tier, Tier::Tier0Trivial);
        assert!(!result.skip);
        assert!(result.model.is_some());
    }

    #[tokio::test]
    async fn length_bound_rule_matches() {
        let dir = tempdir().unwrap();
        let r = router_with(base_config(), dir.path());
        let result = r.route("weather?").await;
        assert_eq!(result.source, "rule:short-query");
        assert_eq!(result.tier, Tier::Tier1Fast);
    }

    #[tokio::test]
    async fn category_keywords_require_word_boundaries() {
        let dir = tempdir().unwrap();
        let r = router_with(base_config(), dir.path());

        let hit = r.route("please refactor this whole module for readability").await;
        assert_eq!(hit.source, "category:coding");
        assert_eq!(hit.tier, Tier::Tier3Complex);

        // "decompile" contains "compile" but not on a word boundary.
        let miss = r.route("can you explain what a decompiler does in detail").await;
        assert_ne!(miss.source, "category:coding");
    }

    #[tokio::test]
    async fn default_is_tier2() {
        let dir = tempdir().unwrap();
        let r = router_with(base_config(), dir.path());
        let result = r.route("summarize the attached research paper please").await;
        assert_eq!(result.tier, Tier::Tier2Standard);
        assert_eq!(result.source, "default:no-match");
    }

    #[tokio::test]
    async fn quota_fallback_on_tier() {
        let dir = tempdir().unwrap();
        let mut cfg = base_config();
        // Tier2 primary limited to 1/day.
        for d in &mut cfg.tiers {
            if d.tier == Tier::Tier2Standard {
                d.daily_limit = Some(1);
                d.ack = Some("working".into());
            }
        }
        let usage = Arc::new(UsageTracker::new(dir.path(), "main"));
        usage.increment("claude-sonnet-4-6").unwrap();
        let r = SmartRouter::new(cfg, usage);

        let result = r.route("summarize the attached research paper please").await;
        assert!(result.used_fallback);
        assert_eq!(result.model.as_deref(), Some("gemini-3-flash"));
        assert_eq!(result.ack.as_deref(), Some("working (fallback)"));
    }

    #[tokio::test]
    async fn prefix_under_quota_falls_back_to_tier3_chain() {
        let dir = tempdir().unwrap();
        let mut cfg = base_config();
        // Give the forced model a limit via its tier (flash is tier0/1 primary).
        for d in &mut cfg.tiers {
            if d.primary_model == "gemini-3-flash" {
                d.daily_limit = Some(1);
            }
        }
        let usage = Arc::new(UsageTracker::new(dir.path(), "main"));
        usage.increment("gemini-3-flash").unwrap();
        let r = SmartRouter::new(cfg, usage);

        let result = r.route("!flash what time is it").await;
        assert_eq!(result.tier, Tier::Override);
        assert!(result.used_fallback);
        // First TIER3 fallback that is under its limit.
        assert_eq!(result.model.as_deref(), Some("claude-sonnet-4-6"));
        assert_eq!(result.clean_query.as_deref(), Some("what time is it"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn llm_router_hint_is_honored_and_failure_swallowed() {
        let dir = tempdir().unwrap();
        let ok: LlmRouterFn = Arc::new(|_q| {
            Box::pin(async {
                Ok(LlmRouteHint { tier: Tier::Tier3Complex, ack: Some("deep dive".into()) })
            })
        });
        let r = router_with(base_config(), dir.path()).with_llm_router(ok);
        let result = r.route("an unusual question that matches nothing configured").await;
        assert_eq!(result.source, "llm");
        assert_eq!(result.tier, Tier::Tier3Complex);
        assert_eq!(result.ack.as_deref(), Some("deep dive"));

        let failing: LlmRouterFn =
            Arc::new(|_q| Box::pin(async { Err("router model offline".into()) }));
        let r = router_with(base_config(), dir.path()).with_llm_router(failing);
        let result = r.route("an unusual question that matches nothing configured").await;
        assert_eq!(result.source, "default:no-match");
        assert_eq!(result.tier, Tier::Tier2Standard);
    }

    #[test]
    fn edit_in_place_platforms() {
        let dir = tempdir().unwrap();
        let r = router_with(RouterConfig::default(), dir.path());
        assert!(r.supports_edit_in_place("telegram"));
        assert!(!r.supports_edit_in_place("webhook"));
    }

    #[test]
    fn cleanup_prompt_strips_only_known_prefixes() {
        let dir = tempdir().unwrap();
        let r = router_with(base_config(), dir.path());
        assert_eq!(r.cleanup_prompt("!flash tell me a joke"), "tell me a joke");
        assert_eq!(r.cleanup_prompt("no prefix here"), "no prefix here");
    }
}
