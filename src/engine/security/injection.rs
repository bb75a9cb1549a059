// Clawdbot Gateway — Prompt Injection Scanner
//
// Inbound channel text is scanned before it reaches the agent loop.
// Patterns detect system-prompt overrides, identity hijacks, fake
// system/admin directives, and encoded payload smuggling. Critical
// findings block the turn; lower severities are logged only.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct InjectionMatch {
    pub severity: InjectionSeverity,
    pub category: &'static str,
    pub matched_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InjectionScan {
    pub is_injection: bool,
    pub severity: Option<InjectionSeverity>,
    pub matches: Vec<InjectionMatch>,
}

struct Pattern {
    check: fn(&str) -> Option<String>,
    severity: InjectionSeverity,
    category: &'static str,
}

fn find_phrase(text: &str, verbs: &[&str], targets: &[&str]) -> Option<String> {
    let lower = text.to_lowercase();
    for verb in verbs {
        for target in targets {
            let phrase = format!("{} {}", verb, target);
            if lower.contains(&phrase) {
                return Some(phrase);
            }
        }
    }
    None
}

fn patterns() -> Vec<Pattern> {
    vec![
        Pattern {
            check: |t| {
                find_phrase(
                    t,
                    &["ignore", "disregard", "forget", "override"],
                    &[
                        "previous instructions",
                        "prior instructions",
                        "all instructions",
                        "your instructions",
                        "system prompt",
                        "your rules",
                    ],
                )
            },
            severity: InjectionSeverity::Critical,
            category: "override",
        },
        Pattern {
            check: |t| {
                let l = t.to_lowercase();
                ["you are now a", "you are now an", "you are now the"]
                    .iter()
                    .find(|p| l.contains(*p))
                    .map(|p| p.to_string())
            },
            severity: InjectionSeverity::Critical,
            category: "identity",
        },
        Pattern {
            check: |t| {
                let l = t.to_lowercase();
                ["system override", "admin override", "root command", "system directive"]
                    .iter()
                    .find(|p| l.contains(*p))
                    .map(|p| p.to_string())
            },
            severity: InjectionSeverity::Critical,
            category: "override",
        },
        Pattern {
            check: |t| {
                let l = t.to_lowercase();
                if l.contains("new instructions:") {
                    Some("new instructions:".into())
                } else {
                    None
                }
            },
            severity: InjectionSeverity::High,
            category: "override",
        },
        Pattern {
            check: |t| {
                let l = t.to_lowercase();
                ["reveal your system prompt", "print your instructions", "show me your prompt"]
                    .iter()
                    .find(|p| l.contains(*p))
                    .map(|p| p.to_string())
            },
            severity: InjectionSeverity::Medium,
            category: "exfiltration",
        },
        Pattern {
            // Long base64-looking runs smuggling an encoded payload.
            check: |t| {
                let (mut run, mut longest) = (0usize, 0usize);
                for c in t.chars() {
                    if c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=' {
                        run += 1;
                        longest = longest.max(run);
                    } else {
                        run = 0;
                    }
                }
                if longest >= 120 {
                    Some(format!("{}-char encoded run", longest))
                } else {
                    None
                }
            },
            severity: InjectionSeverity::Low,
            category: "encoding",
        },
    ]
}

/// Scan inbound text. `is_injection` is true only for critical findings;
/// everything found is reported for logging.
pub fn scan(text: &str) -> InjectionScan {
    let mut matches = Vec::new();
    for p in patterns() {
        if let Some(hit) = (p.check)(text) {
            matches.push(InjectionMatch {
                severity: p.severity,
                category: p.category,
                matched_text: hit,
            });
        }
    }
    let severity = matches.iter().map(|m| m.severity).max();
    InjectionScan {
        is_injection: severity == Some(InjectionSeverity::Critical),
        severity,
        matches,
    }
}
