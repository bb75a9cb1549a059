// ── Clawdbot Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the gateway, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, Network, Channel, Tool…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • No variant carries secret material (API keys, tokens) in its message.
//   • `Cancelled` is special: it unwinds a turn instead of being contained,
//     so code that contains errors must check `is_cancelled()` first.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Tool execution failure.
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Channel / transport adapter failure.
    #[error("Channel error: {channel}: {message}")]
    Channel { channel: String, message: String },

    /// Gateway or account configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication / authorization failure (OTP, pairing, tokens).
    #[error("Auth error: {0}")]
    Auth(String),

    /// Security policy violation (dangerous command, sensitive path, secret).
    #[error("Security error: {0}")]
    Security(String),

    /// A rate limiter denied the operation.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The turn was cancelled via its abort signal or timed out.
    /// Never contained — always unwinds to the supervisor.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl GatewayError {
    /// Create a tool error with name and message.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool { tool: tool.into(), message: message.into() }
    }

    /// Create a channel error with name and message.
    pub fn channel(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel { channel: channel.into(), message: message.into() }
    }

    /// True if this error is a cancellation and must not be contained.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Cancelled(_))
    }
}

// ── Migration bridge: String → GatewayError ────────────────────────────────
// Allows `?` and `.into()` on plain message strings where no richer variant
// applies yet.

impl From<String> for GatewayError {
    fn from(s: String) -> Self {
        GatewayError::Other(s)
    }
}

impl From<&str> for GatewayError {
    fn from(s: &str) -> Self {
        GatewayError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All gateway operations should return this type.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_detected() {
        assert!(GatewayError::Cancelled("timeout".into()).is_cancelled());
        assert!(!GatewayError::Other("boom".into()).is_cancelled());
    }

    #[test]
    fn string_conversion_round_trip() {
        let err: GatewayError = "something failed".into();
        assert_eq!(err.to_string(), "something failed");
    }

    #[test]
    fn tool_error_formats_with_name() {
        let err = GatewayError::tool("exec", "command not found");
        assert_eq!(err.to_string(), "Tool error: exec: command not found");
    }
}
