// Clawdbot Gateway — Inbound Webhook Adapter
//
// Lets external systems (automation platforms, CI, curl) POST a message
// and get the agent's reply in the HTTP response. Raw
// `tokio::net::TcpListener`, no framework: one fixed path, bearer-token
// auth on every request, token-bucket rate limiting per source IP.
//
// Routes:
//   POST /webhook         — run the agent with the JSON body's message
//   GET  /webhook/health  — liveness probe (no auth)

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::channels::sink::{ChannelSink, TransportSender};
use crate::engine::runtime::AgentRuntime;
use crate::engine::security::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::engine::state::Env;
use crate::engine::types::{InboundMessage, PeerKind};
use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_REQUEST_BYTES: usize = 65_536;
const RATE_LIMIT_PER_MINUTE: u32 = 60;

// ── Request / response shapes ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WebhookRequest {
    message: String,
    #[serde(default = "default_user_id")]
    user_id: String,
}

fn default_user_id() -> String {
    "webhook".into()
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// ── Reply routing ──────────────────────────────────────────────────────

/// Webhook replies return in the HTTP response: each submitted event
/// registers a oneshot keyed by its message id, and the sink's sends
/// resolve it. Multiple sends for one turn are concatenated by the
/// waiter side before the oneshot resolves (the sink sends once per
/// turn in practice).
struct WebhookSender {
    pending: Mutex<HashMap<String, tokio::sync::oneshot::Sender<String>>>,
}

impl WebhookSender {
    fn new() -> Arc<Self> {
        Arc::new(WebhookSender { pending: Mutex::new(HashMap::new()) })
    }

    fn register(&self, message_id: &str) -> tokio::sync::oneshot::Receiver<String> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.lock().insert(message_id.to_string(), tx);
        rx
    }

    fn forget(&self, message_id: &str) {
        self.pending.lock().remove(message_id);
    }
}

#[async_trait]
impl TransportSender for WebhookSender {
    async fn send_text(&self, msg: &InboundMessage, text: &str) -> GatewayResult<()> {
        let Some(id) = &msg.message_id else { return Ok(()) };
        if let Some(tx) = self.pending.lock().remove(id) {
            let _ = tx.send(text.to_string());
        }
        Ok(())
    }
}

// ── Server ─────────────────────────────────────────────────────────────

pub struct WebhookAdapter {
    env: Arc<Env>,
    sink: Arc<ChannelSink>,
    sender: Arc<WebhookSender>,
    limiter: RateLimiter,
    token: String,
}

impl WebhookAdapter {
    pub fn new(env: Arc<Env>, runtime: Arc<dyn AgentRuntime>) -> GatewayResult<Arc<Self>> {
        let cfg = &env.config.webhook;
        let token = cfg
            .token
            .clone()
            .or_else(|| std::env::var("CLAWDBOT_GATEWAY_TOKEN").ok())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                GatewayError::Config("webhook.token (or CLAWDBOT_GATEWAY_TOKEN) is required".into())
            })?;
        let sender = WebhookSender::new();
        let sink = ChannelSink::new(env.clone(), runtime, sender.clone());
        Ok(Arc::new(WebhookAdapter {
            env,
            sink,
            sender,
            limiter: RateLimiter::new(RateLimitPolicy {
                max_requests: RATE_LIMIT_PER_MINUTE,
                window_ms: 60_000,
                block_duration_ms: None,
            }),
            token,
        }))
    }

    /// Serve until shutdown.
    pub async fn monitor(self: Arc<Self>) -> GatewayResult<()> {
        let cfg = &self.env.config.webhook;
        let port = std::env::var("CLAWDBOT_GATEWAY_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(cfg.port);
        let addr = format!("{}:{}", cfg.bind_address, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::channel("webhook", format!("bind {} failed: {}", addr, e)))?;
        if cfg.bind_address != "127.0.0.1" && cfg.bind_address != "localhost" {
            warn!("[webhook] Binding to {} — make sure the token is strong", cfg.bind_address);
        }
        info!("[webhook] Listening on http://{}", addr);

        loop {
            let accepted = tokio::select! {
                a = listener.accept() => a,
                _ = self.env.abort.cancelled() => {
                    info!("[webhook] Shutdown — closing listener");
                    return Ok(());
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    let adapter = self.clone();
                    tokio::spawn(async move {
                        let ip = peer.ip().to_string();
                        if let Err(e) = adapter.handle_connection(stream, &ip).await {
                            warn!("[webhook] Request from {} failed: {}", ip, e);
                        }
                    });
                }
                Err(e) => warn!("[webhook] Accept error: {}", e),
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer_ip: &str) -> GatewayResult<()> {
        let raw = read_request(&mut stream).await?;
        let (method, path) = parse_request_line(&raw);

        if method == "GET" && path == "/webhook/health" {
            return write_json(&mut stream, 200, &json!({"ok": true})).await;
        }
        if method != "POST" || path != "/webhook" {
            return write_json(&mut stream, 404, &json!({"ok": false, "error": "not found"})).await;
        }
        if !self.limiter.check(peer_ip) {
            return write_json(
                &mut stream,
                429,
                &json!({"ok": false, "error": "rate limited"}),
            )
            .await;
        }
        if !bearer_token_matches(&raw, &self.token) {
            return write_json(
                &mut stream,
                401,
                &json!({"ok": false, "error": "unauthorized — provide Authorization: Bearer <token>"}),
            )
            .await;
        }

        let body = raw.splitn(2, "\r\n\r\n").nth(1).unwrap_or("");
        let request: WebhookRequest = match serde_json::from_str(body) {
            Ok(r) => r,
            Err(e) => {
                return write_json(
                    &mut stream,
                    400,
                    &json!({"ok": false, "error": format!("invalid JSON body: {}", e)}),
                )
                .await;
            }
        };

        let message_id = uuid::Uuid::new_v4().to_string();
        let rx = self.sender.register(&message_id);
        self.sink.submit(InboundMessage {
            transport: "webhook".into(),
            account_id: "default".into(),
            peer_id: request.user_id.clone(),
            username: Some(request.user_id.clone()),
            display_name: None,
            peer_kind: PeerKind::Dm,
            group_id: None,
            thread_id: None,
            text: request.message,
            message_id: Some(message_id.clone()),
            update_id: None,
            received_at: Utc::now().to_rfc3339(),
        });

        let timeout = Duration::from_secs(self.env.config.agent_timeout_secs.max(1));
        let reply = tokio::time::timeout(timeout, rx).await;
        self.sender.forget(&message_id);

        match reply {
            Ok(Ok(text)) => {
                let body = serde_json::to_value(WebhookResponse {
                    ok: true,
                    response: Some(text),
                    error: None,
                })?;
                write_json(&mut stream, 200, &body).await
            }
            _ => {
                write_json(
                    &mut stream,
                    504,
                    &json!({"ok": false, "error": "agent did not reply in time"}),
                )
                .await
            }
        }
    }
}

// ── HTTP plumbing ──────────────────────────────────────────────────────

async fn read_request(stream: &mut TcpStream) -> GatewayResult<String> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| GatewayError::channel("webhook", format!("read error: {}", e)))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(GatewayError::channel("webhook", "request too large"));
        }
        if let Some(header_end) = find_header_end(&buf) {
            let headers = String::from_utf8_lossy(&buf[..header_end]);
            let content_length = headers
                .lines()
                .find_map(|l| {
                    l.to_lowercase()
                        .strip_prefix("content-length:")
                        .and_then(|v| v.trim().parse::<usize>().ok())
                })
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    Ok(String::from_utf8_lossy(&buf).to_string())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_line(raw: &str) -> (&str, &str) {
    let first = raw.lines().next().unwrap_or("");
    let mut parts = first.split_whitespace();
    (parts.next().unwrap_or(""), parts.next().unwrap_or(""))
}

fn bearer_token_matches(raw: &str, expected: &str) -> bool {
    raw.lines().any(|line| {
        let lower = line.to_lowercase();
        if !lower.starts_with("authorization:") {
            return false;
        }
        let value = line["authorization:".len()..].trim();
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value);
        token == expected
    })
}

async fn write_json(
    stream: &mut TcpStream,
    status: u16,
    body: &serde_json::Value,
) -> GatewayResult<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        429 => "Too Many Requests",
        504 => "Gateway Timeout",
        _ => "Internal Server Error",
    };
    let payload = body.to_string();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        payload.len(),
        payload
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| GatewayError::channel("webhook", format!("write error: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_parsing() {
        assert_eq!(parse_request_line("POST /webhook HTTP/1.1\r\n"), ("POST", "/webhook"));
        assert_eq!(parse_request_line(""), ("", ""));
    }

    #[test]
    fn bearer_token_forms() {
        let raw = "POST /webhook HTTP/1.1\r\nAuthorization: Bearer sekrit\r\n\r\n{}";
        assert!(bearer_token_matches(raw, "sekrit"));
        assert!(!bearer_token_matches(raw, "other"));

        let raw_plain = "POST /webhook HTTP/1.1\r\nauthorization: sekrit\r\n\r\n{}";
        assert!(bearer_token_matches(raw_plain, "sekrit"));

        let raw_none = "POST /webhook HTTP/1.1\r\n\r\n{}";
        assert!(!bearer_token_matches(raw_none, "sekrit"));
    }

    #[test]
    fn header_end_detection() {
        assert_eq!(find_header_end(b"a: b\r\n\r\nbody"), Some(4));
        assert_eq!(find_header_end(b"partial headers"), None);
    }
}
