// Clawdbot Gateway — fetch tool
//
// Plain HTTP requests for the agent. Response bodies are truncated to
// keep the context window bounded.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::tools::{OnUpdate, Tool, ToolOutput};
use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_BODY: usize = 50_000;

pub struct FetchTool {
    client: reqwest::Client,
}

impl Default for FetchTool {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        FetchTool { client }
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn label(&self) -> &str {
        "HTTP request"
    }

    fn description(&self) -> &str {
        "Make an HTTP request and return status plus (truncated) body."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Request URL"},
                "method": {"type": "string", "description": "HTTP method, default GET"},
                "headers": {"type": "object", "description": "Extra request headers"},
                "body": {"type": "string", "description": "Request body"}
            },
            "required": ["url"]
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        params: Value,
        signal: CancellationToken,
        _on_update: OnUpdate,
    ) -> GatewayResult<ToolOutput> {
        let url = params["url"]
            .as_str()
            .ok_or_else(|| GatewayError::tool("fetch", "missing 'url' argument"))?;
        let method = params["method"].as_str().unwrap_or("GET");

        info!("[fetch] {} {}", method, url);

        let mut request = match method.to_uppercase().as_str() {
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            "HEAD" => self.client.head(url),
            _ => self.client.get(url),
        };
        if let Some(headers) = params["headers"].as_object() {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(key.as_str(), v);
                }
            }
        }
        if let Some(body) = params["body"].as_str() {
            request = request.body(body.to_string());
        }

        let response = tokio::select! {
            r = request.send() => r.map_err(|e| GatewayError::tool("fetch", format!("request failed: {}", e)))?,
            _ = signal.cancelled() => return Err(GatewayError::Cancelled("fetch aborted".into())),
        };

        let status = response.status().as_u16();
        let body = tokio::select! {
            b = response.text() => b.map_err(|e| GatewayError::tool("fetch", format!("read body failed: {}", e)))?,
            _ = signal.cancelled() => return Err(GatewayError::Cancelled("fetch aborted".into())),
        };

        let shown = if body.len() > MAX_BODY {
            format!(
                "{}...\n[truncated, {} total bytes]",
                crate::engine::types::truncate_utf8(&body, MAX_BODY),
                body.len()
            )
        } else {
            body
        };

        Ok(ToolOutput {
            details: json!({"status": status, "url": url}),
            result_for_assistant: format!(
                "HTTP {} {}\n\n{}",
                status,
                if status < 400 { "OK" } else { "Error" },
                shown
            ),
        })
    }
}
