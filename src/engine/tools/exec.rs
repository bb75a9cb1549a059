// Clawdbot Gateway — exec tool
//
// Runs shell commands in the session workspace via `sh -c` (or
// `cmd /C` on Windows). The dangerous-command detector and the exec
// rate limiter have already run by the time execute() is reached.
// Cancellation kills the child process and surfaces as Cancelled.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::tools::{OnUpdate, Tool, ToolOutput};
use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use tokio_util::sync::CancellationToken;

const MAX_OUTPUT: usize = 50_000;

pub struct ExecTool {
    workspace: PathBuf,
}

impl ExecTool {
    pub fn new(workspace: PathBuf) -> Self {
        ExecTool { workspace }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn label(&self) -> &str {
        "Run command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the session workspace and return its output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        _call_id: &str,
        params: Value,
        signal: CancellationToken,
        _on_update: OnUpdate,
    ) -> GatewayResult<ToolOutput> {
        let command = params["command"]
            .as_str()
            .ok_or_else(|| GatewayError::tool("exec", "missing 'command' argument"))?;

        info!("[exec] {} (cwd={})", crate::engine::types::truncate_utf8(command, 200), self.workspace.display());
        std::fs::create_dir_all(&self.workspace)?;

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = tokio::process::Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = tokio::process::Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| GatewayError::tool("exec", format!("spawn failed: {}", e)))?;

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(|e| GatewayError::tool("exec", format!("wait failed: {}", e)))?
            }
            _ = signal.cancelled() => {
                // Dropping the wait future drops the child; kill_on_drop
                // reaps it.
                return Err(GatewayError::Cancelled("exec aborted".into()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        let mut text = String::new();
        if !stdout.is_empty() {
            text.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push_str("\n--- stderr ---\n");
            }
            text.push_str(&stderr);
        }
        if text.is_empty() {
            text = format!("(exit code: {})", exit_code);
        }
        if text.len() > MAX_OUTPUT {
            let mut truncated = crate::engine::types::truncate_utf8(&text, MAX_OUTPUT).to_string();
            truncated.push_str("\n\n... [output truncated]");
            text = truncated;
        }

        Ok(ToolOutput {
            details: json!({"exitCode": exit_code, "stdoutBytes": stdout.len(), "stderrBytes": stderr.len()}),
            result_for_assistant: text,
        })
    }
}
