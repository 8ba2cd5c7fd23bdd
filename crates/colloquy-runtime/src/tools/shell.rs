//! Shell command tool

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use colloquy_core::{
    error::Result,
    tool::{Tool, ToolArguments, ToolResult, ToolSchema, truncate_chars},
};
use serde_json::json;
use tokio::process::Command;

use super::{Workspace, str_arg, u64_arg};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_OUTPUT_CHARS: usize = 10_000;

/// Run `sh -c <command>` in the workspace root
pub struct ExecuteCommandTool {
    workspace: Workspace,
}

impl ExecuteCommandTool {
    pub const fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::builder(
            "execute_command",
            "Run a shell command in the workspace directory. Returns stdout, stderr and the exit code.",
        )
        .param("command", "string", "Command line passed to sh -c", true)
        .param("timeout_secs", "integer", "Seconds before the command is killed (default: 30)", false)
        .build()
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<ToolResult> {
        let command = str_arg(arguments, "command")?;
        let timeout = Duration::from_secs(u64_arg(arguments, "timeout_secs").unwrap_or(DEFAULT_TIMEOUT_SECS));
        tracing::info!(command, ?timeout, "Executing command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let Ok(output) = tokio::time::timeout(timeout, child.wait_with_output()).await else {
            tracing::warn!(command, "Command timed out");
            return Ok(ToolResult::failure(format!(
                "Command timed out after {}s",
                timeout.as_secs()
            )));
        };
        let output = output?;

        Ok(ToolResult::success(json!({
            "stdout": truncate_chars(&String::from_utf8_lossy(&output.stdout), MAX_OUTPUT_CHARS),
            "stderr": truncate_chars(&String::from_utf8_lossy(&output.stderr), MAX_OUTPUT_CHARS),
            "exit_code": output.status.code(),
        })))
    }
}
