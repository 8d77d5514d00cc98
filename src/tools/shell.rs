//! Shell command tool.
//!
//! Runs a command line under a shell from the configured allow-list
//! (`bash`/`sh` on Unix, `cmd`/`powershell` on Windows). Stdout and stderr
//! are captured merged; a non-zero exit is a failed [`ToolOutput`] carrying
//! the exit code. The executor owns the deadline.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::config::ShellToolConfig;
use crate::types::{RiskLevel, ToolInput, ToolOutput};

use super::{Tool, ToolCategory, ToolDefinition, ToolError};

/// Cross-platform shell runner.
pub struct ShellTool {
    allowed_shells: Vec<String>,
}

impl ShellTool {
    /// Build from configuration.
    pub fn new(config: &ShellToolConfig) -> Self {
        Self {
            allowed_shells: config.allowed_shells.clone(),
        }
    }

    /// The shell to use for one invocation: the `shell` argument when
    /// given, otherwise the first allow-list entry.
    fn select_shell(&self, input: &ToolInput) -> Result<String, ToolError> {
        match input.arg_str("shell") {
            Some(requested) => {
                if self.allowed_shells.iter().any(|s| s == requested) {
                    Ok(requested.to_owned())
                } else {
                    Err(ToolError::Forbidden(format!(
                        "shell '{requested}' is not in the allow-list"
                    )))
                }
            }
            None => self
                .allowed_shells
                .first()
                .cloned()
                .ok_or_else(|| ToolError::Forbidden("shell allow-list is empty".to_owned())),
        }
    }
}

/// Flag that makes a shell execute a command string.
fn command_flag(shell: &str) -> &'static str {
    match shell {
        "cmd" => "/C",
        "powershell" => "-Command",
        _ => "-c",
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command and capture its output"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::System
    }

    fn base_risk(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "shell".to_owned(),
            description: self.description().to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Command line to run"},
                    "shell": {"type": "string", "description": "Shell binary (must be allow-listed)"},
                    "working_dir": {"type": "string", "description": "Directory to run in"}
                },
                "required": ["command"]
            }),
        }
    }

    fn validate(&self, input: &ToolInput) -> Result<(), ToolError> {
        if input.command.trim().is_empty() {
            return Err(ToolError::InvalidInput(
                "missing required field: command".to_owned(),
            ));
        }
        self.select_shell(input).map_err(|e| match e {
            ToolError::Forbidden(msg) => ToolError::InvalidInput(msg),
            other => other,
        })?;
        if let Some(dir) = &input.working_dir {
            if !dir.is_dir() {
                return Err(ToolError::InvalidInput(format!(
                    "working directory does not exist: {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput, ToolError> {
        let shell = self.select_shell(input)?;
        debug!(shell, command = %input.command, "running shell command");

        let mut command = tokio::process::Command::new(&shell);
        command.arg(command_flag(&shell)).arg(&input.command);
        if let Some(dir) = &input.working_dir {
            command.current_dir(dir);
        }

        let result = command
            .output()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn {shell}: {e}")))?;

        let stdout = String::from_utf8_lossy(&result.stdout);
        let stderr = String::from_utf8_lossy(&result.stderr);
        let merged = if stdout.is_empty() {
            stderr.to_string()
        } else if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{stdout}\n{stderr}")
        };

        if result.status.success() {
            Ok(ToolOutput::ok(merged))
        } else {
            let code = result
                .status
                .code()
                .map_or("signal".to_owned(), |c| c.to_string());
            Ok(ToolOutput {
                success: false,
                output: merged,
                error: Some(format!("command exited with code {code}")),
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ShellTool {
        ShellTool::new(&ShellToolConfig::default())
    }

    fn input(command: &str) -> ToolInput {
        ToolInput {
            command: command.to_owned(),
            user_id: "u1".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_command_is_invalid() {
        let result = tool().validate(&input("  "));
        assert!(matches!(result, Err(ToolError::InvalidInput(_))));
    }

    #[test]
    fn unknown_shell_is_invalid() {
        let mut req = input("ls");
        req.args
            .insert("shell".to_owned(), json!("fish"));
        assert!(tool().validate(&req).is_err());
    }

    #[test]
    fn missing_working_dir_is_invalid() {
        let mut req = input("ls");
        req.working_dir = Some("/definitely/not/a/real/dir".into());
        assert!(tool().validate(&req).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout() {
        let result = tool().execute(&input("echo hello")).await.expect("run");
        assert!(result.success);
        assert_eq!(result.output.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn merges_stderr_and_reports_exit_code() {
        let result = tool()
            .execute(&input("echo out; echo err 1>&2; exit 3"))
            .await
            .expect("run");
        assert!(!result.success);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
        assert_eq!(
            result.error.as_deref(),
            Some("command exited with code 3")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn respects_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut req = input("pwd");
        req.working_dir = Some(dir.path().to_path_buf());
        let result = tool().execute(&req).await.expect("run");
        assert!(result.success);
        // Canonicalized paths can differ (e.g. /tmp symlinks); compare suffix.
        let reported = result.output.trim();
        let expected = dir.path().file_name().and_then(|n| n.to_str()).expect("name");
        assert!(reported.contains(expected));
    }

    #[test]
    fn risk_is_high() {
        assert_eq!(tool().base_risk(), RiskLevel::High);
    }
}
