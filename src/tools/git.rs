//! Git tool: a fixed set of subcommands run against a working directory.
//!
//! `push` is gated by configuration, `--force` by a second flag on top.
//! Commit messages are scrubbed of control bytes before they reach the git
//! command line. `pr` shells out to the `gh` CLI.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::config::GitToolConfig;
use crate::types::{RiskLevel, ToolInput, ToolOutput};

use super::{Tool, ToolCategory, ToolDefinition, ToolError};

const SUBCOMMANDS: &[&str] = &[
    "status", "add", "commit", "push", "pull", "clone", "branch", "checkout", "diff", "log", "pr",
];

/// Git subcommand runner.
pub struct GitTool {
    allow_push: bool,
    allow_force_push: bool,
}

impl GitTool {
    /// Build from configuration.
    pub fn new(config: &GitToolConfig) -> Self {
        Self {
            allow_push: config.allow_push,
            allow_force_push: config.allow_force_push,
        }
    }

    /// Assemble the argument vector for one invocation.
    fn build_args(&self, input: &ToolInput) -> Result<Vec<String>, ToolError> {
        let sub = input.command.as_str();
        let mut args: Vec<String> = vec![sub.to_owned()];

        match sub {
            "status" => args.push("--short".to_owned()),
            "add" => {
                let files = input.arg_str("files").unwrap_or(".");
                for file in files.split_whitespace() {
                    args.push(file.to_owned());
                }
            }
            "commit" => {
                let message = input.arg_str("message").ok_or_else(|| {
                    ToolError::InvalidInput("commit needs a message".to_owned())
                })?;
                args.push("-m".to_owned());
                args.push(scrub_commit_message(message));
            }
            "push" => {
                if let Some(remote) = input.arg_str("remote") {
                    args.push(remote.to_owned());
                }
                if let Some(branch) = input.arg_str("branch") {
                    args.push(branch.to_owned());
                }
                if input.arg_bool("force") {
                    args.push("--force".to_owned());
                }
            }
            "pull" => {}
            "clone" => {
                let url = input
                    .arg_str("url")
                    .ok_or_else(|| ToolError::InvalidInput("clone needs a url".to_owned()))?;
                args.push(url.to_owned());
                if let Some(dest) = input.arg_str("dest") {
                    args.push(dest.to_owned());
                }
            }
            "branch" => {
                if let Some(name) = input.arg_str("name") {
                    args.push(name.to_owned());
                }
            }
            "checkout" => {
                let target = input
                    .arg_str("target")
                    .ok_or_else(|| ToolError::InvalidInput("checkout needs a target".to_owned()))?;
                args.push(target.to_owned());
            }
            "diff" => {
                if let Some(target) = input.arg_str("target") {
                    args.push(target.to_owned());
                }
            }
            "log" => {
                args.push("--oneline".to_owned());
                let count = input.arg_u64("count").unwrap_or(20);
                args.push(format!("-{count}"));
            }
            "pr" => {} // handled separately via gh
            other => {
                return Err(ToolError::InvalidInput(format!(
                    "unsupported git subcommand: {other}"
                )))
            }
        }
        Ok(args)
    }
}

/// Strip control bytes (`\x00`–`\x08`, `\x0b`, `\x0c`, `\x0e`–`\x1f`,
/// `\x7f`) from a commit message. Newlines and tabs survive.
pub fn scrub_commit_message(message: &str) -> String {
    message
        .chars()
        .filter(|c| {
            let code = *c as u32;
            !(code <= 0x08
                || code == 0x0b
                || code == 0x0c
                || (0x0e..=0x1f).contains(&code)
                || code == 0x7f)
        })
        .collect()
}

#[async_trait]
impl Tool for GitTool {
    fn name(&self) -> &str {
        "git"
    }

    fn description(&self) -> &str {
        "Run a git operation in a repository"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Development
    }

    fn base_risk(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    fn risk_for(&self, input: &ToolInput) -> RiskLevel {
        match input.command.as_str() {
            "status" | "diff" | "log" | "branch" => RiskLevel::Low,
            "push" if input.arg_bool("force") => RiskLevel::High,
            "push" | "pr" => RiskLevel::High,
            _ => RiskLevel::Medium,
        }
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "git".to_owned(),
            description: self.description().to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "enum": SUBCOMMANDS},
                    "message": {"type": "string", "description": "Commit message"},
                    "files": {"type": "string", "description": "Files for add"},
                    "remote": {"type": "string"},
                    "branch": {"type": "string"},
                    "force": {"type": "boolean"},
                    "url": {"type": "string", "description": "Repository URL for clone"},
                    "target": {"type": "string", "description": "Ref for checkout/diff"},
                    "title": {"type": "string", "description": "PR title"},
                    "body": {"type": "string", "description": "PR body"}
                },
                "required": ["command"]
            }),
        }
    }

    fn validate(&self, input: &ToolInput) -> Result<(), ToolError> {
        let sub = input.command.as_str();
        if !SUBCOMMANDS.contains(&sub) {
            return Err(ToolError::InvalidInput(format!(
                "unsupported git subcommand: {sub}"
            )));
        }
        if sub == "push" {
            if !self.allow_push {
                return Err(ToolError::Forbidden(
                    "git push is disabled by configuration".to_owned(),
                ));
            }
            if input.arg_bool("force") && !self.allow_force_push {
                return Err(ToolError::Forbidden(
                    "git push --force is disabled by configuration".to_owned(),
                ));
            }
        }
        if sub == "commit" && input.arg_str("message").is_none() {
            return Err(ToolError::InvalidInput("commit needs a message".to_owned()));
        }
        if sub == "clone" && input.arg_str("url").is_none() {
            return Err(ToolError::InvalidInput("clone needs a url".to_owned()));
        }
        if sub == "pr" && input.arg_str("title").is_none() {
            return Err(ToolError::InvalidInput("pr needs a title".to_owned()));
        }
        Ok(())
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput, ToolError> {
        let (program, args) = if input.command == "pr" {
            let title = input
                .arg_str("title")
                .ok_or_else(|| ToolError::InvalidInput("pr needs a title".to_owned()))?;
            let mut args = vec![
                "pr".to_owned(),
                "create".to_owned(),
                "--title".to_owned(),
                title.to_owned(),
            ];
            args.push("--body".to_owned());
            args.push(input.arg_str("body").unwrap_or_default().to_owned());
            ("gh", args)
        } else {
            ("git", self.build_args(input)?)
        };

        debug!(program, ?args, "running git operation");

        let mut command = tokio::process::Command::new(program);
        command.args(&args);
        if let Some(dir) = &input.working_dir {
            command.current_dir(dir);
        }

        let result = command
            .output()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn {program}: {e}")))?;

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
                error: Some(format!("{program} exited with code {code}")),
                ..Default::default()
            })
        }
    }
}
