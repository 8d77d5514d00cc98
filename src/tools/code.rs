//! Code snippet tool.
//!
//! Writes a snippet to a temp file with the language's extension, runs the
//! matching interpreter, and removes the file unconditionally — success,
//! failure, or interpreter crash.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::types::{RiskLevel, ToolInput, ToolOutput};

use super::{Tool, ToolCategory, ToolDefinition, ToolError};

/// Supported snippet languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Python,
    Node,
}

impl Language {
    fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "python" => Some(Self::Python),
            "node" | "javascript" => Some(Self::Node),
            _ => None,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::Node => "js",
        }
    }

    fn interpreter(self) -> &'static str {
        match self {
            Self::Python => {
                if cfg!(windows) {
                    "python"
                } else {
                    "python3"
                }
            }
            Self::Node => "node",
        }
    }
}

/// Interpreter runner for short Python/JavaScript snippets.
#[derive(Debug, Default)]
pub struct CodeTool;

impl CodeTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for CodeTool {
    fn name(&self) -> &str {
        "code"
    }

    fn description(&self) -> &str {
        "Run a Python or JavaScript snippet and capture its output"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Development
    }

    fn base_risk(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "code".to_owned(),
            description: self.description().to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "language": {"type": "string", "enum": ["python", "node", "javascript"]},
                    "code": {"type": "string", "description": "Snippet source"}
                },
                "required": ["language", "code"]
            }),
        }
    }

    fn validate(&self, input: &ToolInput) -> Result<(), ToolError> {
        let language = input
            .arg_str("language")
            .ok_or_else(|| ToolError::InvalidInput("missing required field: language".to_owned()))?;
        if Language::parse(language).is_none() {
            return Err(ToolError::InvalidInput(format!(
                "unsupported language: {language}"
            )));
        }
        let code = input
            .arg_str("code")
            .ok_or_else(|| ToolError::InvalidInput("missing required field: code".to_owned()))?;
        if code.trim().is_empty() {
            return Err(ToolError::InvalidInput("code must not be empty".to_owned()));
        }
        Ok(())
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput, ToolError> {
        let language = input
            .arg_str("language")
            .and_then(Language::parse)
            .ok_or_else(|| ToolError::InvalidInput("unsupported language".to_owned()))?;
        let code = input
            .arg_str("code")
            .ok_or_else(|| ToolError::InvalidInput("missing required field: code".to_owned()))?;

        let path: PathBuf = std::env::temp_dir().join(format!(
            "pinky-snippet-{}.{}",
            Uuid::new_v4(),
            language.extension()
        ));
        tokio::fs::write(&path, code)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to write snippet: {e}")))?;

        debug!(language = ?language, path = %path.display(), "running snippet");

        let run = tokio::process::Command::new(language.interpreter())
            .arg(&path)
            .output()
            .await;

        // The temp file goes away regardless of how the run ended.
        let _ = tokio::fs::remove_file(&path).await;

        let result = run.map_err(|e| {
            ToolError::ExecutionFailed(format!(
                "failed to spawn {}: {e}",
                language.interpreter()
            ))
        })?;

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
                error: Some(format!("interpreter exited with code {code}")),
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(language: &str, code: &str) -> ToolInput {
        let mut input = ToolInput {
            user_id: "u1".to_owned(),
            ..Default::default()
        };
        input.args.insert("language".to_owned(), json!(language));
        input.args.insert("code".to_owned(), json!(code));
        input
    }

    #[test]
    fn validates_language() {
        let tool = CodeTool::new();
        assert!(tool.validate(&input("python", "print(1)")).is_ok());
        assert!(tool.validate(&input("javascript", "console.log(1)")).is_ok());
        assert!(tool.validate(&input("ruby", "puts 1")).is_err());
    }

    #[test]
    fn rejects_empty_code() {
        let tool = CodeTool::new();
        assert!(tool.validate(&input("python", "   ")).is_err());
    }

    #[test]
    fn language_aliases() {
        assert_eq!(Language::parse("javascript"), Some(Language::Node));
        assert_eq!(Language::parse("NODE"), Some(Language::Node));
        assert_eq!(Language::parse("Python"), Some(Language::Python));
    }

    #[cfg(unix)]
    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_python_snippet_and_cleans_up() {
        if !python_available() {
            eprintln!("python3 not installed, skipping");
            return;
        }
        let tool = CodeTool::new();
        let before: Vec<_> = snippet_files();
        let result = tool
            .execute(&input("python", "print('snippet ran')"))
            .await
            .expect("run");
        assert!(result.success, "stderr: {:?}", result.error);
        assert!(result.output.contains("snippet ran"));
        assert_eq!(snippet_files().len(), before.len(), "temp file not removed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_snippet_reports_exit_code_and_cleans_up() {
        if !python_available() {
            eprintln!("python3 not installed, skipping");
            return;
        }
        let tool = CodeTool::new();
        let before: Vec<_> = snippet_files();
        let result = tool
            .execute(&input("python", "import sys; sys.exit(2)"))
            .await
            .expect("run");
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("interpreter exited with code 2")
        );
        assert_eq!(snippet_files().len(), before.len(), "temp file not removed");
    }

    #[cfg(unix)]
    fn snippet_files() -> Vec<std::path::PathBuf> {
        std::fs::read_dir(std::env::temp_dir())
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.starts_with("pinky-snippet-"))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
