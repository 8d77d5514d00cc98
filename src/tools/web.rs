//! Web fetch tool: HTTP(S) GET with host policy and a body cap.
//!
//! The response is rendered as a status line, a short headers summary, and
//! the (possibly truncated) body. Low risk: fetches are read-only and the
//! host lists bound where they can go.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::config::WebToolConfig;
use crate::types::{RiskLevel, ToolInput, ToolOutput};

use super::{Tool, ToolCategory, ToolDefinition, ToolError};

/// Request timeout for fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers worth echoing back to the model.
const SUMMARY_HEADERS: &[&str] = &["content-type", "content-length", "server", "last-modified"];

/// HTTP(S) page fetcher.
pub struct WebFetchTool {
    allowed_hosts: Vec<String>,
    blocked_hosts: Vec<String>,
    max_body_bytes: usize,
    client: reqwest::Client,
}

impl WebFetchTool {
    /// Build from configuration.
    pub fn new(config: &WebToolConfig) -> Self {
        Self {
            allowed_hosts: config.allowed_hosts.clone(),
            blocked_hosts: config.blocked_hosts.clone(),
            max_body_bytes: config.max_body_bytes,
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn check_url(&self, raw: &str) -> Result<Url, ToolError> {
        let url =
            Url::parse(raw).map_err(|e| ToolError::InvalidInput(format!("invalid URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ToolError::InvalidInput(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ToolError::InvalidInput("URL has no host".to_owned()))?;

        if self.blocked_hosts.iter().any(|h| h == host) {
            return Err(ToolError::Forbidden(format!("host is blocked: {host}")));
        }
        if !self.allowed_hosts.is_empty() && !self.allowed_hosts.iter().any(|h| h == host) {
            return Err(ToolError::Forbidden(format!(
                "host is not in the allow-list: {host}"
            )));
        }
        Ok(url)
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web"
    }

    fn description(&self) -> &str {
        "Fetch a web page via HTTP GET"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Network
    }

    fn base_risk(&self) -> RiskLevel {
        RiskLevel::Low
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "web".to_owned(),
            description: self.description().to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "http(s) URL to fetch"}
                },
                "required": ["url"]
            }),
        }
    }

    fn validate(&self, input: &ToolInput) -> Result<(), ToolError> {
        let raw = if input.command.is_empty() {
            input
                .arg_str("url")
                .ok_or_else(|| ToolError::InvalidInput("missing required field: url".to_owned()))?
        } else {
            input.command.as_str()
        };
        self.check_url(raw).map(|_| ())
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput, ToolError> {
        let raw = if input.command.is_empty() {
            input
                .arg_str("url")
                .ok_or_else(|| ToolError::InvalidInput("missing required field: url".to_owned()))?
        } else {
            input.command.as_str()
        };
        let url = self.check_url(raw)?;

        debug!(url = %url, "web fetch");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("GET request failed: {e}")))?;

        let status = response.status();
        let mut summary = format!("HTTP {}\n", status);
        for name in SUMMARY_HEADERS {
            if let Some(value) = response.headers().get(*name).and_then(|v| v.to_str().ok()) {
                summary.push_str(&format!("{name}: {value}\n"));
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read body: {e}")))?;
        let body = truncate_body(&body, self.max_body_bytes);

        let rendered = format!("{summary}\n{body}");
        if status.is_success() {
            Ok(ToolOutput::ok(rendered))
        } else {
            Ok(ToolOutput {
                success: false,
                output: rendered,
                error: Some(format!("HTTP status {status}")),
                ..Default::default()
            })
        }
    }
}

/// Cap a body at `max_bytes` on a char boundary, marking the cut.
pub(crate) fn truncate_body(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_owned();
    }
    let mut cut = max_bytes;
    while cut > 0 && !body.is_char_boundary(cut) {
        cut = cut.saturating_sub(1);
    }
    format!("{}\n... (body truncated)", &body[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_with(allowed: &[&str], blocked: &[&str]) -> WebFetchTool {
        WebFetchTool::new(&WebToolConfig {
            allowed_hosts: allowed.iter().map(|s| (*s).to_owned()).collect(),
            blocked_hosts: blocked.iter().map(|s| (*s).to_owned()).collect(),
            max_body_bytes: 1024,
        })
    }

    fn input(url: &str) -> ToolInput {
        ToolInput {
            command: url.to_owned(),
            user_id: "u1".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_non_http_schemes() {
        let tool = tool_with(&[], &[]);
        assert!(tool.validate(&input("ftp://example.com/file")).is_err());
        assert!(tool.validate(&input("file:///etc/passwd")).is_err());
    }

    #[test]
    fn rejects_malformed_urls() {
        let tool = tool_with(&[], &[]);
        assert!(tool.validate(&input("not a url")).is_err());
    }

    #[test]
    fn blocked_host_is_forbidden() {
        let tool = tool_with(&[], &["tracker.example"]);
        let result = tool.validate(&input("https://tracker.example/page"));
        assert!(matches!(result, Err(ToolError::Forbidden(_))));
    }

    #[test]
    fn allowlist_restricts_hosts() {
        let tool = tool_with(&["api.github.com"], &[]);
        assert!(tool.validate(&input("https://api.github.com/users")).is_ok());
        assert!(tool.validate(&input("https://example.com/")).is_err());
    }

    #[test]
    fn empty_allowlist_permits_any_host() {
        let tool = tool_with(&[], &[]);
        assert!(tool.validate(&input("https://example.com/")).is_ok());
    }

    #[test]
    fn body_truncation_marks_cut() {
        let body = "x".repeat(2048);
        let truncated = truncate_body(&body, 100);
        assert!(truncated.ends_with("... (body truncated)"));
        assert!(truncated.len() < body.len());

        let short = truncate_body("tiny", 100);
        assert_eq!(short, "tiny");
    }

    #[test]
    fn risk_is_low() {
        assert_eq!(tool_with(&[], &[]).base_risk(), RiskLevel::Low);
    }
}
