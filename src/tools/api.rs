//! Generic API tool: authenticated HTTP requests with SSRF defense.
//!
//! Redirects are followed manually so every hop — not just the initial
//! host — goes through the block-list and private-range checks. Bearer,
//! basic, and api-key auth are supported; JSON bodies are validated before
//! anything leaves the process.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::config::ApiToolConfig;
use crate::security::ssrf;
use crate::types::{RiskLevel, ToolInput, ToolOutput};

use super::web::truncate_body;
use super::{Tool, ToolCategory, ToolDefinition, ToolError};

/// Request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum redirect hops before giving up.
const MAX_REDIRECT_HOPS: usize = 5;

/// Response body cap.
const MAX_BODY_BYTES: usize = 256 * 1024;

const ALLOWED_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE"];

/// Authenticated HTTP client tool.
pub struct ApiTool {
    allowed_domains: Vec<String>,
    client: reqwest::Client,
}

impl ApiTool {
    /// Build from configuration. Redirects are disabled on the client so
    /// the tool can vet each hop itself.
    pub fn new(config: &ApiToolConfig) -> Self {
        Self {
            allowed_domains: config.allowed_domains.clone(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default(),
        }
    }

    /// Static vetting of one hop: scheme, allow-list, hostname block-list.
    fn check_hop(&self, url: &Url) -> Result<(), ToolError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ToolError::InvalidInput(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ToolError::InvalidInput("URL has no host".to_owned()))?;

        if !self.allowed_domains.is_empty() && !self.allowed_domains.iter().any(|d| d == host) {
            return Err(ToolError::Forbidden(format!(
                "domain is not in the allow-list: {host}"
            )));
        }
        Ok(())
    }

    /// Apply the configured auth scheme to a request builder.
    fn apply_auth(
        builder: reqwest::RequestBuilder,
        input: &ToolInput,
    ) -> Result<reqwest::RequestBuilder, ToolError> {
        let Some(auth) = input.args.get("auth") else {
            return Ok(builder);
        };
        let kind = auth.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match kind {
            "bearer" => {
                let token = auth
                    .get("token")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::InvalidInput("bearer auth needs token".to_owned()))?;
                Ok(builder.bearer_auth(token))
            }
            "basic" => {
                let username = auth
                    .get("username")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ToolError::InvalidInput("basic auth needs username".to_owned())
                    })?;
                let password = auth.get("password").and_then(|v| v.as_str());
                let credentials = match password {
                    Some(p) => format!("{username}:{p}"),
                    None => format!("{username}:"),
                };
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                Ok(builder.header("Authorization", format!("Basic {encoded}")))
            }
            "api_key" => {
                let header = auth
                    .get("header")
                    .and_then(|v| v.as_str())
                    .unwrap_or("X-Api-Key");
                let key = auth
                    .get("key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::InvalidInput("api_key auth needs key".to_owned()))?;
                Ok(builder.header(header, key))
            }
            "" => Ok(builder),
            other => Err(ToolError::InvalidInput(format!(
                "unsupported auth type: {other}"
            ))),
        }
    }
}

fn method_of(input: &ToolInput) -> String {
    input
        .arg_str("method")
        .unwrap_or("GET")
        .to_uppercase()
}

fn url_of(input: &ToolInput) -> Option<&str> {
    if input.command.is_empty() {
        input.arg_str("url")
    } else {
        Some(input.command.as_str())
    }
}

#[async_trait]
impl Tool for ApiTool {
    fn name(&self) -> &str {
        "api"
    }

    fn description(&self) -> &str {
        "Call an HTTP API with optional authentication"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Network
    }

    fn base_risk(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    fn risk_for(&self, input: &ToolInput) -> RiskLevel {
        match method_of(input).as_str() {
            "GET" | "HEAD" => RiskLevel::Low,
            _ => RiskLevel::Medium,
        }
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "api".to_owned(),
            description: self.description().to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "method": {"type": "string", "enum": ALLOWED_METHODS},
                    "headers": {"type": "object"},
                    "body": {"type": "string"},
                    "content_type": {"type": "string"},
                    "auth": {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": ["bearer", "basic", "api_key"]}
                        }
                    }
                },
                "required": ["url"]
            }),
        }
    }

    fn validate(&self, input: &ToolInput) -> Result<(), ToolError> {
        let raw = url_of(input)
            .ok_or_else(|| ToolError::InvalidInput("missing required field: url".to_owned()))?;
        let url =
            Url::parse(raw).map_err(|e| ToolError::InvalidInput(format!("invalid URL: {e}")))?;
        self.check_hop(&url)?;

        let method = method_of(input);
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(ToolError::InvalidInput(format!(
                "unsupported method: {method}"
            )));
        }

        // JSON bodies must parse before anything goes on the wire.
        let content_type = input.arg_str("content_type").unwrap_or("");
        if content_type.contains("json") {
            if let Some(body) = input.arg_str("body") {
                serde_json::from_str::<serde_json::Value>(body).map_err(|e| {
                    ToolError::InvalidInput(format!("body is not valid JSON: {e}"))
                })?;
            }
        }
        Ok(())
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput, ToolError> {
        let raw = url_of(input)
            .ok_or_else(|| ToolError::InvalidInput("missing required field: url".to_owned()))?;
        let mut url =
            Url::parse(raw).map_err(|e| ToolError::InvalidInput(format!("invalid URL: {e}")))?;
        let method = method_of(input);

        // Follow redirects by hand, vetting every hop.
        for hop in 0..MAX_REDIRECT_HOPS {
            self.check_hop(&url)?;
            ssrf::check_url(&url).await.map_err(|e| {
                ToolError::Forbidden(if hop == 0 {
                    e.to_string()
                } else {
                    format!("redirect to blocked target: {e}")
                })
            })?;

            debug!(url = %url, method = %method, hop, "api request");

            let mut builder = match method.as_str() {
                "GET" => self.client.get(url.clone()),
                "HEAD" => self.client.head(url.clone()),
                "POST" => self.client.post(url.clone()),
                "PUT" => self.client.put(url.clone()),
                "PATCH" => self.client.patch(url.clone()),
                "DELETE" => self.client.delete(url.clone()),
                other => {
                    return Err(ToolError::InvalidInput(format!(
                        "unsupported method: {other}"
                    )))
                }
            };

            if let Some(headers) = input.args.get("headers").and_then(|v| v.as_object()) {
                for (name, value) in headers {
                    if let Some(value) = value.as_str() {
                        builder = builder.header(name.as_str(), value);
                    }
                }
            }
            if let Some(content_type) = input.arg_str("content_type") {
                builder = builder.header("Content-Type", content_type);
            }
            if let Some(body) = input.arg_str("body") {
                builder = builder.body(body.to_owned());
            }
            builder = Self::apply_auth(builder, input)?;

            let response = builder
                .send()
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("request failed: {e}")))?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        ToolError::ExecutionFailed(
                            "redirect response missing Location header".to_owned(),
                        )
                    })?;
                url = url.join(location).map_err(|e| {
                    ToolError::ExecutionFailed(format!("invalid redirect URL: {e}"))
                })?;
                continue;
            }

            let mut summary = format!("HTTP {status}\n");
            for name in ["content-type", "content-length"] {
                if let Some(value) = response.headers().get(name).and_then(|v| v.to_str().ok()) {
                    summary.push_str(&format!("{name}: {value}\n"));
                }
            }
            let body = response
                .text()
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to read body: {e}")))?;
            let rendered = format!("{summary}\n{}", truncate_body(&body, MAX_BODY_BYTES));

            return if status.is_success() {
                Ok(ToolOutput::ok(rendered))
            } else {
                Ok(ToolOutput {
                    success: false,
                    output: rendered,
                    error: Some(format!("HTTP status {status}")),
                    ..Default::default()
                })
            };
        }

        Err(ToolError::ExecutionFailed(format!(
            "too many redirects (>{MAX_REDIRECT_HOPS})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ApiTool {
        ApiTool::new(&ApiToolConfig::default())
    }

    fn input(url: &str, method: &str) -> ToolInput {
        let mut input = ToolInput {
            command: url.to_owned(),
            user_id: "u1".to_owned(),
            ..Default::default()
        };
        input.args.insert("method".to_owned(), json!(method));
        input
    }

    #[test]
    fn method_allowlist() {
        let t = tool();
        assert!(t.validate(&input("https://api.example.com/x", "GET")).is_ok());
        assert!(t.validate(&input("https://api.example.com/x", "delete")).is_ok());
        assert!(t
            .validate(&input("https://api.example.com/x", "TRACE"))
            .is_err());
    }

    #[test]
    fn risk_by_method() {
        let t = tool();
        assert_eq!(t.risk_for(&input("https://x.example/", "GET")), RiskLevel::Low);
        assert_eq!(t.risk_for(&input("https://x.example/", "HEAD")), RiskLevel::Low);
        assert_eq!(
            t.risk_for(&input("https://x.example/", "POST")),
            RiskLevel::Medium
        );
        assert_eq!(
            t.risk_for(&input("https://x.example/", "DELETE")),
            RiskLevel::Medium
        );
    }

    #[test]
    fn json_body_must_parse() {
        let t = tool();
        let mut req = input("https://api.example.com/x", "POST");
        req.args
            .insert("content_type".to_owned(), json!("application/json"));
        req.args.insert("body".to_owned(), json!("{not json"));
        assert!(t.validate(&req).is_err());

        req.args
            .insert("body".to_owned(), json!(r#"{"ok": true}"#));
        assert!(t.validate(&req).is_ok());
    }

    #[test]
    fn domain_allowlist_enforced() {
        let t = ApiTool::new(&ApiToolConfig {
            allowed_domains: vec!["api.github.com".to_owned()],
        });
        assert!(t.validate(&input("https://api.github.com/users", "GET")).is_ok());
        assert!(matches!(
            t.validate(&input("https://evil.example/x", "GET")),
            Err(ToolError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn blocks_metadata_host_before_sending() {
        let t = tool();
        let err = t
            .execute(&input("http://169.254.169.254/latest/meta-data", "GET"))
            .await
            .expect_err("must be blocked");
        assert!(matches!(err, ToolError::Forbidden(_)));
    }

    #[tokio::test]
    async fn blocks_private_ip_literal() {
        let t = tool();
        let err = t
            .execute(&input("http://10.0.0.8/internal", "GET"))
            .await
            .expect_err("must be blocked");
        assert!(matches!(err, ToolError::Forbidden(_)));
    }

    #[test]
    fn unsupported_auth_type_rejected() {
        let mut req = input("https://api.example.com/x", "GET");
        req.args
            .insert("auth".to_owned(), json!({"type": "digest"}));
        let builder = reqwest::Client::new().get("https://api.example.com/x");
        assert!(ApiTool::apply_auth(builder, &req).is_err());
    }

    #[test]
    fn basic_auth_encodes_credentials() {
        let mut req = input("https://api.example.com/x", "GET");
        req.args.insert(
            "auth".to_owned(),
            json!({"type": "basic", "username": "alice", "password": "s3cret"}),
        );
        let builder = reqwest::Client::new().get("https://api.example.com/x");
        let built = ApiTool::apply_auth(builder, &req)
            .expect("auth applies")
            .build()
            .expect("request builds");
        let header = built
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .expect("authorization header");
        assert!(header.starts_with("Basic "));
        assert!(!header.contains("s3cret"), "credentials must be encoded");
    }
}
