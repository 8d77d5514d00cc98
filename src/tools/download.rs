//! Download tool: streamed HTTP(S) downloads with a size cap.
//!
//! Destinations must lie under a configured directory prefix. The body is
//! streamed to disk chunk by chunk; when the cap is exceeded or a write
//! fails, the partial file is removed before the error surfaces.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tracing::debug;
use url::Url;

use crate::approvals::permission::matches_directory;
use crate::config::DownloadToolConfig;
use crate::security::ssrf;
use crate::types::{RiskLevel, ToolInput, ToolOutput};

use super::{Tool, ToolCategory, ToolDefinition, ToolError};

/// Overall download timeout.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP(S) file downloader.
pub struct DownloadTool {
    allowed_dirs: Vec<String>,
    max_bytes: u64,
    client: reqwest::Client,
}

impl DownloadTool {
    /// Build from configuration.
    pub fn new(config: &DownloadToolConfig) -> Self {
        Self {
            allowed_dirs: config.allowed_dirs.clone(),
            max_bytes: config.max_bytes,
            client: reqwest::Client::builder()
                .timeout(DOWNLOAD_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Resolve the destination path: the `dest` argument (which must fall
    /// under an allowed directory) or a generated name in the first
    /// allowed directory.
    fn destination(&self, input: &ToolInput, url: &Url) -> Result<PathBuf, ToolError> {
        if let Some(dest) = input.arg_str("dest") {
            let path = PathBuf::from(dest);
            let permitted = self
                .allowed_dirs
                .iter()
                .any(|dir| matches_directory(dir, &path));
            if !permitted {
                return Err(ToolError::Forbidden(format!(
                    "destination is outside allowed directories: {dest}"
                )));
            }
            return Ok(path);
        }

        let dir = self
            .allowed_dirs
            .first()
            .ok_or_else(|| ToolError::Forbidden("no allowed download directory".to_owned()))?;
        let filename = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("download")
            .to_owned();
        Ok(Path::new(dir).join(filename))
    }
}

#[async_trait]
impl Tool for DownloadTool {
    fn name(&self) -> &str {
        "download"
    }

    fn description(&self) -> &str {
        "Download a file over HTTP(S) into an allowed directory"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Files
    }

    fn base_risk(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "download".to_owned(),
            description: self.description().to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "dest": {"type": "string", "description": "Destination path (inside an allowed directory)"}
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
        let url =
            Url::parse(raw).map_err(|e| ToolError::InvalidInput(format!("invalid URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ToolError::InvalidInput(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        self.destination(input, &url).map(|_| ())
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput, ToolError> {
        let raw = if input.command.is_empty() {
            input
                .arg_str("url")
                .ok_or_else(|| ToolError::InvalidInput("missing required field: url".to_owned()))?
        } else {
            input.command.as_str()
        };
        let url =
            Url::parse(raw).map_err(|e| ToolError::InvalidInput(format!("invalid URL: {e}")))?;
        ssrf::check_url(&url)
            .await
            .map_err(|e| ToolError::Forbidden(e.to_string()))?;
        let dest = self.destination(input, &url)?;

        debug!(url = %url, dest = %dest.display(), "starting download");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Ok(ToolOutput {
                success: false,
                error: Some(format!("HTTP status {}", response.status())),
                ..Default::default()
            });
        }

        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("cannot create file: {e}")))?;

        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(piece) = body.next().await {
            let bytes = match piece {
                Ok(b) => b,
                Err(e) => {
                    remove_partial(&dest).await;
                    return Err(ToolError::ExecutionFailed(format!("stream failed: {e}")));
                }
            };
            written = written.saturating_add(bytes.len() as u64);
            if written > self.max_bytes {
                remove_partial(&dest).await;
                return Err(ToolError::ExecutionFailed(format!(
                    "download exceeds size cap of {} bytes",
                    self.max_bytes
                )));
            }
            if let Err(e) = file.write_all(&bytes).await {
                remove_partial(&dest).await;
                return Err(ToolError::ExecutionFailed(format!("write failed: {e}")));
            }
        }
        if let Err(e) = file.flush().await {
            remove_partial(&dest).await;
            return Err(ToolError::ExecutionFailed(format!("flush failed: {e}")));
        }

        let mut output = ToolOutput::ok(format!(
            "downloaded {written} bytes to {}",
            dest.display()
        ));
        output.artifacts.push(dest.display().to_string());
        Ok(output)
    }
}

async fn remove_partial(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}
