//! Shared core types: normalized messages, permission tiers, risk levels,
//! tool inputs/outputs, and approval request/response shapes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Media classification for an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

impl MediaKind {
    /// Classify an attachment by its MIME type prefix.
    ///
    /// `image/*` → image, `video/*` → video, `audio/*` → audio,
    /// anything else (including a missing type) → document.
    pub fn from_mime(mime: Option<&str>) -> Self {
        match mime {
            Some(m) if m.starts_with("image/") => Self::Image,
            Some(m) if m.starts_with("video/") => Self::Video,
            Some(m) if m.starts_with("audio/") => Self::Audio,
            _ => Self::Document,
        }
    }
}

/// Where an attachment's payload lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    /// Remote payload reachable at a URL.
    Url(String),
    /// Inline payload bytes.
    Bytes(Vec<u8>),
}

/// A media attachment carried by an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub source: MediaSource,
    pub filename: Option<String>,
    pub mime: Option<String>,
}

/// A normalized inbound message produced by a channel adapter.
///
/// `id` is unique per channel; `channel_name` names the adapter that
/// produced the message. `metadata` carries channel-specific key/value
/// pairs — adapters populate `external_id` and `username` so the identity
/// service can resolve the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel-unique message identifier.
    pub id: String,
    /// Channel-local sender identifier.
    pub user_id: String,
    /// Name of the adapter that produced this message.
    pub channel_name: String,
    /// Conversation identifier within the channel (chat, DM, thread).
    pub channel_id: String,
    /// Message text.
    pub content: String,
    /// Identifier of the message this one replies to, if any.
    pub reply_to: Option<String>,
    /// Attached media.
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata (`external_id`, `username`, …).
    pub metadata: HashMap<String, String>,
    /// When the adapter received the message.
    pub received_at: DateTime<Utc>,
}

/// Output formatting hint for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFormat {
    #[default]
    Plain,
    Markdown,
    Code,
}

/// A button attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageButton {
    /// Label shown to the user.
    pub label: String,
    /// Opaque identifier returned when the button is pressed.
    pub custom_id: String,
}

/// A normalized outbound message handed to a channel adapter.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub content: String,
    pub format: MessageFormat,
    pub buttons: Vec<MessageButton>,
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    /// Plain-text outbound message.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Permission tiers and risk
// ---------------------------------------------------------------------------

/// Per-user permission level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionTier {
    /// Every tool call is auto-approved (the dangerous-command filter still applies).
    Unrestricted,
    /// Low-risk and explicitly allowed calls run; the rest need approval.
    #[default]
    Some,
    /// Every tool call needs approval.
    Restricted,
}

impl std::fmt::Display for PermissionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unrestricted => f.write_str("unrestricted"),
            Self::Some => f.write_str("some"),
            Self::Restricted => f.write_str("restricted"),
        }
    }
}

impl std::str::FromStr for PermissionTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unrestricted" => Ok(Self::Unrestricted),
            "some" => Ok(Self::Some),
            "restricted" => Ok(Self::Restricted),
            other => Err(anyhow::anyhow!("unknown permission tier: {other}")),
        }
    }
}

/// Per-operation severity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => f.write_str("low"),
            Self::Medium => f.write_str("medium"),
            Self::High => f.write_str("high"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool I/O
// ---------------------------------------------------------------------------

/// Input handed to a tool for one invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolInput {
    /// Primary command or subject of the invocation (tool-specific).
    pub command: String,
    /// Named arguments.
    pub args: HashMap<String, serde_json::Value>,
    /// Working directory, when the tool operates on the filesystem.
    pub working_dir: Option<PathBuf>,
    /// Identity of the user on whose behalf the tool runs.
    pub user_id: String,
}

impl ToolInput {
    /// Fetch a string argument by name.
    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(|v| v.as_str())
    }

    /// Fetch a boolean argument by name, defaulting to `false`.
    pub fn arg_bool(&self, name: &str) -> bool {
        self.args
            .get(name)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Fetch an unsigned integer argument by name.
    pub fn arg_u64(&self, name: &str) -> Option<u64> {
        self.args.get(name).and_then(serde_json::Value::as_u64)
    }
}

/// Result of one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Whether the tool completed successfully.
    pub success: bool,
    /// Captured output (subject to the executor's size cap).
    pub output: String,
    /// Error description when `success` is false.
    pub error: Option<String>,
    /// Wall-clock duration of the invocation.
    pub duration: Duration,
    /// Paths or URLs of artifacts the tool produced.
    pub artifacts: Vec<String>,
}

impl ToolOutput {
    /// Successful output with the given text.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    /// Failed output with the given error text.
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// A request for human approval of one tool invocation.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Unique request identifier.
    pub id: String,
    /// User who must answer.
    pub user_id: String,
    /// Tool being gated.
    pub tool: String,
    /// Command or subject under review.
    pub command: String,
    /// Named arguments of the invocation.
    pub args: HashMap<String, serde_json::Value>,
    /// Working directory of the invocation, if any.
    pub working_dir: Option<PathBuf>,
    /// Assessed risk of the invocation.
    pub risk: RiskLevel,
    /// Why approval is needed.
    pub reason: String,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
}

/// The user's answer to an [`ApprovalRequest`].
#[derive(Debug, Clone, Default)]
pub struct ApprovalResponse {
    /// Whether the invocation may proceed.
    pub approved: bool,
    /// Always allow this tool for this user from now on.
    pub always_allow: bool,
    /// Additionally allow this directory for this tool.
    pub allow_dir: Option<String>,
    /// Additionally allow commands matching this pattern.
    pub allow_pattern: Option<String>,
    /// Deny commands matching this pattern from now on.
    pub deny_pattern: Option<String>,
    /// User-modified command to run instead of the original.
    pub modified: Option<String>,
}

impl ApprovalResponse {
    /// A bare approval with no recorded preferences.
    pub fn approve() -> Self {
        Self {
            approved: true,
            ..Self::default()
        }
    }

    /// A bare denial.
    pub fn deny() -> Self {
        Self::default()
    }
}
