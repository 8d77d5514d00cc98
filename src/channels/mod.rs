//! Channel adapters: the boundary between external chat protocols and the
//! normalized message shapes the agent loop consumes.
//!
//! Every adapter implements [`ChannelAdapter`]: a uniform capability set
//! covering lifecycle (`start`/`stop`), an inbound message stream, outbound
//! sends, approval dialogs with button callbacks, and tool-output
//! rendering. Adapters own their protocol state; the agent loop reaches
//! them only through this trait and the [`router::ChannelRouter`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{ApprovalRequest, InboundMessage, OutboundMessage, RiskLevel, ToolOutput};

pub mod router;
pub mod telegram;
pub mod terminal;

/// Inbound buffer size per adapter. On overflow the newest message is
/// dropped with a warning rather than blocking the protocol loop.
pub const INBOUND_BUFFER: usize = 100;

/// What a channel can render.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelCapabilities {
    pub media: bool,
    pub buttons: bool,
    pub threading: bool,
    pub editing: bool,
    /// Whether the agent loop should forward think-chunks as they arrive
    /// instead of buffering the full reply.
    pub streaming: bool,
}

/// Adapter lifecycle states. Transitions are non-overlapping:
/// `stopped → starting → running → stopping → stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// The three approval dialog buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Approve,
    Deny,
    AlwaysAllow,
}

/// Callback adapters invoke when the user answers an approval dialog.
pub type ApprovalCallback = Arc<dyn Fn(String, ApprovalAction) + Send + Sync>;

/// Channel adapter errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The adapter is disabled by configuration.
    #[error("channel '{0}' is not enabled")]
    NotEnabled(String),
    /// Start was called while already running.
    #[error("channel '{0}' is already running")]
    AlreadyRunning(String),
    /// No adapter registered under this name.
    #[error("channel not found: {0}")]
    NotFound(String),
    /// The remote chat API rejected a call.
    #[error("channel API error: {0}")]
    Api(String),
    /// HTTP transport failure.
    #[error("channel HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// Several adapters failed during a bulk stop.
    #[error("errors stopping channels: {0}")]
    Aggregate(String),
}

/// The uniform adapter contract.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Registry name (also the `channel_name` on inbound messages).
    fn name(&self) -> &str;

    /// Whether configuration enables this adapter.
    fn is_enabled(&self) -> bool;

    /// What this channel can render.
    fn capabilities(&self) -> ChannelCapabilities;

    /// Connect and start producing inbound messages.
    async fn start(&self) -> Result<(), ChannelError>;

    /// Disconnect. Idempotent.
    async fn stop(&self) -> Result<(), ChannelError>;

    /// Take the inbound message stream. Single consumer: the first call
    /// returns the receiver, later calls return `None`.
    fn take_incoming(&self) -> Option<mpsc::Receiver<InboundMessage>>;

    /// Send a message into a conversation.
    async fn send_message(
        &self,
        channel_id: &str,
        message: OutboundMessage,
    ) -> Result<(), ChannelError>;

    /// Render an approval dialog with approve/deny/always-allow buttons.
    async fn send_approval_request(
        &self,
        channel_id: &str,
        request: &ApprovalRequest,
    ) -> Result<(), ChannelError>;

    /// Render a tool result.
    async fn send_tool_output(
        &self,
        channel_id: &str,
        output: &ToolOutput,
    ) -> Result<(), ChannelError>;

    /// Mark an approval dialog as dismissed (edit in place, strip buttons).
    /// A no-op for unknown or already-resolved dialogs.
    async fn dismiss_approval(&self, request_id: &str) -> Result<(), ChannelError>;

    /// Install the callback invoked on approval button presses.
    fn set_approval_callback(&self, callback: ApprovalCallback);
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Encode an approval button id as `"<action>:<request-id>"`.
pub fn encode_custom_id(action: ApprovalAction, request_id: &str) -> String {
    let action = match action {
        ApprovalAction::Approve => "approve",
        ApprovalAction::Deny => "deny",
        ApprovalAction::AlwaysAllow => "always",
    };
    format!("{action}:{request_id}")
}

/// Decode an approval button id. Returns `None` for unknown shapes.
pub fn parse_custom_id(custom_id: &str) -> Option<(ApprovalAction, String)> {
    let (action, request_id) = custom_id.split_once(':')?;
    let action = match action {
        "approve" => ApprovalAction::Approve,
        "deny" => ApprovalAction::Deny,
        "always" => ApprovalAction::AlwaysAllow,
        _ => return None,
    };
    if request_id.is_empty() {
        return None;
    }
    Some((action, request_id.to_owned()))
}

/// Push an inbound message onto a bounded adapter buffer.
///
/// Drop-newest on overflow: the message is discarded and a warning logged,
/// so a slow consumer can never stall the protocol loop.
pub fn push_inbound(tx: &mpsc::Sender<InboundMessage>, message: InboundMessage) {
    if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(message) {
        warn!(
            channel = %dropped.channel_name,
            message_id = %dropped.id,
            "inbound buffer full, dropping newest message"
        );
    }
}

/// Glyph for a risk level in approval dialogs.
pub fn risk_glyph(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "🟢",
        RiskLevel::Medium => "🟡",
        RiskLevel::High => "🔴",
    }
}

/// Render an approval dialog body.
pub fn render_approval_text(request: &ApprovalRequest) -> String {
    let mut text = format!(
        "{} Approval required: {} ({} risk)\n",
        risk_glyph(request.risk),
        request.tool,
        request.risk
    );
    text.push_str(&format!("Command: {}\n", request.command));
    if let Some(dir) = &request.working_dir {
        text.push_str(&format!("Directory: {}\n", dir.display()));
    }
    text.push_str(&format!("Reason: {}", request.reason));
    text
}

/// Render a tool output body: success glyph, duration, output, error.
pub fn render_tool_output(output: &ToolOutput) -> String {
    let glyph = if output.success { "✅" } else { "❌" };
    let mut text = format!("{glyph} ({:.1}s)\n", output.duration.as_secs_f64());
    if !output.output.is_empty() {
        text.push_str(&output.output);
    }
    if let Some(error) = &output.error {
        if !output.output.is_empty() {
            text.push('\n');
        }
        text.push_str(&format!("Error: {error}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn custom_id_roundtrip() {
        for action in [
            ApprovalAction::Approve,
            ApprovalAction::Deny,
            ApprovalAction::AlwaysAllow,
        ] {
            let encoded = encode_custom_id(action, "req-1");
            let (decoded, id) = parse_custom_id(&encoded).expect("parse");
            assert_eq!(decoded, action);
            assert_eq!(id, "req-1");
        }
    }

    #[test]
    fn custom_id_rejects_garbage() {
        assert!(parse_custom_id("nonsense").is_none());
        assert!(parse_custom_id("explode:req-1").is_none());
        assert!(parse_custom_id("approve:").is_none());
    }

    #[test]
    fn custom_id_keeps_colons_in_request_id() {
        let (_, id) = parse_custom_id("approve:a:b:c").expect("parse");
        assert_eq!(id, "a:b:c");
    }

    #[tokio::test]
    async fn push_inbound_drops_newest_on_overflow() {
        let (tx, mut rx) = mpsc::channel(2);
        for i in 0..3 {
            let message = InboundMessage {
                id: i.to_string(),
                user_id: "u".to_owned(),
                channel_name: "test".to_owned(),
                channel_id: "c".to_owned(),
                content: String::new(),
                reply_to: None,
                media: vec![],
                metadata: Default::default(),
                received_at: chrono::Utc::now(),
            };
            push_inbound(&tx, message);
        }

        // The first two survive in order; the third was dropped.
        assert_eq!(rx.recv().await.expect("first").id, "0");
        assert_eq!(rx.recv().await.expect("second").id, "1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tool_output_rendering() {
        let ok = ToolOutput {
            success: true,
            output: "done".to_owned(),
            duration: Duration::from_millis(1500),
            ..Default::default()
        };
        let rendered = render_tool_output(&ok);
        assert!(rendered.starts_with("✅ (1.5s)"));
        assert!(rendered.contains("done"));

        let failed = ToolOutput {
            success: false,
            output: String::new(),
            error: Some("command timed out".to_owned()),
            ..Default::default()
        };
        let rendered = render_tool_output(&failed);
        assert!(rendered.starts_with("❌"));
        assert!(rendered.contains("Error: command timed out"));
    }

    #[test]
    fn approval_text_carries_risk_glyph() {
        let request = ApprovalRequest {
            id: "a1".to_owned(),
            user_id: "u1".to_owned(),
            tool: "shell".to_owned(),
            command: "make deploy".to_owned(),
            args: Default::default(),
            working_dir: Some("/srv/app".into()),
            risk: RiskLevel::High,
            reason: "tier requires approval".to_owned(),
            created_at: chrono::Utc::now(),
        };
        let text = render_approval_text(&request);
        assert!(text.starts_with("🔴"));
        assert!(text.contains("make deploy"));
        assert!(text.contains("/srv/app"));
    }
}
