//! Telegram Bot API adapter.
//!
//! Long-polls `getUpdates` for incoming messages, normalizes them into
//! [`InboundMessage`]s, and sends outbound text via `sendMessage`. Approval
//! dialogs are inline keyboards whose callback data encodes
//! `"<action>:<request-id>"`; answered, dismissed, and expired dialogs are
//! edited in place with their buttons stripped. A 30-second sweep expires
//! dialogs older than five minutes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{resolve_env_ref, TelegramChannelConfig};
use crate::types::{
    ApprovalRequest, InboundMessage, MediaAttachment, MediaKind, MediaSource, MessageFormat,
    OutboundMessage, ToolOutput,
};

use super::{
    encode_custom_id, parse_custom_id, push_inbound, render_approval_text, render_tool_output,
    AdapterState, ApprovalAction, ApprovalCallback, ChannelAdapter, ChannelCapabilities,
    ChannelError, INBOUND_BUFFER,
};

/// Base URL for the Telegram Bot API.
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Initial backoff on poll failure, in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum backoff on poll failure, in milliseconds.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Dialog expiry sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How long an approval dialog stays answerable.
const DIALOG_LIFETIME_SECS: i64 = 300;

/// Extra seconds added to the HTTP timeout beyond the long-poll timeout,
/// so the TCP socket stays open while Telegram holds the request.
const POLL_TIMEOUT_MARGIN_SECS: u64 = 10;

/// Ack text for button presses on unknown or already-handled dialogs.
const STALE_CALLBACK_TEXT: &str = "Request expired or already handled";

// ---------------------------------------------------------------------------
// Telegram API types (minimal subset)
// ---------------------------------------------------------------------------

/// Generic Telegram Bot API response wrapper.
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Telegram `Update` object.
#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
    callback_query: Option<TelegramCallbackQuery>,
}

/// Telegram `Message` object (subset of fields we use).
#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    from: Option<TelegramUser>,
    chat: TelegramChat,
    text: Option<String>,
    caption: Option<String>,
    photo: Option<Vec<TelegramPhotoSize>>,
    document: Option<TelegramDocument>,
    voice: Option<TelegramVoice>,
    audio: Option<TelegramAudio>,
    video: Option<TelegramVideo>,
    reply_to_message: Option<Box<TelegramMessage>>,
}

/// Telegram `User` object.
#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    first_name: String,
    username: Option<String>,
}

/// Telegram `Chat` object.
#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

/// Telegram `CallbackQuery` object.
#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    from: TelegramUser,
    data: Option<String>,
}

/// Telegram `PhotoSize` object.
#[derive(Debug, Deserialize)]
struct TelegramPhotoSize {
    file_id: String,
}

/// Telegram `Document` object.
#[derive(Debug, Deserialize)]
struct TelegramDocument {
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
}

/// Telegram `Voice` object.
#[derive(Debug, Deserialize)]
struct TelegramVoice {
    file_id: String,
    mime_type: Option<String>,
}

/// Telegram `Audio` object.
#[derive(Debug, Deserialize)]
struct TelegramAudio {
    file_id: String,
    mime_type: Option<String>,
}

/// Telegram `Video` object.
#[derive(Debug, Deserialize)]
struct TelegramVideo {
    file_id: String,
    mime_type: Option<String>,
}

/// Inline keyboard markup for approval buttons.
#[derive(Debug, Serialize)]
struct InlineKeyboardMarkup {
    inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

/// A single inline keyboard button.
#[derive(Debug, Serialize)]
struct InlineKeyboardButton {
    text: String,
    callback_data: String,
}

// ---------------------------------------------------------------------------
// Dialog state machine
// ---------------------------------------------------------------------------

/// Per-dialog status: `sent → {responded, expired, dismissed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialogStatus {
    Sent,
    Responded,
    Expired,
    Dismissed,
}

/// One tracked approval dialog message.
#[derive(Debug, Clone)]
struct PendingDialog {
    chat_id: String,
    message_id: i64,
    created_at: DateTime<Utc>,
    status: DialogStatus,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Telegram Bot API adapter.
pub struct TelegramAdapter {
    enabled: bool,
    bot_token: String,
    poll_timeout_seconds: u32,
    client: reqwest::Client,
    state: Mutex<AdapterState>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    callback: RwLock<Option<ApprovalCallback>>,
    dialogs: Mutex<HashMap<String, PendingDialog>>,
    bot_id: AtomicI64,
    shutdown_tx: watch::Sender<bool>,
    /// Self-handle for spawning the poll and sweep tasks from `start`.
    self_ref: Weak<TelegramAdapter>,
}

impl TelegramAdapter {
    /// Build from configuration. The bot token may be an `${ENV}` reference.
    pub fn new(config: &TelegramChannelConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            enabled: config.enabled,
            bot_token: resolve_env_ref(&config.bot_token),
            poll_timeout_seconds: config.poll_timeout_seconds,
            client: reqwest::Client::new(),
            state: Mutex::new(AdapterState::Stopped),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            callback: RwLock::new(None),
            dialogs: Mutex::new(HashMap::new()),
            bot_id: AtomicI64::new(0),
            shutdown_tx,
            self_ref: self_ref.clone(),
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{TELEGRAM_API_BASE}/bot{}/{method}", self.bot_token)
    }

    fn set_state(&self, next: AdapterState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn state(&self) -> AdapterState {
        self.state.lock().map(|s| *s).unwrap_or(AdapterState::Stopped)
    }

    // ------------------------------------------------------------------
    // API calls
    // ------------------------------------------------------------------

    /// Call an API method, returning the decoded `result`.
    async fn call_api<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<T, ChannelError> {
        let mut request = self.client.post(self.api_url(method)).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response: TelegramResponse<T> = request.send().await?.json().await?;
        if !response.ok {
            return Err(ChannelError::Api(
                response
                    .description
                    .unwrap_or_else(|| format!("{method} failed")),
            ));
        }
        response
            .result
            .ok_or_else(|| ChannelError::Api(format!("{method} returned no result")))
    }

    /// Discover the bot's own user id so its messages can be discarded.
    async fn fetch_bot_id(&self) -> Result<i64, ChannelError> {
        let me: TelegramUser = self
            .call_api("getMe", serde_json::json!({}), None)
            .await?;
        Ok(me.id)
    }

    /// Long-poll `getUpdates`.
    async fn poll_updates(&self, offset: Option<i64>) -> Result<Vec<TelegramUpdate>, ChannelError> {
        let mut params = serde_json::json!({
            "timeout": self.poll_timeout_seconds,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(off) = offset {
            params["offset"] = serde_json::Value::from(off);
        }
        let http_timeout = Duration::from_secs(
            u64::from(self.poll_timeout_seconds).saturating_add(POLL_TIMEOUT_MARGIN_SECS),
        );
        self.call_api("getUpdates", params, Some(http_timeout)).await
    }

    async fn api_send_message(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
        reply_markup: Option<&InlineKeyboardMarkup>,
        reply_to: Option<&str>,
    ) -> Result<TelegramMessage, ChannelError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = serde_json::Value::from(mode);
        }
        if let Some(markup) = reply_markup {
            body["reply_markup"] =
                serde_json::to_value(markup).map_err(|e| ChannelError::Api(e.to_string()))?;
        }
        if let Some(reply_to) = reply_to.and_then(|r| r.parse::<i64>().ok()) {
            body["reply_to_message_id"] = serde_json::Value::from(reply_to);
        }
        self.call_api("sendMessage", body, None).await
    }

    /// Edit a dialog message in place and strip its buttons.
    async fn edit_dialog(&self, chat_id: &str, message_id: i64, text: &str) {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "reply_markup": {"inline_keyboard": []},
        });
        if let Err(e) = self
            .call_api::<serde_json::Value>("editMessageText", body, None)
            .await
        {
            warn!(error = %e, chat_id, message_id, "failed to edit approval dialog");
        }
    }

    /// Answer a callback query so the client stops its spinner.
    async fn ack_callback(&self, callback_id: &str, text: Option<&str>) {
        let mut body = serde_json::json!({"callback_query_id": callback_id});
        if let Some(text) = text {
            body["text"] = serde_json::Value::from(text);
        }
        if let Err(e) = self
            .call_api::<serde_json::Value>("answerCallbackQuery", body, None)
            .await
        {
            debug!(error = %e, "failed to answer callback query");
        }
    }

    // ------------------------------------------------------------------
    // Poll loop
    // ------------------------------------------------------------------

    async fn poll_loop(self: Arc<Self>) {
        let mut offset: Option<i64> = None;
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let updates = tokio::select! {
                result = self.poll_updates(offset) => result,
                _ = shutdown_rx.changed() => {
                    info!("telegram poll loop shutting down");
                    return;
                }
            };

            match updates {
                Ok(updates) => {
                    backoff_ms = INITIAL_BACKOFF_MS;
                    for update in updates {
                        offset = Some(update.update_id.saturating_add(1));
                        self.handle_update(update).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms, "telegram poll error, backing off");
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        _ = shutdown_rx.changed() => return,
                    }
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    async fn handle_update(&self, update: TelegramUpdate) {
        if let Some(message) = update.message {
            if let Some(inbound) = self.normalize_message(&message) {
                debug!(message_id = %inbound.id, "normalized telegram message");
                push_inbound(&self.inbound_tx, inbound);
            }
            return;
        }
        if let Some(callback) = update.callback_query {
            self.handle_callback(callback).await;
        }
    }

    /// Handle an approval button press.
    async fn handle_callback(&self, callback: TelegramCallbackQuery) {
        let Some((action, request_id)) = callback.data.as_deref().and_then(parse_custom_id) else {
            self.ack_callback(&callback.id, Some(STALE_CALLBACK_TEXT)).await;
            return;
        };

        // Only a dialog still in `sent` may transition; everything else is
        // a stale press.
        let dialog = {
            let Ok(mut dialogs) = self.dialogs.lock() else {
                return;
            };
            match dialogs.get_mut(&request_id) {
                Some(dialog) if dialog.status == DialogStatus::Sent => {
                    dialog.status = DialogStatus::Responded;
                    Some(dialog.clone())
                }
                _ => None,
            }
        };

        let Some(dialog) = dialog else {
            self.ack_callback(&callback.id, Some(STALE_CALLBACK_TEXT)).await;
            return;
        };

        info!(
            request_id = %request_id,
            action = ?action,
            from = callback.from.id,
            "approval button pressed"
        );

        let edited = match action {
            ApprovalAction::Approve => "✅ Approved",
            ApprovalAction::Deny => "❌ Denied",
            ApprovalAction::AlwaysAllow => "✅ Always allowed",
        };
        self.edit_dialog(&dialog.chat_id, dialog.message_id, edited)
            .await;
        self.ack_callback(&callback.id, None).await;

        let callback_fn = self
            .callback
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(Arc::clone));
        match callback_fn {
            Some(callback_fn) => callback_fn(request_id, action),
            None => warn!("approval button pressed but no callback installed"),
        }
    }

    // ------------------------------------------------------------------
    // Normalization
    // ------------------------------------------------------------------

    /// Normalize a Telegram message. Returns `None` for messages without a
    /// sender and for the bot's own messages.
    fn normalize_message(&self, message: &TelegramMessage) -> Option<InboundMessage> {
        let from = message.from.as_ref()?;
        if from.id == self.bot_id.load(Ordering::SeqCst) {
            return None;
        }

        let content = message
            .text
            .clone()
            .or_else(|| message.caption.clone())
            .unwrap_or_default();

        let mut metadata = HashMap::new();
        metadata.insert("external_id".to_owned(), from.id.to_string());
        metadata.insert(
            "username".to_owned(),
            from.username.clone().unwrap_or_else(|| from.first_name.clone()),
        );

        Some(InboundMessage {
            id: message.message_id.to_string(),
            user_id: from.id.to_string(),
            channel_name: "telegram".to_owned(),
            channel_id: message.chat.id.to_string(),
            content,
            reply_to: message
                .reply_to_message
                .as_ref()
                .map(|r| r.message_id.to_string()),
            media: collect_media(message),
            metadata,
            received_at: Utc::now(),
        })
    }

    // ------------------------------------------------------------------
    // Dialog sweep
    // ------------------------------------------------------------------

    async fn sweep_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep_dialogs().await,
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// Expire dialogs older than five minutes: edit to "expired", strip
    /// buttons, keep the entry so late presses read as stale.
    async fn sweep_dialogs(&self) {
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::TimeDelta::seconds(DIALOG_LIFETIME_SECS))
            .unwrap_or_else(Utc::now);

        let expired: Vec<(String, PendingDialog)> = {
            let Ok(mut dialogs) = self.dialogs.lock() else {
                return;
            };
            dialogs
                .iter_mut()
                .filter(|(_, d)| d.status == DialogStatus::Sent && d.created_at < cutoff)
                .map(|(id, d)| {
                    d.status = DialogStatus::Expired;
                    (id.clone(), d.clone())
                })
                .collect()
        };

        for (request_id, dialog) in expired {
            info!(request_id = %request_id, "approval dialog expired");
            self.edit_dialog(
                &dialog.chat_id,
                dialog.message_id,
                "⏰ Approval request expired",
            )
            .await;
        }
    }
}

/// Classify a message's attachments by MIME prefix.
fn collect_media(message: &TelegramMessage) -> Vec<MediaAttachment> {
    let mut media = Vec::new();

    if let Some(photos) = &message.photo {
        // Telegram sends several sizes; keep the largest (last).
        if let Some(photo) = photos.last() {
            media.push(MediaAttachment {
                kind: MediaKind::Image,
                source: MediaSource::Url(file_ref(&photo.file_id)),
                filename: None,
                mime: Some("image/jpeg".to_owned()),
            });
        }
    }
    if let Some(document) = &message.document {
        media.push(MediaAttachment {
            kind: MediaKind::from_mime(document.mime_type.as_deref()),
            source: MediaSource::Url(file_ref(&document.file_id)),
            filename: document.file_name.clone(),
            mime: document.mime_type.clone(),
        });
    }
    if let Some(voice) = &message.voice {
        media.push(MediaAttachment {
            kind: MediaKind::Audio,
            source: MediaSource::Url(file_ref(&voice.file_id)),
            filename: None,
            mime: voice.mime_type.clone(),
        });
    }
    if let Some(audio) = &message.audio {
        media.push(MediaAttachment {
            kind: MediaKind::Audio,
            source: MediaSource::Url(file_ref(&audio.file_id)),
            filename: None,
            mime: audio.mime_type.clone(),
        });
    }
    if let Some(video) = &message.video {
        media.push(MediaAttachment {
            kind: MediaKind::Video,
            source: MediaSource::Url(file_ref(&video.file_id)),
            filename: None,
            mime: video.mime_type.clone(),
        });
    }

    media
}

/// Reference URI for a Telegram file id (resolved via `getFile` on demand).
fn file_ref(file_id: &str) -> String {
    format!("tg-file://{file_id}")
}

/// Escape Telegram MarkdownV2 reserved characters.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '='
                | '|' | '{' | '}' | '.' | '!'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    fn is_enabled(&self) -> bool {
        self.enabled && !self.bot_token.is_empty()
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            media: true,
            buttons: true,
            threading: true,
            editing: true,
            streaming: false,
        }
    }

    async fn start(&self) -> Result<(), ChannelError> {
        if !self.is_enabled() {
            return Err(ChannelError::NotEnabled("telegram".to_owned()));
        }
        if self.state() != AdapterState::Stopped {
            return Err(ChannelError::AlreadyRunning("telegram".to_owned()));
        }
        self.set_state(AdapterState::Starting);

        let bot_id = self.fetch_bot_id().await.inspect_err(|_| {
            self.set_state(AdapterState::Stopped);
        })?;
        self.bot_id.store(bot_id, Ordering::SeqCst);
        info!(bot_id, "telegram adapter connected");

        // The poll and sweep tasks hold the adapter alive until shutdown.
        let this = self.self_ref.upgrade().ok_or_else(|| {
            ChannelError::Api("adapter dropped during start".to_owned())
        })?;
        tokio::spawn(Arc::clone(&this).poll_loop());
        tokio::spawn(this.sweep_loop());

        self.set_state(AdapterState::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        if self.state() == AdapterState::Stopped {
            return Ok(());
        }
        self.set_state(AdapterState::Stopping);
        let _ = self.shutdown_tx.send(true);
        self.set_state(AdapterState::Stopped);
        info!("telegram adapter stopped");
        Ok(())
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    async fn send_message(
        &self,
        channel_id: &str,
        message: OutboundMessage,
    ) -> Result<(), ChannelError> {
        let (text, parse_mode) = match message.format {
            MessageFormat::Plain => (message.content, None),
            MessageFormat::Markdown => (message.content, Some("Markdown")),
            MessageFormat::Code => (
                format!("```\n{}\n```", message.content.replace('`', "\\`")),
                Some("MarkdownV2"),
            ),
        };
        self.api_send_message(
            channel_id,
            &text,
            parse_mode,
            None,
            message.reply_to.as_deref(),
        )
        .await?;
        Ok(())
    }

    async fn send_approval_request(
        &self,
        channel_id: &str,
        request: &ApprovalRequest,
    ) -> Result<(), ChannelError> {
        let keyboard = InlineKeyboardMarkup {
            inline_keyboard: vec![vec![
                InlineKeyboardButton {
                    text: "Approve".to_owned(),
                    callback_data: encode_custom_id(ApprovalAction::Approve, &request.id),
                },
                InlineKeyboardButton {
                    text: "Deny".to_owned(),
                    callback_data: encode_custom_id(ApprovalAction::Deny, &request.id),
                },
                InlineKeyboardButton {
                    text: "Always Allow".to_owned(),
                    callback_data: encode_custom_id(ApprovalAction::AlwaysAllow, &request.id),
                },
            ]],
        };

        let text = render_approval_text(request);
        let sent = self
            .api_send_message(channel_id, &text, None, Some(&keyboard), None)
            .await?;

        if let Ok(mut dialogs) = self.dialogs.lock() {
            dialogs.insert(
                request.id.clone(),
                PendingDialog {
                    chat_id: channel_id.to_owned(),
                    message_id: sent.message_id,
                    created_at: Utc::now(),
                    status: DialogStatus::Sent,
                },
            );
        }
        Ok(())
    }

    async fn send_tool_output(
        &self,
        channel_id: &str,
        output: &ToolOutput,
    ) -> Result<(), ChannelError> {
        self.api_send_message(channel_id, &render_tool_output(output), None, None, None)
            .await?;
        Ok(())
    }

    async fn dismiss_approval(&self, request_id: &str) -> Result<(), ChannelError> {
        let dialog = {
            let Ok(mut dialogs) = self.dialogs.lock() else {
                return Ok(());
            };
            match dialogs.get_mut(request_id) {
                Some(dialog) if dialog.status == DialogStatus::Sent => {
                    dialog.status = DialogStatus::Dismissed;
                    Some(dialog.clone())
                }
                // Already responded/expired or unknown: no-op by contract.
                _ => None,
            }
        };
        if let Some(dialog) = dialog {
            self.edit_dialog(&dialog.chat_id, dialog.message_id, "Approval dismissed")
                .await;
        }
        Ok(())
    }

    fn set_approval_callback(&self, callback: ApprovalCallback) {
        if let Ok(mut slot) = self.callback.write() {
            *slot = Some(callback);
        }
    }
}
