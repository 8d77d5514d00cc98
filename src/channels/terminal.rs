//! Terminal adapter: stdin/stdout as a chat channel.
//!
//! Every line typed becomes an inbound message from the local user.
//! Approval dialogs have no buttons here — they are printed with their
//! request id and answered by typing `approve <id>`, `deny <id>`, or
//! `always <id>`. Chunks are printed as they arrive (the terminal is the
//! streaming-capable channel).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TerminalChannelConfig;
use crate::types::{ApprovalRequest, InboundMessage, MessageFormat, OutboundMessage, ToolOutput};

use super::{
    render_approval_text, render_tool_output, push_inbound, AdapterState, ApprovalAction,
    ApprovalCallback, ChannelAdapter, ChannelCapabilities, ChannelError, INBOUND_BUFFER,
};

/// The single conversation id of the console.
pub const CONSOLE_CHANNEL_ID: &str = "console";

/// Dialog lifetime before the sweep expires it.
const DIALOG_LIFETIME_SECS: i64 = 300;

/// Sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialogStatus {
    Sent,
    Responded,
    Expired,
    Dismissed,
}

#[derive(Debug, Clone)]
struct PendingDialog {
    created_at: DateTime<Utc>,
    status: DialogStatus,
}

/// Console adapter for local interactive use.
pub struct TerminalAdapter {
    enabled: bool,
    user_name: String,
    state: Mutex<AdapterState>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    callback: RwLock<Option<ApprovalCallback>>,
    dialogs: Mutex<HashMap<String, PendingDialog>>,
    shutdown_tx: watch::Sender<bool>,
    self_ref: Weak<TerminalAdapter>,
}

impl TerminalAdapter {
    /// Build from configuration.
    pub fn new(config: &TerminalChannelConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            enabled: config.enabled,
            user_name: std::env::var("USER").unwrap_or_else(|_| "local".to_owned()),
            state: Mutex::new(AdapterState::Stopped),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            callback: RwLock::new(None),
            dialogs: Mutex::new(HashMap::new()),
            shutdown_tx,
            self_ref: self_ref.clone(),
        })
    }

    fn set_state(&self, next: AdapterState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn state(&self) -> AdapterState {
        self.state.lock().map(|s| *s).unwrap_or(AdapterState::Stopped)
    }

    async fn read_loop(self: Arc<Self>) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = shutdown_rx.changed() => {
                    info!("terminal read loop shutting down");
                    return;
                }
            };

            match line {
                Ok(Some(line)) => {
                    let line = line.trim().to_owned();
                    if line.is_empty() {
                        continue;
                    }
                    if self.try_handle_approval_line(&line) {
                        continue;
                    }
                    push_inbound(&self.inbound_tx, self.normalize_line(line));
                }
                Ok(None) => {
                    info!("stdin closed, terminal adapter idle");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read from stdin");
                    return;
                }
            }
        }
    }

    /// Interpret `approve|deny|always <id>` lines. Returns whether the
    /// line was consumed as an approval answer.
    fn try_handle_approval_line(&self, line: &str) -> bool {
        let Some((verb, request_id)) = line.split_once(' ') else {
            return false;
        };
        let action = match verb {
            "approve" => ApprovalAction::Approve,
            "deny" => ApprovalAction::Deny,
            "always" => ApprovalAction::AlwaysAllow,
            _ => return false,
        };
        let request_id = request_id.trim().to_owned();

        let live = {
            let Ok(mut dialogs) = self.dialogs.lock() else {
                return true;
            };
            match dialogs.get_mut(&request_id) {
                Some(dialog) if dialog.status == DialogStatus::Sent => {
                    dialog.status = DialogStatus::Responded;
                    true
                }
                _ => false,
            }
        };

        if !live {
            println!("[approval] Request expired or already handled");
            return true;
        }

        debug!(request_id = %request_id, action = ?action, "console approval answer");
        let callback = self
            .callback
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(Arc::clone));
        match callback {
            Some(callback) => callback(request_id, action),
            None => warn!("approval answered but no callback installed"),
        }
        true
    }

    fn normalize_line(&self, content: String) -> InboundMessage {
        let mut metadata = HashMap::new();
        metadata.insert("external_id".to_owned(), self.user_name.clone());
        metadata.insert("username".to_owned(), self.user_name.clone());

        InboundMessage {
            id: Uuid::new_v4().to_string(),
            user_id: self.user_name.clone(),
            channel_name: "terminal".to_owned(),
            channel_id: CONSOLE_CHANNEL_ID.to_owned(),
            content,
            reply_to: None,
            media: vec![],
            metadata,
            received_at: Utc::now(),
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep_dialogs(),
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    fn sweep_dialogs(&self) {
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::TimeDelta::seconds(DIALOG_LIFETIME_SECS))
            .unwrap_or_else(Utc::now);
        let Ok(mut dialogs) = self.dialogs.lock() else {
            return;
        };
        for (request_id, dialog) in dialogs.iter_mut() {
            if dialog.status == DialogStatus::Sent && dialog.created_at < cutoff {
                dialog.status = DialogStatus::Expired;
                println!("[approval {request_id}] ⏰ Approval request expired");
            }
        }
    }
}

#[async_trait]
impl ChannelAdapter for TerminalAdapter {
    fn name(&self) -> &str {
        "terminal"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            media: false,
            buttons: false,
            threading: false,
            editing: false,
            streaming: true,
        }
    }

    async fn start(&self) -> Result<(), ChannelError> {
        if !self.enabled {
            return Err(ChannelError::NotEnabled("terminal".to_owned()));
        }
        if self.state() != AdapterState::Stopped {
            return Err(ChannelError::AlreadyRunning("terminal".to_owned()));
        }
        self.set_state(AdapterState::Starting);

        let this = self.self_ref.upgrade().ok_or_else(|| {
            ChannelError::Api("adapter dropped during start".to_owned())
        })?;
        tokio::spawn(Arc::clone(&this).read_loop());
        tokio::spawn(this.sweep_loop());

        self.set_state(AdapterState::Running);
        info!("terminal adapter started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        if self.state() == AdapterState::Stopped {
            return Ok(());
        }
        self.set_state(AdapterState::Stopping);
        let _ = self.shutdown_tx.send(true);
        self.set_state(AdapterState::Stopped);
        Ok(())
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    async fn send_message(
        &self,
        _channel_id: &str,
        message: OutboundMessage,
    ) -> Result<(), ChannelError> {
        match message.format {
            MessageFormat::Code => println!("```\n{}\n```", message.content),
            _ => print!("{}", message.content),
        }
        // Chunked output arrives without trailing newlines; flush so the
        // user sees partial lines immediately.
        use std::io::Write as _;
        let _ = std::io::stdout().flush();
        Ok(())
    }

    async fn send_approval_request(
        &self,
        _channel_id: &str,
        request: &ApprovalRequest,
    ) -> Result<(), ChannelError> {
        println!("\n{}", render_approval_text(request));
        println!(
            "[approval {id}] reply with: approve {id} | deny {id} | always {id}",
            id = request.id
        );
        if let Ok(mut dialogs) = self.dialogs.lock() {
            dialogs.insert(
                request.id.clone(),
                PendingDialog {
                    created_at: Utc::now(),
                    status: DialogStatus::Sent,
                },
            );
        }
        Ok(())
    }

    async fn send_tool_output(
        &self,
        _channel_id: &str,
        output: &ToolOutput,
    ) -> Result<(), ChannelError> {
        println!("\n{}", render_tool_output(output));
        Ok(())
    }

    async fn dismiss_approval(&self, request_id: &str) -> Result<(), ChannelError> {
        let dismissed = {
            let Ok(mut dialogs) = self.dialogs.lock() else {
                return Ok(());
            };
            match dialogs.get_mut(request_id) {
                Some(dialog) if dialog.status == DialogStatus::Sent => {
                    dialog.status = DialogStatus::Dismissed;
                    true
                }
                _ => false,
            }
        };
        if dismissed {
            println!("[approval {request_id}] dismissed");
        }
        Ok(())
    }

    fn set_approval_callback(&self, callback: ApprovalCallback) {
        if let Ok(mut slot) = self.callback.write() {
            *slot = Some(callback);
        }
    }
}
