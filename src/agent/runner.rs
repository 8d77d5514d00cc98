//! The cooperative supervisor driving the assistant.
//!
//! One reader task per registered adapter blocks on that adapter's
//! inbound stream. Per message: resolve the user, recall memories, drive
//! the lane router (streaming chunks to channels that can render them),
//! extract tool calls from the reply, run them through the executor, and
//! answer through the originating adapter. Approval dialogs flow the other
//! way: the broker's notifier renders them on the right channel, and every
//! adapter's button callback feeds the broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::approvals::rendezvous::{ApprovalBroker, ApprovalNotifier};
use crate::channels::router::ChannelRouter;
use crate::channels::{ApprovalAction, ChannelAdapter};
use crate::identity::IdentityService;
use crate::inference::router::LaneRouter;
use crate::inference::{ChatRole, ChatTurn, ThinkRequest};
use crate::memory::{Memory, MemoryStore, RecallQuery};
use crate::tools::executor::{ExecuteRequest, ExecutionResult, ExecutorError, ToolExecutor};
use crate::types::{
    ApprovalRequest, ApprovalResponse, InboundMessage, OutboundMessage, ToolInput, ToolOutput,
};

use super::tool_call::{ParsedToolCall, ToolCallParser};

/// Turns of history kept per conversation.
const MAX_HISTORY_TURNS: usize = 40;

/// Memories recalled per message.
const MEMORY_RECALL_LIMIT: usize = 5;

/// Tool rounds allowed per inbound message.
const MAX_TOOL_ROUNDS: usize = 4;

/// Everything the loop needs, constructed once at startup.
pub struct AgentLoop {
    identity: Arc<IdentityService>,
    lanes: Arc<LaneRouter>,
    channels: Arc<ChannelRouter>,
    executor: Arc<ToolExecutor>,
    broker: Arc<ApprovalBroker>,
    memory: Arc<dyn MemoryStore>,
    parser: Arc<dyn ToolCallParser>,
    persona: String,
    /// Conversation history keyed by `(channel, channel-id)`.
    histories: Mutex<HashMap<(String, String), Vec<ChatTurn>>>,
    /// Where each user's approval dialogs should be rendered: the channel
    /// and conversation of their most recent message.
    routes: Arc<Mutex<HashMap<String, (String, String)>>>,
}

/// Notifier handed to the broker: renders a fresh approval dialog on the
/// adapter the requesting user last spoke through.
struct DialogNotifier {
    channels: Arc<ChannelRouter>,
    routes: Arc<Mutex<HashMap<String, (String, String)>>>,
}

#[async_trait::async_trait]
impl ApprovalNotifier for DialogNotifier {
    async fn approval_opened(&self, request: ApprovalRequest) {
        let route = {
            let Ok(routes) = self.routes.lock() else {
                return;
            };
            routes.get(&request.user_id).cloned()
        };
        let Some((channel_name, channel_id)) = route else {
            warn!(user_id = %request.user_id, "no route for approval dialog");
            return;
        };
        match self.channels.get(&channel_name) {
            Ok(adapter) => {
                if let Err(e) = adapter.send_approval_request(&channel_id, &request).await {
                    error!(error = %e, channel = %channel_name, "failed to render approval dialog");
                }
            }
            Err(e) => error!(error = %e, "approval dialog channel vanished"),
        }
    }
}

impl AgentLoop {
    /// Assemble the loop. No tasks run until [`run`](Self::run).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<IdentityService>,
        lanes: Arc<LaneRouter>,
        channels: Arc<ChannelRouter>,
        executor: Arc<ToolExecutor>,
        broker: Arc<ApprovalBroker>,
        memory: Arc<dyn MemoryStore>,
        parser: Arc<dyn ToolCallParser>,
        persona: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            lanes,
            channels,
            executor,
            broker,
            memory,
            parser,
            persona,
            histories: Mutex::new(HashMap::new()),
            routes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Wire approvals and spawn one reader task per adapter.
    ///
    /// Returns the reader handles; they run until their adapter's inbound
    /// stream closes.
    pub fn run(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        // Dialogs out: the broker renders through the originating adapter.
        self.broker.set_notifier(Arc::new(DialogNotifier {
            channels: Arc::clone(&self.channels),
            routes: Arc::clone(&self.routes),
        }));

        // Answers in: every adapter's buttons feed the broker.
        for adapter in self.channels.all() {
            let broker = Arc::clone(&self.broker);
            adapter.set_approval_callback(Arc::new(move |request_id, action| {
                let response = approval_response_for(action);
                if let Err(e) = broker.respond(&request_id, response) {
                    // Late or duplicate answers are expected; the adapter
                    // already told the user.
                    debug!(request_id = %request_id, error = %e, "approval answer dropped");
                }
            }));
        }

        let mut handles = Vec::new();
        for adapter in self.channels.all() {
            let Some(mut incoming) = adapter.take_incoming() else {
                continue;
            };
            let this = Arc::clone(self);
            let name = adapter.name().to_owned();
            handles.push(tokio::spawn(async move {
                info!(channel = %name, "reader task started");
                while let Some(message) = incoming.recv().await {
                    this.handle_message(message).await;
                }
                info!(channel = %name, "inbound stream closed");
            }));
        }
        handles
    }

    /// Process one inbound message end to end.
    pub async fn handle_message(&self, message: InboundMessage) {
        let adapter = match self.channels.get(&message.channel_name) {
            Ok(adapter) => adapter,
            Err(e) => {
                error!(error = %e, "message from unregistered channel");
                return;
            }
        };

        // 1. Resolve the sender.
        let external_id = message
            .metadata
            .get("external_id")
            .cloned()
            .unwrap_or_else(|| message.user_id.clone());
        let username = message
            .metadata
            .get("username")
            .cloned()
            .unwrap_or_else(|| external_id.clone());
        let user = self
            .identity
            .get_or_create(&message.channel_name, &external_id, &username);

        // Remember where this user's dialogs belong.
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(
                user.id.clone(),
                (message.channel_name.clone(), message.channel_id.clone()),
            );
        }

        debug!(
            user_id = %user.id,
            channel = %message.channel_name,
            "handling inbound message"
        );

        // 2. Recall memories for context.
        let memories = match self
            .memory
            .recall(
                &message.content,
                RecallQuery {
                    user_id: user.id.clone(),
                    limit: MEMORY_RECALL_LIMIT,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(memories) => memories.into_iter().map(|m| m.content).collect(),
            Err(e) => {
                warn!(error = %e, "memory recall failed, continuing without");
                Vec::new()
            }
        };

        let conversation_key = (message.channel_name.clone(), message.channel_id.clone());
        self.push_history(&conversation_key, ChatTurn::user(message.content.clone()));

        let streaming = adapter.capabilities().streaming;
        let mut final_reply = String::new();

        // 3..5. Think → tool → think, bounded.
        for round in 0..MAX_TOOL_ROUNDS {
            let request = ThinkRequest {
                messages: self.history_snapshot(&conversation_key),
                persona: Some(self.persona.clone()),
                memories: memories.clone(),
                temperature: None,
                max_tokens: None,
                stream: true,
            };

            let reply = match self
                .collect_reply(adapter.as_ref(), &message.channel_id, request, streaming)
                .await
            {
                Some(reply) => reply,
                None => return, // error already shown to the user
            };

            let calls = self.parser.parse(&reply);
            let visible = self.parser.strip(&reply);
            self.push_history(&conversation_key, ChatTurn::assistant(reply.clone()));

            if calls.is_empty() {
                final_reply = visible;
                if !streaming && !final_reply.is_empty() {
                    let outbound = OutboundMessage::text(final_reply.clone());
                    if let Err(e) = adapter.send_message(&message.channel_id, outbound).await {
                        error!(error = %e, "failed to send reply");
                    }
                }
                break;
            }

            // Interstitial prose around the tool call still reaches the user.
            if !streaming && !visible.is_empty() {
                let _ = adapter
                    .send_message(&message.channel_id, OutboundMessage::text(visible))
                    .await;
            }

            let call = &calls[0];
            info!(tool = %call.name, round, "executing tool call");
            let outcome = self.run_tool(&user.id, user.permission_tier, call).await;
            let rendered = render_outcome(&outcome);

            if let Err(e) = adapter
                .send_tool_output(&message.channel_id, &rendered)
                .await
            {
                error!(error = %e, "failed to send tool output");
            }

            // Feed the result back for the next round.
            self.push_history(
                &conversation_key,
                ChatTurn {
                    role: ChatRole::User,
                    content: format!(
                        "[Tool {} result] success={} {}",
                        call.name,
                        rendered.success,
                        if rendered.output.is_empty() {
                            rendered.error.clone().unwrap_or_default()
                        } else {
                            rendered.output.clone()
                        }
                    ),
                },
            );
        }

        // 6. Remember the exchange.
        let salient = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            kind: "conversation".to_owned(),
            content: format!("User: {}\nAssistant: {}", message.content, final_reply),
            importance: 0.3,
            created_at: chrono::Utc::now(),
            accessed_at: chrono::Utc::now(),
            source: Some(message.channel_name.clone()),
        };
        if let Err(e) = self.memory.store(salient).await {
            warn!(error = %e, "failed to store conversation memory");
        }
    }

    /// Drive one think-stream to completion, forwarding chunks when the
    /// channel can render them. Returns `None` after reporting an error.
    async fn collect_reply(
        &self,
        adapter: &dyn ChannelAdapter,
        channel_id: &str,
        request: ThinkRequest,
        streaming: bool,
    ) -> Option<String> {
        let mut rx = self.lanes.think_stream(request);
        let mut reply = String::new();

        while let Some(chunk) = rx.recv().await {
            if let Some(error) = chunk.error {
                error!(error = %error, "lane stream failed");
                let output = ToolOutput::err(error);
                let _ = adapter.send_tool_output(channel_id, &output).await;
                return None;
            }
            if !chunk.content.is_empty() {
                if streaming {
                    let _ = adapter
                        .send_message(channel_id, OutboundMessage::text(chunk.content.clone()))
                        .await;
                }
                reply.push_str(&chunk.content);
            }
            if chunk.done {
                break;
            }
        }

        if streaming {
            // Close the streamed line.
            let _ = adapter
                .send_message(channel_id, OutboundMessage::text("\n"))
                .await;
        }
        Some(reply)
    }

    /// Run one parsed tool call through the executor.
    async fn run_tool(
        &self,
        user_id: &str,
        tier: crate::types::PermissionTier,
        call: &ParsedToolCall,
    ) -> Result<ExecutionResult, ExecutorError> {
        let request = ExecuteRequest {
            tool: call.name.clone(),
            input: build_tool_input(user_id, &call.arguments),
            tier,
            timeout: None,
            skip_approval: false,
            reason: format!("requested by the assistant for {user_id}"),
        };
        self.executor.execute(request).await
    }

    fn push_history(&self, key: &(String, String), turn: ChatTurn) {
        if let Ok(mut histories) = self.histories.lock() {
            let history = histories.entry(key.clone()).or_default();
            history.push(turn);
            let len = history.len();
            if len > MAX_HISTORY_TURNS {
                history.drain(..len.saturating_sub(MAX_HISTORY_TURNS));
            }
        }
    }

    fn history_snapshot(&self, key: &(String, String)) -> Vec<ChatTurn> {
        self.histories
            .lock()
            .ok()
            .and_then(|h| h.get(key).cloned())
            .unwrap_or_default()
    }
}

/// Translate a button press into the broker's response shape.
pub fn approval_response_for(action: ApprovalAction) -> ApprovalResponse {
    match action {
        ApprovalAction::Approve => ApprovalResponse::approve(),
        ApprovalAction::Deny => ApprovalResponse::deny(),
        ApprovalAction::AlwaysAllow => ApprovalResponse {
            approved: true,
            always_allow: true,
            ..Default::default()
        },
    }
}

/// Build a [`ToolInput`] from a parsed arguments object.
///
/// `command` (or `url` for the network tools) becomes the primary command;
/// `working_dir` is lifted out; everything is retained in `args`.
pub fn build_tool_input(user_id: &str, arguments: &serde_json::Value) -> ToolInput {
    let mut input = ToolInput {
        user_id: user_id.to_owned(),
        ..Default::default()
    };

    if let Some(object) = arguments.as_object() {
        input.command = object
            .get("command")
            .or_else(|| object.get("url"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        input.working_dir = object
            .get("working_dir")
            .and_then(|v| v.as_str())
            .map(Into::into);
        input.args = object.clone().into_iter().collect();
    }
    input
}

/// Render an execution outcome as the `ToolOutput` shown to the user.
///
/// Errors never leak stacks or internals: each kind maps to its
/// user-facing text (`❌ Denied`, `⏰ Approval request expired`, timeout
/// and block reasons).
pub fn render_outcome(outcome: &Result<ExecutionResult, ExecutorError>) -> ToolOutput {
    match outcome {
        Ok(result) => result.output.clone(),
        Err(ExecutorError::ApprovalDenied) => ToolOutput::err("❌ Denied"),
        Err(ExecutorError::ApprovalTimeout) => ToolOutput::err("⏰ Approval request expired"),
        Err(ExecutorError::PermissionBlocked { reason }) => {
            ToolOutput::err(format!("dangerous command blocked: {reason}"))
        }
        Err(ExecutorError::ExecutionTimeout) => ToolOutput::err("command timed out"),
        Err(other) => ToolOutput::err(other.to_string()),
    }
}
