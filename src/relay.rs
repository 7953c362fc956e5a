// ABOUTME: Turns inbound chat messages into completion-service replies
// ABOUTME: Filters self/non-text/group messages, serializes work per conversation, never crashes on API errors

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use warelay_core::config::Config;
use warelay_core::{
    CompletionClient, CompletionRequest, InboundMessage, MessageStore, OutboundReply, Transport,
};

/// Idle time after which a conversation's worker task exits
const DEFAULT_WORKER_IDLE: Duration = Duration::from_secs(300);

/// Relay policy
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub system_prompt: String,
    pub direct_only: bool,
    pub fallback_reply: Option<String>,
    pub process_whole_batch: bool,
    pub worker_idle: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.completion.system_prompt.clone(),
            direct_only: config.relay.direct_only,
            fallback_reply: config.relay.fallback_reply.clone(),
            process_whole_batch: config.relay.process_whole_batch,
            worker_idle: DEFAULT_WORKER_IDLE,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    FromSelf,
    NoText,
    GroupChat,
}

/// What happened to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Ignored(IgnoreReason),
    Replied,
    /// Completion or delivery failed; the conversation keeps working
    Failed { fallback_sent: bool },
    /// Unrecoverable misconfiguration, reported to the supervisor
    Fatal,
}

/// Sent to the supervisor when the relay cannot continue at all
#[derive(Debug, Clone)]
pub struct RelayFatal {
    pub chat_id: String,
    pub error: String,
}

type WorkerMap = HashMap<String, mpsc::UnboundedSender<InboundMessage>>;

struct RelayShared {
    transport: Arc<dyn Transport>,
    completion: Arc<dyn CompletionClient>,
    message_store: Arc<MessageStore>,
    settings: RelaySettings,
    fatal_tx: mpsc::UnboundedSender<RelayFatal>,
    workers: Mutex<WorkerMap>,
}

/// Message relay. Each conversation gets its own FIFO worker, so replies in one
/// chat arrive in the order the messages did while chats run independently.
#[derive(Clone)]
pub struct MessageRelay {
    shared: Arc<RelayShared>,
}

impl MessageRelay {
    pub fn new(
        transport: Arc<dyn Transport>,
        completion: Arc<dyn CompletionClient>,
        message_store: Arc<MessageStore>,
        settings: RelaySettings,
    ) -> (Self, mpsc::UnboundedReceiver<RelayFatal>) {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let relay = Self {
            shared: Arc::new(RelayShared {
                transport,
                completion,
                message_store,
                settings,
                fatal_tx,
                workers: Mutex::new(HashMap::new()),
            }),
        };
        (relay, fatal_rx)
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.shared.settings
    }

    /// Handle one upsert batch. Returns how many messages were queued for a reply.
    pub fn on_messages(&self, messages: Vec<InboundMessage>) -> usize {
        if messages.is_empty() {
            return 0;
        }

        let batch_size = messages.len();
        let selected: Vec<InboundMessage> = if self.shared.settings.process_whole_batch {
            messages
        } else {
            messages.into_iter().take(1).collect()
        };
        if selected.len() < batch_size {
            tracing::debug!(
                batch_size,
                "Only the first message of the batch is relayed"
            );
        }

        let mut queued = 0;
        for message in selected {
            if let Some(reason) = self.shared.screen(&message) {
                tracing::debug!(chat = %message.chat_id(), ?reason, "Message ignored");
                continue;
            }
            self.enqueue(message);
            queued += 1;
        }
        queued
    }

    /// Run the full pipeline for one message on the caller's task
    pub async fn process(&self, message: &InboundMessage) -> RelayOutcome {
        self.shared.process(message).await
    }

    /// Number of conversations with a live worker
    pub fn active_conversations(&self) -> usize {
        self.shared
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn enqueue(&self, message: InboundMessage) {
        let chat_id = message.chat_id().to_string();
        let mut workers = self
            .shared
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let message = match workers.get(&chat_id) {
            Some(tx) => match tx.send(message) {
                Ok(()) => return,
                // Worker exited between lookups; start a fresh one with the same message
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive right here, so this cannot fail
        let _ = tx.send(message);
        workers.insert(chat_id.clone(), tx);
        drop(workers);

        tracing::debug!(chat = %chat_id, "Starting conversation worker");
        tokio::spawn(run_worker(Arc::clone(&self.shared), chat_id, rx));
    }
}

async fn run_worker(
    shared: Arc<RelayShared>,
    chat_id: String,
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
) {
    loop {
        match tokio::time::timeout(shared.settings.worker_idle, rx.recv()).await {
            Ok(Some(message)) => {
                shared.process(&message).await;
            }
            Ok(None) => break,
            Err(_) => {
                // Retire only if nothing slipped in; enqueue holds the same lock
                let leftover = {
                    let mut workers = shared.workers.lock().unwrap_or_else(|e| e.into_inner());
                    match rx.try_recv() {
                        Ok(message) => Some(message),
                        Err(_) => {
                            workers.remove(&chat_id);
                            None
                        }
                    }
                };
                match leftover {
                    Some(message) => {
                        shared.process(&message).await;
                    }
                    None => {
                        tracing::debug!(chat = %chat_id, "Conversation worker idle, exiting");
                        break;
                    }
                }
            }
        }
    }
}

impl RelayShared {
    fn screen(&self, message: &InboundMessage) -> Option<IgnoreReason> {
        if message.is_from_self() {
            return Some(IgnoreReason::FromSelf);
        }
        if message.body().is_none() {
            return Some(IgnoreReason::NoText);
        }
        if self.settings.direct_only && message.is_group() {
            return Some(IgnoreReason::GroupChat);
        }
        None
    }

    async fn process(&self, message: &InboundMessage) -> RelayOutcome {
        if let Some(reason) = self.screen(message) {
            return RelayOutcome::Ignored(reason);
        }
        let Some(input) = message.body() else {
            return RelayOutcome::Ignored(IgnoreReason::NoText);
        };

        let request = CompletionRequest {
            system_prompt: self.settings.system_prompt.clone(),
            user_text: input.to_string(),
        };

        match self.completion.complete(&request).await {
            Ok(output) => {
                let reply = OutboundReply::quoting(message, output.as_str());
                if let Err(e) = self.deliver(&reply).await {
                    tracing::warn!(
                        chat = %message.chat_id(),
                        error = %e,
                        "Failed to send reply"
                    );
                    return RelayOutcome::Failed {
                        fallback_sent: false,
                    };
                }

                tracing::info!(
                    target: "warelay::relay",
                    sender = %message.sender(),
                    input = %input,
                    output = %output,
                    timestamp = %chrono::Local::now().to_rfc3339(),
                    "Message relayed"
                );
                RelayOutcome::Replied
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(chat = %message.chat_id(), error = %e, "Completion client unusable");
                let _ = self.fatal_tx.send(RelayFatal {
                    chat_id: message.chat_id().to_string(),
                    error: e.to_string(),
                });
                RelayOutcome::Fatal
            }
            Err(e) => {
                tracing::warn!(
                    chat = %message.chat_id(),
                    sender = %message.sender(),
                    error = %e,
                    "Completion failed, no reply generated"
                );
                let Some(fallback) = self.settings.fallback_reply.as_deref() else {
                    return RelayOutcome::Failed {
                        fallback_sent: false,
                    };
                };
                let reply = OutboundReply::quoting(message, fallback);
                let fallback_sent = match self.deliver(&reply).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(chat = %message.chat_id(), error = %e, "Failed to send fallback reply");
                        false
                    }
                };
                RelayOutcome::Failed { fallback_sent }
            }
        }
    }

    async fn deliver(&self, reply: &OutboundReply) -> anyhow::Result<()> {
        if let Some(id) = self.transport.send_reply(reply).await? {
            self.message_store.record(&reply.chat_id, &id, &reply.text);
        }
        Ok(())
    }
}
