// ABOUTME: Scripted test doubles shared by the integration tests
// ABOUTME: Mock transport, mock completion client, and a recording credential store

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use warelay::relay::RelaySettings;
use warelay::supervisor::{ConnectionSupervisor, RelayContext, SupervisorSettings};
use warelay_core::phone::IdentifierPolicy;
use warelay_core::{
    BackoffConfig, CompletionClient, CompletionError, CompletionRequest, ConnectOptions,
    ConnectionState, CredentialStore, EventStream, FileCredentialStore, InboundMessage,
    LoginMode, MessageStore, OutboundReply, Session, SessionUpdate, Transport, TransportEvent,
};

// =============================================================================
// Event Builders
// =============================================================================

pub fn connecting() -> TransportEvent {
    TransportEvent::ConnectionUpdate {
        state: Some(ConnectionState::Connecting),
        status_code: None,
        qr: None,
    }
}

pub fn open() -> TransportEvent {
    TransportEvent::ConnectionUpdate {
        state: Some(ConnectionState::Open),
        status_code: None,
        qr: None,
    }
}

pub fn closed(code: u16) -> TransportEvent {
    TransportEvent::ConnectionUpdate {
        state: Some(ConnectionState::Closed),
        status_code: Some(code),
        qr: None,
    }
}

pub fn qr(payload: &str) -> TransportEvent {
    TransportEvent::ConnectionUpdate {
        state: None,
        status_code: None,
        qr: Some(payload.to_string()),
    }
}

pub fn creds(fields: Value) -> TransportEvent {
    let creds: Map<String, Value> = fields.as_object().cloned().unwrap_or_default();
    TransportEvent::CredsUpdate(SessionUpdate {
        creds,
        keys: Default::default(),
    })
}

pub fn upsert(messages: Vec<InboundMessage>) -> TransportEvent {
    TransportEvent::MessagesUpsert(messages)
}

pub fn text_message(chat: &str, id: &str, text: &str) -> InboundMessage {
    InboundMessage::text(chat, id, text)
}

pub fn own_message(chat: &str, id: &str, text: &str) -> InboundMessage {
    let mut message = InboundMessage::text(chat, id, text);
    message.key.from_me = true;
    message
}

// =============================================================================
// Mock Transport
// =============================================================================

/// Events one `connect` call will deliver
pub struct Script {
    pub events: Vec<TransportEvent>,
    /// Keep the stream open after the scripted events instead of ending it
    pub hold_open: bool,
    /// Quiet period before the first event
    pub pause: Option<Duration>,
}

impl Script {
    pub fn ends(events: Vec<TransportEvent>) -> Self {
        Self {
            events,
            hold_open: false,
            pause: None,
        }
    }

    pub fn holds(events: Vec<TransportEvent>) -> Self {
        Self {
            events,
            hold_open: true,
            pause: None,
        }
    }

    pub fn after(mut self, pause: Duration) -> Self {
        self.pause = Some(pause);
        self
    }
}

pub struct MockTransport {
    scripts: Mutex<VecDeque<Script>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    sent: Mutex<Vec<OutboundReply>>,
    pairing_requests: Mutex<Vec<String>>,
    connect_options: Mutex<Vec<ConnectOptions>>,
    pairing_code: String,
}

impl MockTransport {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            pairing_requests: Mutex::new(Vec::new()),
            connect_options: Mutex::new(Vec::new()),
            pairing_code: "ABCD1234".to_string(),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundReply> {
        self.sent.lock().unwrap().clone()
    }

    pub fn pairing_requests(&self) -> Vec<String> {
        self.pairing_requests.lock().unwrap().clone()
    }

    pub fn connect_options(&self) -> Vec<ConnectOptions> {
        self.connect_options.lock().unwrap().clone()
    }

    /// Wait until at least `count` replies were sent
    pub async fn wait_for_sent(&self, count: usize) -> Vec<OutboundReply> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let sent = self.sent();
            if sent.len() >= count || tokio::time::Instant::now() >= deadline {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _session: &Session, options: &ConnectOptions) -> Result<EventStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_options.lock().unwrap().push(options.clone());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no more scripted connections"))?;

        let mut events: EventStream = Box::pin(stream::iter(script.events));
        if let Some(pause) = script.pause {
            let quiet = stream::once(tokio::time::sleep(pause))
                .filter_map(|_| async { None::<TransportEvent> });
            events = Box::pin(quiet.chain(events));
        }
        if script.hold_open {
            events = Box::pin(events.chain(stream::pending()));
        }
        Ok(events)
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String> {
        self.pairing_requests
            .lock()
            .unwrap()
            .push(phone_number.to_string());
        Ok(self.pairing_code.clone())
    }

    async fn send_reply(&self, reply: &OutboundReply) -> Result<Option<String>> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(reply.clone());
        Ok(Some(format!("SENT{}", sent.len())))
    }

    fn transport_id(&self) -> &'static str {
        "mock"
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Mock Completion
// =============================================================================

/// Echoes the user text unless a result is scripted for that text
pub struct MockCompletion {
    requests: Mutex<Vec<CompletionRequest>>,
    scripted: Mutex<HashMap<String, VecDeque<Result<String, CompletionError>>>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl MockCompletion {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self, user_text: &str, result: Result<String, CompletionError>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(user_text.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn delay(&self, user_text: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(user_text.to_string(), delay);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionClient for MockCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        self.requests.lock().unwrap().push(request.clone());

        let delay = self.delays.lock().unwrap().get(&request.user_text).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&request.user_text)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| Ok(format!("echo: {}", request.user_text)))
    }
}

// =============================================================================
// Recording Credential Store
// =============================================================================

/// File-backed store that also records every load and save
pub struct RecordingStore {
    pub inner: FileCredentialStore,
    loads: AtomicUsize,
    saves: Mutex<Vec<Session>>,
}

impl RecordingStore {
    pub fn new(dir: &std::path::Path) -> Self {
        Self {
            inner: FileCredentialStore::new(dir),
            loads: AtomicUsize::new(0),
            saves: Mutex::new(Vec::new()),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> Vec<Session> {
        self.saves.lock().unwrap().clone()
    }

    pub fn files(&self) -> usize {
        match std::fs::read_dir(self.inner.dir()) {
            Ok(entries) => entries.filter_map(|e| e.ok()).count(),
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl CredentialStore for RecordingStore {
    async fn load(&self) -> Result<Session> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load().await
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.saves.lock().unwrap().push(session.clone());
        self.inner.save(session).await
    }

    async fn clear(&self) -> Result<usize> {
        self.inner.clear().await
    }
}

/// Registered session with one signal key: two files on disk once saved
pub fn registered_session() -> Session {
    let mut session = Session::default();
    session.set_registered(true);
    session.creds.insert("me".to_string(), json!({"id": "6281234567890:1@s.whatsapp.net"}));
    session
        .keys
        .insert("pre-key-1".to_string(), json!({"public": "AAAA", "private": "BBBB"}));
    session
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub completion: Arc<MockCompletion>,
    pub store: Arc<RecordingStore>,
    pub message_store: Arc<MessageStore>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(scripts: Vec<Script>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let session_dir = dir.path().join("session");
        Self {
            transport: Arc::new(MockTransport::new(scripts)),
            completion: Arc::new(MockCompletion::new()),
            store: Arc::new(RecordingStore::new(&session_dir)),
            message_store: Arc::new(MessageStore::new(100)),
            dir,
        }
    }

    /// Persist a registered session before the supervisor starts
    pub async fn with_registered_session(self) -> Self {
        self.store.inner.save(&registered_session()).await.unwrap();
        self
    }

    pub fn context(&self) -> RelayContext {
        RelayContext {
            transport: self.transport.clone(),
            credentials: self.store.clone(),
            completion: self.completion.clone(),
            message_store: Arc::clone(&self.message_store),
        }
    }

    pub fn supervisor(&self, settings: SupervisorSettings) -> ConnectionSupervisor {
        self.supervisor_with_relay(settings, RelaySettings::default())
    }

    pub fn supervisor_with_relay(
        &self,
        settings: SupervisorSettings,
        relay: RelaySettings,
    ) -> ConnectionSupervisor {
        ConnectionSupervisor::new(self.context(), settings, relay)
    }
}

/// No delays, a handful of restarts
pub fn fast_backoff(max_restarts: u32) -> BackoffConfig {
    BackoffConfig {
        max_restarts,
        ..BackoffConfig::immediate()
    }
}

pub fn settings(login: LoginMode, phone_number: Option<&str>) -> SupervisorSettings {
    SupervisorSettings {
        phone_number: phone_number.map(str::to_string),
        identifier_policy: IdentifierPolicy::default(),
        pairing_code_delay: Duration::ZERO,
        connect_options: ConnectOptions {
            login,
            ..ConnectOptions::default()
        },
        backoff: fast_backoff(5),
    }
}
