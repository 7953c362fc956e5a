// ABOUTME: Keeps exactly one transport connection alive: pairing, event dispatch, restarts
// ABOUTME: Persists every credential rotation inline and applies the disconnect transition table

use crate::console;
use crate::relay::{MessageRelay, RelayFatal, RelaySettings};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use warelay_core::config::Config;
use warelay_core::phone::{format_pairing_code, IdentifierPolicy};
use warelay_core::{
    BackoffConfig, BackoffState, CompletionClient, ConnectOptions, ConnectionState,
    CredentialStore, DisconnectReason, EventStream, InboundMessage, LoginMode, MessageStore,
    Session, SessionUpdate, SupervisorAction, Transport, TransportEvent,
};

/// Collaborators shared by the supervisor and the relay
#[derive(Clone)]
pub struct RelayContext {
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<dyn CredentialStore>,
    pub completion: Arc<dyn CompletionClient>,
    pub message_store: Arc<MessageStore>,
}

/// Connection and pairing policy
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Raw operator-supplied phone number for the pairing-code flow
    pub phone_number: Option<String>,
    pub identifier_policy: IdentifierPolicy,
    /// Wait between connecting and requesting a pairing code
    pub pairing_code_delay: Duration,
    pub connect_options: ConnectOptions,
    pub backoff: BackoffConfig,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config, login: LoginMode, phone_number: Option<String>) -> Self {
        Self {
            phone_number,
            identifier_policy: IdentifierPolicy::new(
                config.pairing.local_prefix.clone(),
                config.pairing.allowed_prefixes.clone(),
            ),
            pairing_code_delay: Duration::from_millis(config.pairing.code_delay_ms),
            connect_options: ConnectOptions {
                login,
                browser: config.transport.browser.clone(),
                mark_online_on_connect: config.transport.mark_online_on_connect,
                sync_full_history: config.transport.sync_full_history,
            },
            backoff: config.reconnect.clone(),
        }
    }

    pub fn login(&self) -> LoginMode {
        self.connect_options.login
    }
}

/// Result of one `start()` call
pub enum StartOutcome {
    /// Connection reached `open`; the stream carries the rest of its events
    Open(EventStream),
    /// Connection closed before it ever opened
    Closed(DisconnectReason),
    /// The relay reported an unrecoverable error while starting
    Fatal(RelayFatal),
}

/// Why supervision ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Account unlinked; credential files were deleted
    LoggedOut { removed_files: usize },
    /// Non-restarting disconnect reason
    Halted(DisconnectReason),
    /// Too many consecutive restarts without reaching `open`
    RestartLimit { restarts: u32 },
    /// The relay cannot continue (e.g. missing completion API key)
    Fatal(String),
    /// Operator interrupt
    Shutdown,
}

impl SupervisorExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorExit::Shutdown => 0,
            SupervisorExit::LoggedOut { .. }
            | SupervisorExit::RestartLimit { .. }
            | SupervisorExit::Fatal(_) => 1,
            SupervisorExit::Halted(_) => 2,
        }
    }
}

impl std::fmt::Display for SupervisorExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorExit::LoggedOut { removed_files } => {
                write!(f, "logged out ({} credential files removed)", removed_files)
            }
            SupervisorExit::Halted(reason) => write!(f, "halted: {}", reason),
            SupervisorExit::RestartLimit { restarts } => {
                write!(f, "gave up after {} consecutive restarts", restarts)
            }
            SupervisorExit::Fatal(error) => write!(f, "fatal: {}", error),
            SupervisorExit::Shutdown => write!(f, "shutdown"),
        }
    }
}

// ─── Event Pump ──────────────────────────────────────────────────────────

/// Pairing code request scheduled after connect
struct PendingPairing {
    phone_number: String,
    due: Instant,
}

enum Step {
    RequestPairingCode,
    Fatal(RelayFatal),
    Event(Option<TransportEvent>),
}

enum Pumped {
    Opened,
    Closed(DisconnectReason),
    Fatal(RelayFatal),
}

enum EventEffect {
    Continue,
    Opened,
    Closed(DisconnectReason),
}

// ─── Supervisor ──────────────────────────────────────────────────────────

pub struct ConnectionSupervisor {
    ctx: RelayContext,
    settings: SupervisorSettings,
    relay: MessageRelay,
    fatal_rx: mpsc::UnboundedReceiver<RelayFatal>,
    session: Session,
    state: ConnectionState,
    starts: u32,
    backoff: BackoffState,
    last_pairing_code: Option<String>,
}

impl ConnectionSupervisor {
    pub fn new(ctx: RelayContext, settings: SupervisorSettings, relay_settings: RelaySettings) -> Self {
        let (relay, fatal_rx) = MessageRelay::new(
            Arc::clone(&ctx.transport),
            Arc::clone(&ctx.completion),
            Arc::clone(&ctx.message_store),
            relay_settings,
        );
        let backoff = BackoffState::new(settings.backoff.clone());
        Self {
            ctx,
            settings,
            relay,
            fatal_rx,
            session: Session::default(),
            state: ConnectionState::Closed,
            starts: 0,
            backoff,
            last_pairing_code: None,
        }
    }

    pub fn relay(&self) -> &MessageRelay {
        &self.relay
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// How many times the start sequence has run
    pub fn starts(&self) -> u32 {
        self.starts
    }

    /// Most recent pairing code shown to the operator, already formatted
    pub fn last_pairing_code(&self) -> Option<&str> {
        self.last_pairing_code.as_deref()
    }

    /// Load the session, pair if needed, connect, and wait for `open`.
    ///
    /// Fails with a `PairingError` (inside the anyhow error) when pairing is
    /// required and no valid phone number was supplied.
    pub async fn start(&mut self) -> Result<StartOutcome> {
        self.starts += 1;
        self.state = ConnectionState::Connecting;

        self.session = self
            .ctx
            .credentials
            .load()
            .await
            .context("Failed to load session")?;

        let registered = self.session.is_registered();
        tracing::info!(
            attempt = self.starts,
            registered,
            transport = self.ctx.transport.transport_id(),
            "Starting connection"
        );

        let pairing_number = if !registered && self.settings.login() == LoginMode::PairingCode {
            Some(
                self.settings
                    .identifier_policy
                    .prepare(self.settings.phone_number.as_deref())?,
            )
        } else {
            None
        };

        let mut events = self
            .ctx
            .transport
            .connect(&self.session, &self.settings.connect_options)
            .await
            .context("Failed to connect transport")?;

        // The delay counts from the moment the connection exists
        let pairing = pairing_number.map(|phone_number| PendingPairing {
            phone_number,
            due: Instant::now() + self.settings.pairing_code_delay,
        });

        match self.pump(&mut events, pairing, true).await? {
            Pumped::Opened => Ok(StartOutcome::Open(events)),
            Pumped::Closed(reason) => Ok(StartOutcome::Closed(reason)),
            Pumped::Fatal(fatal) => Ok(StartOutcome::Fatal(fatal)),
        }
    }

    /// Run start/restart cycles until a terminal condition.
    ///
    /// Only a `PairingError` escapes as `Err`; other start failures are
    /// treated like a closed connection and go through backoff.
    pub async fn supervise(&mut self) -> Result<SupervisorExit> {
        loop {
            let reason = match self.start().await {
                Ok(StartOutcome::Open(mut events)) => loop {
                    match self.pump(&mut events, None, false).await {
                        Ok(Pumped::Opened) => continue,
                        Ok(Pumped::Closed(reason)) => break reason,
                        Ok(Pumped::Fatal(fatal)) => return Ok(self.fatal_exit(fatal).await),
                        Err(e) => {
                            tracing::warn!(error = %e, "Connection failed");
                            break DisconnectReason::ConnectionClosed;
                        }
                    }
                },
                Ok(StartOutcome::Closed(reason)) => reason,
                Ok(StartOutcome::Fatal(fatal)) => return Ok(self.fatal_exit(fatal).await),
                Err(e) if e.downcast_ref::<warelay_core::PairingError>().is_some() => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to start connection");
                    DisconnectReason::ConnectionClosed
                }
            };
            self.state = ConnectionState::Closed;

            match reason.action() {
                SupervisorAction::Restart => match self.backoff.record_failure() {
                    Some(delay) => {
                        tracing::info!(
                            %reason,
                            restart = self.backoff.consecutive_restarts(),
                            delay_ms = delay.as_millis() as u64,
                            "Restarting connection"
                        );
                        self.disconnect_transport().await;
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        let restarts = self.backoff.consecutive_restarts() - 1;
                        tracing::error!(%reason, restarts, "Restart limit reached, giving up");
                        self.disconnect_transport().await;
                        return Ok(SupervisorExit::RestartLimit { restarts });
                    }
                },
                SupervisorAction::LogOut => {
                    tracing::error!("Device logged out, deleting session");
                    self.disconnect_transport().await;
                    let removed_files = match self.ctx.credentials.clear().await {
                        Ok(count) => count,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to delete session files");
                            0
                        }
                    };
                    self.session = Session::default();
                    return Ok(SupervisorExit::LoggedOut { removed_files });
                }
                SupervisorAction::Halt => {
                    tracing::error!(%reason, "Connection closed, not reconnecting");
                    self.disconnect_transport().await;
                    return Ok(SupervisorExit::Halted(reason));
                }
            }
        }
    }

    /// Tear down the connection after an operator interrupt
    pub async fn shutdown(&mut self) {
        tracing::info!("Shutting down connection");
        self.state = ConnectionState::Closed;
        self.disconnect_transport().await;
    }

    async fn fatal_exit(&mut self, fatal: RelayFatal) -> SupervisorExit {
        tracing::error!(chat = %fatal.chat_id, error = %fatal.error, "Relay cannot continue");
        self.state = ConnectionState::Closed;
        self.disconnect_transport().await;
        SupervisorExit::Fatal(fatal.error)
    }

    async fn disconnect_transport(&self) {
        if let Err(e) = self.ctx.transport.disconnect().await {
            tracing::warn!(error = %e, "Failed to disconnect transport");
        }
    }

    /// Dispatch events one at a time until the connection closes (or opens,
    /// when `stop_on_open`). A stream that ends without a close event counts
    /// as a closed connection.
    ///
    /// A pairing code that is already due is requested before the next event
    /// is taken, so a busy stream cannot starve it.
    async fn pump(
        &mut self,
        events: &mut EventStream,
        mut pairing: Option<PendingPairing>,
        stop_on_open: bool,
    ) -> Result<Pumped> {
        let outcome = loop {
            if pairing.as_ref().is_some_and(|p| p.due <= Instant::now()) {
                if let Some(pending) = pairing.take() {
                    self.request_pairing_code(&pending.phone_number).await?;
                }
            }

            let pairing_due = pairing.as_ref().map(|p| p.due);
            let step = tokio::select! {
                biased;
                _ = tokio::time::sleep_until(pairing_due.unwrap_or_else(Instant::now)),
                    if pairing_due.is_some() => Step::RequestPairingCode,
                Some(fatal) = self.fatal_rx.recv() => Step::Fatal(fatal),
                event = events.next() => Step::Event(event),
            };

            match step {
                Step::RequestPairingCode => {
                    if let Some(pending) = pairing.take() {
                        self.request_pairing_code(&pending.phone_number).await?;
                    }
                }
                Step::Fatal(fatal) => break Pumped::Fatal(fatal),
                Step::Event(None) => {
                    tracing::warn!("Transport event stream ended");
                    break Pumped::Closed(DisconnectReason::ConnectionClosed);
                }
                Step::Event(Some(event)) => match self.handle_event(event).await {
                    EventEffect::Continue => {}
                    EventEffect::Opened => {
                        if stop_on_open {
                            break Pumped::Opened;
                        }
                    }
                    EventEffect::Closed(reason) => break Pumped::Closed(reason),
                },
            }
        };

        if pairing.is_some() {
            tracing::warn!("Connection ended its start phase before a pairing code was requested");
        }
        Ok(outcome)
    }

    async fn request_pairing_code(&mut self, phone_number: &str) -> Result<()> {
        tracing::info!("Requesting pairing code");
        tracing::debug!(digits = phone_number.len(), "Pairing identifier prepared");
        let code = self
            .ctx
            .transport
            .request_pairing_code(phone_number)
            .await
            .context("Failed to request pairing code")?;
        let formatted = format_pairing_code(&code);
        console::show_pairing_code(&formatted);
        self.last_pairing_code = Some(formatted);
        Ok(())
    }

    async fn handle_event(&mut self, event: TransportEvent) -> EventEffect {
        match event {
            TransportEvent::CredsUpdate(update) => {
                self.persist(&update).await;
                EventEffect::Continue
            }
            TransportEvent::ConnectionUpdate {
                state,
                status_code,
                qr,
            } => {
                if let Some(qr) = qr {
                    if self.settings.login() == LoginMode::Qr {
                        console::show_qr(&qr);
                    } else {
                        tracing::debug!("Ignoring QR payload in pairing-code mode");
                    }
                }
                match state {
                    Some(ConnectionState::Connecting) => {
                        self.state = ConnectionState::Connecting;
                        tracing::info!("Connecting");
                        EventEffect::Continue
                    }
                    Some(ConnectionState::Open) => {
                        self.on_open().await;
                        EventEffect::Opened
                    }
                    Some(ConnectionState::Closed) => {
                        self.state = ConnectionState::Closed;
                        let reason = DisconnectReason::from_status_code(status_code);
                        tracing::warn!(%reason, status_code = ?status_code, "Connection closed");
                        EventEffect::Closed(reason)
                    }
                    None => EventEffect::Continue,
                }
            }
            TransportEvent::MessagesUpsert(messages) => {
                self.on_messages(messages);
                EventEffect::Continue
            }
        }
    }

    /// Apply and save one credential rotation before the next event is handled
    async fn persist(&mut self, update: &SessionUpdate) {
        self.session.apply(update);
        if let Err(e) = self.ctx.credentials.save(&self.session).await {
            tracing::error!(error = %e, "Failed to save rotated credentials");
        }
    }

    async fn on_open(&mut self) {
        self.state = ConnectionState::Open;
        self.backoff.record_success();
        tracing::info!("Connection open");

        if !self.session.is_registered() {
            self.session.set_registered(true);
            if let Err(e) = self.ctx.credentials.save(&self.session).await {
                tracing::error!(error = %e, "Failed to save session after pairing");
            }
        }
    }

    fn on_messages(&mut self, messages: Vec<InboundMessage>) {
        for message in &messages {
            if let Some(text) = message.text.as_deref() {
                self.ctx
                    .message_store
                    .record(message.chat_id(), &message.key.id, text);
            }
        }

        if !self.session.is_registered() {
            tracing::warn!(
                count = messages.len(),
                "Dropping messages received before pairing completed"
            );
            return;
        }
        self.relay.on_messages(messages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SupervisorExit::Shutdown.exit_code(), 0);
        assert_eq!(SupervisorExit::LoggedOut { removed_files: 2 }.exit_code(), 1);
        assert_eq!(SupervisorExit::RestartLimit { restarts: 10 }.exit_code(), 1);
        assert_eq!(SupervisorExit::Fatal("no key".into()).exit_code(), 1);
        assert_eq!(
            SupervisorExit::Halted(DisconnectReason::MultideviceMismatch).exit_code(),
            2
        );
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::default();
        let settings =
            SupervisorSettings::from_config(&config, LoginMode::Qr, Some("0812".to_string()));
        assert_eq!(settings.login(), LoginMode::Qr);
        assert_eq!(settings.pairing_code_delay, Duration::from_millis(5000));
        assert_eq!(settings.backoff, BackoffConfig::default());
        assert_eq!(settings.phone_number.as_deref(), Some("0812"));
    }

    #[test]
    fn test_exit_display() {
        let exit = SupervisorExit::LoggedOut { removed_files: 3 };
        assert_eq!(exit.to_string(), "logged out (3 credential files removed)");
    }
}
