// ABOUTME: Transport implementation backed by an external sidecar process
// ABOUTME: Speaks newline-delimited JSON on stdin/stdout and turns stdout lines into transport events

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use warelay_core::config::TransportConfig;
use warelay_core::wire::{SidecarCommand, SidecarOutput};
use warelay_core::{
    ConnectOptions, ConnectionState, EventStream, MessageStore, OutboundReply, Session, Transport,
    TransportEvent,
};

/// How long to wait for the sidecar to answer a command
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Writer = Arc<tokio::sync::Mutex<ChildStdin>>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, String>>>;

/// The running sidecar process for the current connection
struct Link {
    child: Child,
    writer: Writer,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

/// State shared with the stdout reader task
struct Shared {
    pending: Mutex<PendingMap>,
    message_store: Arc<MessageStore>,
}

impl Shared {
    fn take_pending(&self, id: u64) -> Option<oneshot::Sender<Result<Value, String>>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    fn fail_all_pending(&self, reason: &str) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(reason.to_string()));
        }
    }
}

pub struct SidecarTransport {
    command: String,
    args: Vec<String>,
    request_timeout: Duration,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    link: tokio::sync::Mutex<Option<Link>>,
}

impl SidecarTransport {
    pub fn new(config: &TransportConfig, message_store: Arc<MessageStore>) -> Self {
        Self::with_command(config.command.clone(), config.args.clone(), message_store)
    }

    pub fn with_command(
        command: impl Into<String>,
        args: Vec<String>,
        message_store: Arc<MessageStore>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            next_id: AtomicU64::new(1),
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                message_store,
            }),
            link: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn current_writer(&self) -> Result<Writer> {
        let link = self.link.lock().await;
        link.as_ref()
            .map(|l| Arc::clone(&l.writer))
            .ok_or_else(|| anyhow!("Sidecar is not running"))
    }

    /// Write a command that carries `id` and wait for its response
    async fn request(&self, id: u64, command: &SidecarCommand<'_>) -> Result<Value> {
        let writer = self.current_writer().await?;
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        if let Err(e) = write_command(&writer, command).await {
            self.shared.take_pending(id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(anyhow!("Sidecar request {} failed: {}", id, error)),
            Ok(Err(_)) => Err(anyhow!("Sidecar dropped request {}", id)),
            Err(_) => {
                self.shared.take_pending(id);
                anyhow::bail!(
                    "Sidecar request {} timed out after {:?}",
                    id,
                    self.request_timeout
                )
            }
        }
    }

    async fn stop_link(&self, link: Link) {
        let Link {
            mut child,
            writer,
            reader,
            stderr,
        } = link;

        // Best effort; the process may already be gone
        let _ = write_command(&writer, &SidecarCommand::Shutdown).await;
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "Sidecar already exited");
        }
        reader.abort();
        stderr.abort();
        self.shared.fail_all_pending("sidecar stopped");
    }
}

async fn write_command(writer: &Writer, command: &SidecarCommand<'_>) -> Result<()> {
    let mut line = serde_json::to_string(command).context("Failed to encode sidecar command")?;
    line.push('\n');

    let mut stdin = writer.lock().await;
    stdin
        .write_all(line.as_bytes())
        .await
        .context("Failed to write to sidecar stdin")?;
    stdin.flush().await.context("Failed to flush sidecar stdin")?;
    Ok(())
}

/// Route one stdout line: responses to their waiters, lookups answered inline,
/// everything else forwarded as a transport event. The event sender is
/// dropped after the closing connection update so the stream ends there.
async fn dispatch_line(
    line: &str,
    shared: &Shared,
    writer: &Writer,
    events: &mut Option<mpsc::UnboundedSender<TransportEvent>>,
) {
    let output: SidecarOutput = match serde_json::from_str(line) {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(error = %e, line = %line, "Unparseable sidecar output");
            return;
        }
    };

    match output {
        SidecarOutput::Response {
            id,
            ok,
            result,
            error,
        } => {
            let Some(tx) = shared.take_pending(id) else {
                tracing::debug!(id, "Response for unknown request");
                return;
            };
            let outcome = if ok {
                Ok(result)
            } else {
                Err(error.unwrap_or_else(|| "unknown error".to_string()))
            };
            let _ = tx.send(outcome);
        }
        SidecarOutput::GetMessage { request_id, key } => {
            let text = shared.message_store.lookup(&key);
            tracing::debug!(
                chat = %key.remote_jid,
                id = %key.id,
                found = text.is_some(),
                "Message lookup"
            );
            let answer = SidecarCommand::MessageLookup { request_id, text };
            if let Err(e) = write_command(writer, &answer).await {
                tracing::warn!(error = %e, "Failed to answer message lookup");
            }
        }
        SidecarOutput::Log { level, message } => match level.as_str() {
            "error" => tracing::error!(sidecar = %message),
            "warn" => tracing::warn!(sidecar = %message),
            "debug" | "trace" => tracing::debug!(sidecar = %message),
            _ => tracing::info!(sidecar = %message),
        },
        other => {
            let Some(event) = other.into_event() else {
                return;
            };
            let closes = matches!(
                event,
                TransportEvent::ConnectionUpdate {
                    state: Some(ConnectionState::Closed),
                    ..
                }
            );
            match events.as_ref() {
                Some(tx) => {
                    if tx.send(event).is_err() {
                        tracing::debug!("Event receiver closed, dropping event");
                    }
                }
                None => tracing::debug!("Connection already closed, dropping event"),
            }
            if closes {
                *events = None;
            }
        }
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    async fn connect(&self, session: &Session, options: &ConnectOptions) -> Result<EventStream> {
        if let Some(previous) = self.link.lock().await.take() {
            tracing::debug!("Stopping previous sidecar before reconnecting");
            self.stop_link(previous).await;
        }

        tracing::debug!(command = %self.command, args = ?self.args, "Spawning transport sidecar");

        let mut child = ProcessCommand::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn transport sidecar '{}'", self.command))?;

        let stdin = child.stdin.take().context("Failed to capture sidecar stdin")?;
        let stdout = child.stdout.take().context("Failed to capture sidecar stdout")?;
        let stderr = child.stderr.take().context("Failed to capture sidecar stderr")?;
        let writer: Writer = Arc::new(tokio::sync::Mutex::new(stdin));

        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    tracing::warn!(stderr = %line, "Sidecar stderr");
                }
            }
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let reader_writer = Arc::clone(&writer);
        let reader_handle = tokio::spawn(async move {
            let mut event_tx = Some(event_tx);
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            dispatch_line(line, &shared, &reader_writer, &mut event_tx).await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read sidecar stdout");
                        break;
                    }
                }
            }
            tracing::info!("Transport sidecar closed its output");
            shared.fail_all_pending("sidecar exited");
        });

        *self.link.lock().await = Some(Link {
            child,
            writer,
            reader: reader_handle,
            stderr: stderr_handle,
        });

        let id = self.next_id();
        self.request(
            id,
            &SidecarCommand::Connect {
                id,
                session,
                options,
            },
        )
        .await
        .context("Sidecar rejected connect")?;

        Ok(Box::pin(UnboundedReceiverStream::new(event_rx)))
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String> {
        let id = self.next_id();
        let result = self
            .request(id, &SidecarCommand::RequestPairingCode { id, phone_number })
            .await?;

        let code = match &result {
            Value::String(code) => Some(code.clone()),
            Value::Object(map) => map.get("code").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        code.ok_or_else(|| anyhow!("Sidecar returned no pairing code"))
    }

    async fn send_reply(&self, reply: &OutboundReply) -> Result<Option<String>> {
        let id = self.next_id();
        let result = self
            .request(
                id,
                &SidecarCommand::SendMessage {
                    id,
                    jid: &reply.chat_id,
                    text: &reply.text,
                    quoted: &reply.quoted,
                },
            )
            .await
            .with_context(|| format!("Failed to send message to {}", reply.chat_id))?;

        Ok(result
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn transport_id(&self) -> &'static str {
        "sidecar"
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(link) = self.link.lock().await.take() {
            self.stop_link(link).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use warelay_core::{InboundMessage, MessageKey};

    fn shell(script: &str, store: Arc<MessageStore>) -> SidecarTransport {
        SidecarTransport::with_command("sh", vec!["-c".to_string(), script.to_string()], store)
            .with_request_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_connect_streams_events_in_order() {
        let script = r#"
read line
echo '{"type":"response","id":1,"ok":true}'
echo '{"type":"connection_update","connection":"connecting"}'
echo '{"type":"creds_update","creds":{"registered":true}}'
echo '{"type":"connection_update","connection":"open"}'
echo '{"type":"messages_upsert","messages":[{"key":{"remoteJid":"111@s.whatsapp.net","fromMe":false,"id":"M1"},"message":{"conversation":"hello"}}]}'
echo '{"type":"connection_update","connection":"close","status_code":515}'
"#;
        let transport = shell(script, Arc::new(MessageStore::new(10)));
        let stream = transport
            .connect(&Session::default(), &ConnectOptions::default())
            .await
            .unwrap();
        let events: Vec<TransportEvent> = stream.collect().await;

        assert_eq!(events.len(), 5);
        assert!(matches!(
            events[0],
            TransportEvent::ConnectionUpdate {
                state: Some(ConnectionState::Connecting),
                ..
            }
        ));
        match &events[1] {
            TransportEvent::CredsUpdate(update) => {
                assert_eq!(update.creds.get("registered"), Some(&Value::Bool(true)));
            }
            other => panic!("expected creds update, got {:?}", other),
        }
        match &events[3] {
            TransportEvent::MessagesUpsert(messages) => {
                assert_eq!(messages[0].body(), Some("hello"));
                assert_eq!(messages[0].chat_id(), "111@s.whatsapp.net");
            }
            other => panic!("expected upsert, got {:?}", other),
        }
        assert!(matches!(
            events[4],
            TransportEvent::ConnectionUpdate {
                state: Some(ConnectionState::Closed),
                status_code: Some(515),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stream_ends_after_close_while_sidecar_lives() {
        let script = r#"
read line
echo '{"type":"response","id":1,"ok":true}'
echo '{"type":"connection_update","connection":"close","status_code":428}'
echo '{"type":"connection_update","connection":"connecting"}'
read line
"#;
        let transport = shell(script, Arc::new(MessageStore::new(10)));
        let stream = transport
            .connect(&Session::default(), &ConnectOptions::default())
            .await
            .unwrap();
        let events: Vec<TransportEvent> =
            tokio::time::timeout(Duration::from_secs(5), stream.collect())
                .await
                .expect("stream ends after close");

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            TransportEvent::ConnectionUpdate {
                state: Some(ConnectionState::Closed),
                status_code: Some(428),
                ..
            }
        ));
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_fails_when_sidecar_rejects() {
        let script = r#"
read line
echo '{"type":"response","id":1,"ok":false,"error":"bad creds"}'
"#;
        let transport = shell(script, Arc::new(MessageStore::new(10)));
        let err = transport
            .connect(&Session::default(), &ConnectOptions::default())
            .await
            .err()
            .expect("connect should fail");
        assert!(format!("{:#}", err).contains("bad creds"));
    }

    #[tokio::test]
    async fn test_connect_fails_when_command_missing() {
        let transport = SidecarTransport::with_command(
            "/nonexistent/warelay-sidecar",
            vec![],
            Arc::new(MessageStore::new(10)),
        );
        let result = transport
            .connect(&Session::default(), &ConnectOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pairing_code_and_send_reply() {
        let script = r#"
read line
echo '{"type":"response","id":1,"ok":true}'
read line
echo '{"type":"response","id":2,"ok":true,"result":{"code":"ABCD1234"}}'
read line
echo '{"type":"response","id":3,"ok":true,"result":{"id":"SENT1"}}'
read line
"#;
        let transport = shell(script, Arc::new(MessageStore::new(10)));
        let _events = transport
            .connect(&Session::default(), &ConnectOptions::default())
            .await
            .unwrap();

        let code = transport.request_pairing_code("6281234567890").await.unwrap();
        assert_eq!(code, "ABCD1234");

        let message = InboundMessage::text("111@s.whatsapp.net", "M1", "hello");
        let reply = OutboundReply::quoting(&message, "hi there");
        let sent_id = transport.send_reply(&reply).await.unwrap();
        assert_eq!(sent_id.as_deref(), Some("SENT1"));

        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_message_answered_from_store() {
        // The script echoes the lookup answer back inside a creds update
        let script = r#"
read line
echo '{"type":"response","id":1,"ok":true}'
echo '{"type":"get_message","request_id":7,"key":{"remoteJid":"111@s.whatsapp.net","id":"M1","fromMe":false}}'
read answer
printf '{"type":"creds_update","creds":{"answer":%s}}\n' "$answer"
"#;
        let store = Arc::new(MessageStore::new(10));
        store.record("111@s.whatsapp.net", "M1", "hello");
        let transport = shell(script, Arc::clone(&store));
        let mut events = transport
            .connect(&Session::default(), &ConnectOptions::default())
            .await
            .unwrap();

        match events.next().await {
            Some(TransportEvent::CredsUpdate(update)) => {
                let answer = update.creds.get("answer").cloned().unwrap_or_default();
                assert_eq!(answer["type"], "message_lookup");
                assert_eq!(answer["request_id"], 7);
                assert_eq!(answer["text"], "hello");
            }
            other => panic!("expected echoed lookup answer, got {:?}", other),
        }
        let missing = MessageKey {
            remote_jid: "111@s.whatsapp.net".to_string(),
            id: "UNKNOWN".to_string(),
            from_me: false,
            participant: None,
        };
        assert!(store.lookup(&missing).is_none());
    }

    #[tokio::test]
    async fn test_requests_fail_when_not_connected() {
        let transport = shell("true", Arc::new(MessageStore::new(10)));
        assert!(transport.request_pairing_code("62812").await.is_err());
    }
}
