use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::protocol::{FeedResult, FrameAccumulator, Message};
use crate::errors::AmiError;

const EVENTS_CHANNEL_CAPACITY: usize = 1024;
const STATUS_CHANNEL_CAPACITY: usize = 16;

/// A connect/disconnect edge on the AMI link.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Caller-supplied bound on how long to wait for an action's response.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext {
    pub timeout: Duration,
}

impl ActionContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        ActionContext { timeout }
    }
}

struct Shared {
    host: String,
    port: u16,
    username: String,
    password: String,
    events: String,
    retry_initial: Duration,
    retry_max: Duration,
    connected: AtomicBool,
    events_tx: broadcast::Sender<Message>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    pending: std::sync::Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

/// A line-oriented, auto-reconnecting Asterisk Manager Interface client.
#[derive(Clone)]
pub struct AmiClient {
    shared: Arc<Shared>,
}

impl AmiClient {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        events: impl Into<String>,
        retry_initial: Duration,
        retry_max: Duration,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        AmiClient {
            shared: Arc::new(Shared {
                host: host.into(),
                port,
                username: username.into(),
                password: password.into(),
                events: events.into(),
                retry_initial,
                retry_max,
                connected: AtomicBool::new(false),
                events_tx,
                status_tx,
                writer: AsyncMutex::new(None),
                pending: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Launches the connection loop in the background. Resolves once the
    /// first connection attempt has completed, success or failure; the
    /// loop itself keeps retrying with backoff for the life of the
    /// process, honoring `cancel`.
    pub async fn start(&self, cancel: watch::Receiver<bool>) {
        let (first_attempt_tx, first_attempt_rx) = oneshot::channel();
        let client = self.clone();
        tokio::spawn(async move {
            client.run(cancel, first_attempt_tx).await;
        });
        let _ = first_attempt_rx.await;
    }

    /// A lazy, infinite stream of parsed AMI messages. Delivery is
    /// best-effort: a slow consumer drops buffered frames rather than
    /// stall the reader.
    pub fn raw_events(&self) -> BroadcastStream<Message> {
        BroadcastStream::new(self.shared.events_tx.subscribe())
    }

    /// A lazy, infinite stream of connection status edges.
    pub fn status_changes(&self) -> BroadcastStream<ConnectionStatus> {
        BroadcastStream::new(self.shared.status_tx.subscribe())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Sends an action and awaits its correlated response.
    #[instrument(skip(self, ctx, headers), fields(action = %headers.first().map(|(_, v)| v.clone()).unwrap_or_default()))]
    pub async fn send_action(
        &self,
        ctx: ActionContext,
        mut headers: Vec<(String, String)>,
    ) -> Result<Message, AmiError> {
        if !self.is_connected() {
            return Err(AmiError::Disconnected);
        }

        let action_id = Uuid::new_v4().to_string();
        headers.push(("ActionID".to_string(), action_id.clone()));

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending action table poisoned")
            .insert(action_id.clone(), tx);

        let mut frame = String::new();
        for (key, value) in &headers {
            frame.push_str(key);
            frame.push_str(": ");
            frame.push_str(value);
            frame.push_str("\r\n");
        }
        frame.push_str("\r\n");

        {
            let mut writer_guard = self.shared.writer.lock().await;
            match writer_guard.as_mut() {
                Some(writer) => {
                    if writer.write_all(frame.as_bytes()).await.is_err() {
                        self.remove_pending(&action_id);
                        return Err(AmiError::Disconnected);
                    }
                }
                None => {
                    self.remove_pending(&action_id);
                    return Err(AmiError::Disconnected);
                }
            }
        }

        match tokio::time::timeout(ctx.timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(AmiError::Disconnected),
            Err(_) => {
                self.remove_pending(&action_id);
                Err(AmiError::Timeout)
            }
        }
    }

    fn remove_pending(&self, action_id: &str) {
        self.shared
            .pending
            .lock()
            .expect("pending action table poisoned")
            .remove(action_id);
    }

    async fn run(&self, mut cancel: watch::Receiver<bool>, first_attempt_tx: oneshot::Sender<()>) {
        let mut first_attempt_tx = Some(first_attempt_tx);
        let mut backoff: Option<Duration> = None;

        loop {
            if *cancel.borrow() {
                return;
            }

            if let Some(delay) = backoff {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            return;
                        }
                    }
                }
            }

            let result = self.connect_and_run(&mut cancel).await;

            if let Some(tx) = first_attempt_tx.take() {
                let _ = tx.send(());
            }

            match result {
                Ok(()) => {
                    backoff = None;
                }
                Err(err) => {
                    warn!(error = %err, "AMI connection attempt failed, will retry");
                    backoff = Some(match backoff {
                        None => self.shared.retry_initial,
                        Some(prev) => std::cmp::min(prev * 2, self.shared.retry_max),
                    });
                }
            }

            if *cancel.borrow() {
                return;
            }
        }
    }

    #[instrument(skip(self, cancel), fields(host = %self.shared.host, port = self.shared.port))]
    async fn connect_and_run(&self, cancel: &mut watch::Receiver<bool>) -> Result<(), AmiError> {
        let stream =
            TcpStream::connect((self.shared.host.as_str(), self.shared.port))
                .await
                .map_err(|source| AmiError::Connect {
                    host: self.shared.host.clone(),
                    port: self.shared.port,
                    source,
                })?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();

        *self.shared.writer.lock().await = Some(write_half);

        self.send_login_frame().await?;

        let mut accumulator = FrameAccumulator::new();
        let login_response = self.read_login_response(&mut reader, &mut accumulator).await?;
        if !login_response
            .get("Response")
            .is_some_and(|r| r.eq_ignore_ascii_case("Success"))
        {
            *self.shared.writer.lock().await = None;
            return Err(AmiError::LoginRejected);
        }

        self.shared.connected.store(true, Ordering::SeqCst);
        self.emit_status(true, None);
        info!("AMI connected and logged in");

        let disconnect_error = loop {
            let line = tokio::select! {
                line = reader.next_line() => line,
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break None;
                    }
                    continue;
                }
            };

            match line {
                Ok(Some(line)) => match accumulator.feed(&line) {
                    FeedResult::Complete(message) => self.dispatch(message),
                    FeedResult::Pending | FeedResult::Banner => {}
                },
                Ok(None) => break Some("connection closed by peer".to_string()),
                Err(err) => break Some(err.to_string()),
            }
        };

        self.shared.connected.store(false, Ordering::SeqCst);
        *self.shared.writer.lock().await = None;
        self.fail_all_pending();
        self.emit_status(false, disconnect_error.clone());

        match disconnect_error {
            Some(reason) => Err(AmiError::Connect {
                host: self.shared.host.clone(),
                port: self.shared.port,
                source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, reason),
            }),
            None => Ok(()),
        }
    }

    async fn send_login_frame(&self) -> Result<(), AmiError> {
        let headers = vec![
            ("Action".to_string(), "Login".to_string()),
            ("Username".to_string(), self.shared.username.clone()),
            ("Secret".to_string(), self.shared.password.clone()),
            ("Events".to_string(), self.shared.events.clone()),
        ];

        let mut frame = String::new();
        for (key, value) in &headers {
            frame.push_str(key);
            frame.push_str(": ");
            frame.push_str(value);
            frame.push_str("\r\n");
        }
        frame.push_str("\r\n");

        let mut writer_guard = self.shared.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(AmiError::Disconnected)?;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|source| AmiError::Connect {
                host: self.shared.host.clone(),
                port: self.shared.port,
                source,
            })
    }

    /// Reads lines until the login response frame completes, skipping the
    /// banner line that precedes it on a fresh TCP session.
    async fn read_login_response(
        &self,
        reader: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        accumulator: &mut FrameAccumulator,
    ) -> Result<Message, AmiError> {
        loop {
            let line = reader.next_line().await.map_err(|source| AmiError::Connect {
                host: self.shared.host.clone(),
                port: self.shared.port,
                source,
            })?;
            let line = line.ok_or(AmiError::LoginRejected)?;
            match accumulator.feed(&line) {
                FeedResult::Complete(message) => return Ok(message),
                FeedResult::Pending | FeedResult::Banner => continue,
            }
        }
    }

    fn dispatch(&self, message: Message) {
        if let Some(action_id) = message.get("ActionID") {
            let sender = self
                .shared
                .pending
                .lock()
                .expect("pending action table poisoned")
                .remove(action_id);
            if let Some(sender) = sender {
                let _ = sender.send(message);
                return;
            }
        }

        debug!(event = ?message.event(), "dispatching AMI event");
        let _ = self.shared.events_tx.send(message);
    }

    fn fail_all_pending(&self) {
        let mut pending = self.shared.pending.lock().expect("pending action table poisoned");
        pending.clear();
    }

    fn emit_status(&self, connected: bool, error: Option<String>) {
        let _ = self.shared.status_tx.send(ConnectionStatus {
            connected,
            at: Utc::now(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_action_without_connection_fails_fast() {
        let client = AmiClient::new(
            "127.0.0.1",
            1,
            "user",
            "secret",
            "on",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let err = client
            .send_action(
                ActionContext::with_timeout(Duration::from_millis(50)),
                vec![("Action".into(), "Ping".into())],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AmiError::Disconnected));
    }
}
