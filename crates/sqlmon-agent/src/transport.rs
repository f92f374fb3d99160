//! Control-plane transport.
//!
//! The agent depends only on the [`Transport`] trait: one sender per
//! logical upstream stream (replies, log events, telemetry) and one
//! receiver for commands. The concrete client speaks newline-delimited
//! JSON wire envelopes over a single TCP connection and reconnects
//! autonomously with full-jitter exponential backoff (1s doubling to a
//! 5 minute cap). Upper layers observe a command stream that may gap but
//! never duplicates.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use sqlmon_common::error::AgentError;
use sqlmon_common::task::TaskHandle;
use sqlmon_common::types::{wire_kind, Command, LogEvent, Reply, SampleEnvelope, WireMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio_util::codec::{Framed, LinesCodec};

/// How long the spool send loop waits for the control plane to ack a
/// telemetry batch.
const ACK_TIMEOUT: Duration = Duration::from_secs(30);

const OUTBOUND_DEPTH: usize = 256;
const COMMAND_DEPTH: usize = 64;
const MAX_LINE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Disconnected => write!(f, "disconnected"),
            LinkStatus::Connecting => write!(f, "connecting"),
            LinkStatus::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport: not connected")]
    Disconnected,

    #[error("Transport: outbound queue full")]
    QueueFull,

    #[error("Transport: no ack within {0:?}")]
    AckTimeout(Duration),

    #[error("Transport: encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The abstract full-duplex channel to the control plane.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Non-blocking; fails fast when the link is down or the outbound
    /// buffer is full. An undeliverable reply is dropped, the control
    /// plane re-queries.
    fn send_reply(&self, reply: &Reply) -> Result<(), TransportError>;

    /// Non-blocking; fails fast when the outbound buffer is full.
    fn send_log(&self, event: &LogEvent) -> Result<(), TransportError>;

    /// Keepalive no-op; missing acks only affect connection status.
    fn send_ping(&self) -> Result<(), TransportError>;

    /// Ships one telemetry batch and waits for the control plane's ack.
    async fn report_samples(&self, envelopes: &[SampleEnvelope]) -> Result<(), TransportError>;

    /// Blocks until the next inbound command; `None` once shut down.
    async fn recv_command(&self) -> Option<Command>;

    fn status(&self) -> LinkStatus;

    /// Waits up to `timeout` for the link to come up.
    async fn wait_connected(&self, timeout: Duration) -> bool;

    /// Idempotent; stops the reconnect loop and closes the link.
    async fn disconnect(&self);
}

/// Exponential backoff with full jitter.
pub struct Backoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base,
            max,
        }
    }

    /// Delay to sleep before the next attempt; doubles the window up to
    /// the cap.
    pub fn next_delay(&mut self) -> Duration {
        let window = self.current.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(0..=window);
        self.current = (self.current * 2).min(self.max);
        Duration::from_millis(jittered)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Identity presented in the hello frame.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub agent_uuid: String,
    pub api_key: String,
    pub hostname: String,
    pub version: String,
}

type AckMap = Arc<Mutex<HashMap<String, oneshot::Sender<bool>>>>;

/// JSON-lines-over-TCP transport client.
pub struct TcpTransport {
    out_tx: mpsc::Sender<WireMessage>,
    cmd_rx: AsyncMutex<mpsc::Receiver<Command>>,
    acks: AckMap,
    status_rx: watch::Receiver<LinkStatus>,
    task: Mutex<Option<TaskHandle>>,
}

impl TcpTransport {
    /// Starts the reconnect loop and returns the shared client handle.
    pub fn spawn(config: TransportConfig) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_DEPTH);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_DEPTH);
        let (status_tx, status_rx) = watch::channel(LinkStatus::Disconnected);
        let acks: AckMap = Arc::new(Mutex::new(HashMap::new()));

        let loop_acks = acks.clone();
        let loop_out = out_tx.clone();
        let task = TaskHandle::spawn(move |stop| async move {
            connection_loop(config, out_rx, loop_out, cmd_tx, loop_acks, status_tx, stop).await;
        });

        Arc::new(Self {
            out_tx,
            cmd_rx: AsyncMutex::new(cmd_rx),
            acks,
            status_rx,
            task: Mutex::new(Some(task)),
        })
    }

    fn enqueue(&self, msg: WireMessage) -> Result<(), TransportError> {
        self.out_tx
            .try_send(msg)
            .map_err(|_| TransportError::QueueFull)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn send_reply(&self, reply: &Reply) -> Result<(), TransportError> {
        if self.status() != LinkStatus::Connected {
            return Err(TransportError::Disconnected);
        }
        self.enqueue(WireMessage::reply(reply)?)
    }

    fn send_log(&self, event: &LogEvent) -> Result<(), TransportError> {
        if self.status() != LinkStatus::Connected {
            return Err(TransportError::Disconnected);
        }
        self.enqueue(WireMessage::log(event)?)
    }

    fn send_ping(&self) -> Result<(), TransportError> {
        self.enqueue(WireMessage::ping())
    }

    async fn report_samples(&self, envelopes: &[SampleEnvelope]) -> Result<(), TransportError> {
        if self.status() != LinkStatus::Connected {
            return Err(TransportError::Disconnected);
        }
        let batch_id = uuid::Uuid::new_v4().to_string();
        let msg = WireMessage::data(&batch_id, envelopes)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.acks
            .lock()
            .expect("ack map poisoned")
            .insert(batch_id.clone(), ack_tx);

        if let Err(e) = self.enqueue(msg) {
            self.acks.lock().expect("ack map poisoned").remove(&batch_id);
            return Err(e);
        }

        match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(_) => Err(TransportError::Disconnected),
            Err(_) => {
                self.acks.lock().expect("ack map poisoned").remove(&batch_id);
                Err(TransportError::AckTimeout(ACK_TIMEOUT))
            }
        }
    }

    async fn recv_command(&self) -> Option<Command> {
        self.cmd_rx.lock().await.recv().await
    }

    fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.status_rx.clone();
        tokio::time::timeout(timeout, async {
            while *rx.borrow() != LinkStatus::Connected {
                if rx.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await
        .unwrap_or(false)
    }

    async fn disconnect(&self) {
        let task = self.task.lock().expect("task slot poisoned").take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

async fn connection_loop(
    config: TransportConfig,
    mut out_rx: mpsc::Receiver<WireMessage>,
    out_tx: mpsc::Sender<WireMessage>,
    cmd_tx: mpsc::Sender<Command>,
    acks: AckMap,
    status_tx: watch::Sender<LinkStatus>,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(300));
    loop {
        if *stop.borrow() {
            break;
        }
        let _ = status_tx.send(LinkStatus::Connecting);
        let stream = tokio::select! {
            _ = stop.changed() => break,
            result = TcpStream::connect(&config.host) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(host = %config.host, error = %e, "Connect failed");
                    let _ = status_tx.send(LinkStatus::Disconnected);
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            },
        };

        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
        let hello = WireMessage::hello(
            &config.agent_uuid,
            &config.api_key,
            &config.hostname,
            &config.version,
        );
        let hello_line = match serde_json::to_string(&hello) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Hello encode failed");
                break;
            }
        };
        if let Err(e) = framed.send(hello_line).await {
            tracing::warn!(error = %e, "Handshake failed");
            let _ = status_tx.send(LinkStatus::Disconnected);
            tokio::time::sleep(backoff.next_delay()).await;
            continue;
        }

        tracing::info!(host = %config.host, "Connected to control plane");
        let _ = status_tx.send(LinkStatus::Connected);
        backoff.reset();

        let session = run_session(&mut framed, &mut out_rx, &out_tx, &cmd_tx, &acks, &mut stop).await;
        let _ = status_tx.send(LinkStatus::Disconnected);
        fail_pending_acks(&acks);
        match session {
            SessionEnd::Stopped => break,
            SessionEnd::Lost => {
                tracing::warn!("Control-plane link lost; reconnecting");
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(backoff.next_delay()) => {}
                }
            }
        }
    }
    let _ = status_tx.send(LinkStatus::Disconnected);
}

enum SessionEnd {
    Stopped,
    Lost,
}

async fn run_session(
    framed: &mut Framed<TcpStream, LinesCodec>,
    out_rx: &mut mpsc::Receiver<WireMessage>,
    out_tx: &mpsc::Sender<WireMessage>,
    cmd_tx: &mpsc::Sender<Command>,
    acks: &AckMap,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        tokio::select! {
            _ = stop.changed() => return SessionEnd::Stopped,
            msg = out_rx.recv() => {
                let Some(msg) = msg else { return SessionEnd::Stopped };
                let line = match serde_json::to_string(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "Outbound encode failed; dropping");
                        continue;
                    }
                };
                if framed.send(line).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
            frame = framed.next() => {
                let Some(Ok(line)) = frame else { return SessionEnd::Lost };
                dispatch_inbound(&line, out_tx, cmd_tx, acks);
            }
        }
    }
}

fn dispatch_inbound(
    line: &str,
    out_tx: &mpsc::Sender<WireMessage>,
    cmd_tx: &mpsc::Sender<Command>,
    acks: &AckMap,
) {
    let msg: WireMessage = match serde_json::from_str(line) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed inbound frame; dropping");
            return;
        }
    };
    match msg.kind.as_str() {
        wire_kind::CMD => {
            let cmd: Command = match serde_json::from_value(msg.body) {
                Ok(cmd) => cmd,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed command; dropping");
                    return;
                }
            };
            if let Err(mpsc::error::TrySendError::Full(cmd)) = cmd_tx.try_send(cmd) {
                // Saturated command queue: reject up front so the control
                // plane is not left waiting on a reply that will never come.
                tracing::warn!(cmd_id = %cmd.id, "Command queue full; rejecting");
                let reply = Reply::err(&cmd, AgentError::QueueFull);
                if let Ok(msg) = WireMessage::reply(&reply) {
                    let _ = out_tx.try_send(msg);
                }
            }
        }
        wire_kind::ACK => {
            if let Some(id) = msg.id {
                if let Some(waiter) = acks.lock().expect("ack map poisoned").remove(&id) {
                    let _ = waiter.send(true);
                }
            }
        }
        wire_kind::PING => {}
        other => {
            tracing::debug!(kind = %other, "Ignoring inbound frame");
        }
    }
}

fn fail_pending_acks(acks: &AckMap) {
    let waiters: Vec<_> = {
        let mut map = acks.lock().expect("ack map poisoned");
        map.drain().map(|(_, tx)| tx).collect()
    };
    for tx in waiters {
        let _ = tx.send(false);
    }
}
