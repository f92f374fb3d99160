//! Log relay.
//!
//! Every log event the agent emits flows through one relay task, which
//! fans it out to up to two sinks: a local JSON-lines file and the
//! control-plane log stream. Producers never block: the intake queue is
//! bounded and overflow is counted, not buffered. Upstream outages are
//! absorbed by a fixed ring that drops its oldest entry on overflow and
//! reports the loss once the link recovers. A `Fatal` event flushes the
//! file sink and raises the exit signal the process watches for.

use crate::config::write_atomic;
use crate::transport::{Transport, TransportError};
use serde::{Deserialize, Serialize};
use sqlmon_common::error::{AgentError, Result};
use sqlmon_common::task::TaskHandle;
use sqlmon_common::types::{LogEvent, LogLevel};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Events queued between producers and the relay task.
const INTAKE_DEPTH: usize = 512;

/// Events retained for the control plane while the link is down.
const UPSTREAM_RING: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default = "default_upstream")]
    pub upstream: bool,
}

fn default_upstream() -> bool {
    true
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
            upstream: true,
        }
    }
}

impl RelaySettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| AgentError::ConfigInvalid(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        write_atomic(path, raw.as_bytes())?;
        Ok(())
    }
}

enum RelayMsg {
    Event(LogEvent),
    Configure(RelaySettings),
    Flush(oneshot::Sender<()>),
}

/// Cheap cloneable producer handle.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayMsg>,
    dropped: Arc<AtomicU64>,
    settings: Arc<RwLock<RelaySettings>>,
}

impl RelayHandle {
    /// Never blocks. A full intake queue drops the event and bumps the
    /// counter.
    pub fn emit(&self, event: LogEvent) {
        if self.tx.try_send(RelayMsg::Event(event)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events lost at intake since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> RelaySettings {
        self.settings.read().expect("relay settings poisoned").clone()
    }

    /// Applies new settings and persists them through the caller.
    pub async fn reconfigure(&self, settings: RelaySettings) {
        *self.settings.write().expect("relay settings poisoned") = settings.clone();
        let _ = self.tx.send(RelayMsg::Configure(settings)).await;
    }

    /// Waits until every event queued so far has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(RelayMsg::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct Relay {
    pub handle: RelayHandle,
    task: TaskHandle,
    fatal_rx: watch::Receiver<bool>,
}

impl Relay {
    pub fn spawn(settings: RelaySettings, transport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::channel(INTAKE_DEPTH);
        let (fatal_tx, fatal_rx) = watch::channel(false);
        let shared = Arc::new(RwLock::new(settings.clone()));
        let handle = RelayHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            settings: shared,
        };
        let task =
            TaskHandle::spawn(move |stop| run_relay(settings, transport, rx, fatal_tx, stop));
        Self {
            handle,
            task,
            fatal_rx,
        }
    }

    /// Flips to `true` once a `Fatal` event has been flushed; the process
    /// treats that as an exit request.
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal_rx.clone()
    }

    pub async fn stop(self) {
        self.handle.flush().await;
        self.task.stop().await;
    }
}

async fn run_relay(
    mut settings: RelaySettings,
    transport: Arc<dyn Transport>,
    mut rx: mpsc::Receiver<RelayMsg>,
    fatal_tx: watch::Sender<bool>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let mut sink = FileSink::open(settings.file.as_deref());
    let mut upstream = UpstreamSink::new(transport);
    loop {
        let msg = tokio::select! {
            _ = stop.changed() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        match msg {
            RelayMsg::Event(event) => {
                if event.level < settings.level {
                    continue;
                }
                let fatal = event.level == LogLevel::Fatal;
                sink.write(&event);
                if settings.upstream {
                    upstream.forward(event);
                }
                if fatal {
                    sink.sync();
                    let _ = fatal_tx.send(true);
                }
            }
            RelayMsg::Configure(new) => {
                if new.file != settings.file {
                    sink = FileSink::open(new.file.as_deref());
                }
                settings = new;
            }
            RelayMsg::Flush(ack) => {
                sink.sync();
                let _ = ack.send(());
            }
        }
    }
    // Drain whatever producers managed to queue before shutdown.
    while let Ok(msg) = rx.try_recv() {
        if let RelayMsg::Event(event) = msg {
            if event.level >= settings.level {
                sink.write(&event);
            }
        }
    }
    sink.sync();
}

struct FileSink {
    file: Option<std::fs::File>,
}

impl FileSink {
    fn open(path: Option<&Path>) -> Self {
        let file = path.and_then(|p| {
            match std::fs::OpenOptions::new().create(true).append(true).open(p) {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "Cannot open log file");
                    None
                }
            }
        });
        Self { file }
    }

    fn write(&mut self, event: &LogEvent) {
        let Some(file) = self.file.as_mut() else { return };
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(file, "{line}");
        }
    }

    fn sync(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}

/// Forwards events to the control plane, riding out disconnects with a
/// bounded backlog. Backlogged events always leave before newer ones.
struct UpstreamSink {
    transport: Arc<dyn Transport>,
    backlog: VecDeque<LogEvent>,
    lost: u64,
}

impl UpstreamSink {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            backlog: VecDeque::with_capacity(UPSTREAM_RING),
            lost: 0,
        }
    }

    fn forward(&mut self, event: LogEvent) {
        self.backlog.push_back(event);
        while self.backlog.len() > UPSTREAM_RING {
            self.backlog.pop_front();
            self.lost += 1;
        }
        self.drain();
    }

    fn drain(&mut self) {
        while let Some(event) = self.backlog.front() {
            match self.transport.send_log(event) {
                Ok(()) => {
                    self.backlog.pop_front();
                    if self.lost > 0 && self.backlog.is_empty() {
                        let summary = LogEvent::new(
                            LogLevel::Warn,
                            "log",
                            format!("{} events dropped while offline", self.lost),
                        );
                        if self.transport.send_log(&summary).is_ok() {
                            self.lost = 0;
                        }
                    }
                }
                Err(TransportError::Disconnected) | Err(TransportError::QueueFull) => return,
                Err(e) => {
                    tracing::debug!(error = %e, "Upstream log send failed; dropping");
                    self.backlog.pop_front();
                    self.lost += 1;
                }
            }
        }
    }
}

/// Bridges `tracing` events into the relay so internal diagnostics reach
/// the same file and upstream sinks as service events.
pub struct RelayLayer {
    handle: RelayHandle,
}

impl RelayLayer {
    pub fn new(handle: RelayHandle) -> Self {
        Self { handle }
    }
}

impl<S: tracing::Subscriber> Layer<S> for RelayLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        };
        let service = event
            .metadata()
            .target()
            .rsplit("::")
            .next()
            .unwrap_or("agent")
            .to_string();
        self.handle.emit(LogEvent::new(level, service, visitor.render()));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn render(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let mut out = self.message;
        for (k, v) in self.fields {
            out.push_str(&format!(" {k}={v}"));
        }
        out
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push((field.name().to_string(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }
}
