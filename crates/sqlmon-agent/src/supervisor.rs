//! Command supervisor.
//!
//! One task owns the inbound command stream. Commands execute one at a
//! time under a hard deadline; every command gets exactly one reply
//! attempt, success or failure. The supervisor also answers the `agent`
//! tool itself (Ping, Version, Status, Update, Restart, Stop) and keeps
//! the last ten command outcomes for the status report.

use crate::config::AgentConfig;
use crate::service::ServiceHandler;
use crate::ticker::TickerManager;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use sqlmon_common::error::{AgentError, Result};
use sqlmon_common::status::StatusRegistry;
use sqlmon_common::task::TaskHandle;
use sqlmon_common::types::{Command, Reply};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Hard deadline for one command handler.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Command outcomes kept for the status report.
const HISTORY_DEPTH: usize = 10;

#[derive(Debug, Clone)]
struct HistoryEntry {
    ts: DateTime<Utc>,
    tool: String,
    verb: String,
    error: String,
}

pub struct Supervisor {
    transport: Arc<dyn Transport>,
    handlers: HashMap<&'static str, Arc<dyn ServiceHandler>>,
    ticker: Arc<TickerManager>,
    status: StatusRegistry,
    config: Mutex<AgentConfig>,
    config_path: PathBuf,
    history: Mutex<VecDeque<HistoryEntry>>,
    started_at: DateTime<Utc>,
}

impl Supervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        handlers: Vec<Arc<dyn ServiceHandler>>,
        ticker: Arc<TickerManager>,
        status: StatusRegistry,
        config: AgentConfig,
        config_path: PathBuf,
    ) -> Arc<Self> {
        status.set("agent", "Initializing");
        let handlers = handlers
            .into_iter()
            .map(|h| (h.service(), h))
            .collect();
        Arc::new(Self {
            transport,
            handlers,
            ticker,
            status,
            config: Mutex::new(config),
            config_path,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_DEPTH)),
            started_at: Utc::now(),
        })
    }

    /// Consumes commands until `Stop agent` arrives, `shutdown` fires or
    /// the transport closes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.status.set("agent", "Ready");
        let heartbeat = self.spawn_heartbeat().await;
        loop {
            let cmd = tokio::select! {
                _ = shutdown.changed() => break,
                cmd = self.transport.recv_command() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            let stopping = cmd.tool == "agent" && cmd.verb == "Stop";
            if stopping {
                self.status.set("agent", "Stopping");
            }
            self.handle_command(cmd).await;
            if stopping {
                break;
            }
            self.status.set("agent", "Ready");
        }
        self.status.set("agent", "Stopping");
        heartbeat.stop().await;
    }

    async fn spawn_heartbeat(&self) -> TaskHandle {
        let keepalive = self.config.lock().await.keepalive_secs.max(1);
        let transport = self.transport.clone();
        TaskHandle::spawn(move |mut stop| async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(keepalive));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        let _ = transport.send_ping();
                    }
                }
            }
        })
    }

    /// Runs one command to completion and makes exactly one reply attempt.
    pub async fn handle_command(&self, cmd: Command) {
        self.status
            .set("agent", format!("Handling {}.{}", cmd.tool, cmd.verb));
        tracing::info!(cmd_id = %cmd.id, tool = %cmd.tool, verb = %cmd.verb, "Command received");

        let outcome = tokio::time::timeout(COMMAND_TIMEOUT, self.dispatch(&cmd)).await;
        let reply = match outcome {
            Ok(Ok(payload)) => Reply::ok(&cmd, payload),
            Ok(Err(e)) => {
                tracing::warn!(cmd_id = %cmd.id, error = %e, "Command failed");
                Reply::err(&cmd, e)
            }
            Err(_) => {
                let e = AgentError::CommandTimeout(format!("{}.{}", cmd.tool, cmd.verb));
                tracing::warn!(cmd_id = %cmd.id, error = %e, "Command abandoned");
                Reply::err(&cmd, e)
            }
        };

        self.remember(&cmd, &reply).await;
        if let Err(e) = self.transport.send_reply(&reply) {
            tracing::warn!(cmd_id = %cmd.id, error = %e, "Reply not delivered");
        }
    }

    async fn remember(&self, cmd: &Command, reply: &Reply) {
        let mut history = self.history.lock().await;
        if history.len() == HISTORY_DEPTH {
            history.pop_front();
        }
        history.push_back(HistoryEntry {
            ts: cmd.ts,
            tool: cmd.tool.clone(),
            verb: cmd.verb.clone(),
            error: reply.error.clone(),
        });
    }

    async fn dispatch(&self, cmd: &Command) -> Result<serde_json::Value> {
        if cmd.tool == "agent" {
            return self.handle_agent(cmd).await;
        }
        match self.handlers.get(cmd.tool.as_str()) {
            Some(handler) => handler.handle(cmd).await,
            None => Err(AgentError::UnknownService(cmd.tool.clone())),
        }
    }

    async fn handle_agent(&self, cmd: &Command) -> Result<serde_json::Value> {
        match cmd.verb.as_str() {
            "Ping" => Ok(serde_json::json!("pong")),
            "Version" => Ok(serde_json::json!({ "version": crate::VERSION })),
            "Status" => Ok(serde_json::json!(self.render_status().await)),
            "Update" => {
                let patch = serde_json::from_value(cmd.payload.clone())
                    .map_err(|e| AgentError::ConfigInvalid(e.to_string()))?;
                let mut config = self.config.lock().await;
                config.merge_update(&patch);
                config.validate()?;
                config.save(&self.config_path)?;
                tracing::info!("Agent config updated");
                Ok(serde_json::Value::Null)
            }
            "Restart" => {
                let mut services: Vec<&Arc<dyn ServiceHandler>> =
                    self.handlers.values().collect();
                services.sort_by_key(|h| h.service());
                for handler in services {
                    handler.restart().await?;
                }
                tracing::info!("Services restarted");
                Ok(serde_json::Value::Null)
            }
            "Stop" => Ok(serde_json::Value::Null),
            verb => Err(AgentError::UnknownCommand(verb.to_string())),
        }
    }

    /// Multi-line human-readable status report.
    pub async fn render_status(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("sqlmon-agent {}\n", crate::VERSION));
        out.push_str(&format!("Up since: {}\n", self.started_at.to_rfc3339()));
        out.push_str(&format!(
            "State: {}\n",
            self.status.get("agent").unwrap_or_default()
        ));
        out.push_str(&format!(
            "Link: {}\n",
            self.transport.status()
        ));
        out.push_str(&format!(
            "Tick subscriptions: {}\n",
            self.ticker.subscriber_count()
        ));

        let mut services: Vec<&Arc<dyn ServiceHandler>> = self.handlers.values().collect();
        services.sort_by_key(|h| h.service());
        for handler in services {
            out.push_str(&format!("Service {}:\n", handler.service()));
            let mut entries: Vec<(String, String)> = handler.status().await.into_iter().collect();
            entries.sort();
            for (key, value) in entries {
                out.push_str(&format!("  {key}: {value}\n"));
            }
        }

        let history = self.history.lock().await;
        out.push_str(&format!("Last {} commands:\n", history.len()));
        for entry in history.iter().rev() {
            let outcome = if entry.error.is_empty() {
                "ok".to_string()
            } else {
                entry.error.clone()
            };
            out.push_str(&format!(
                "  {} {}.{}: {}\n",
                entry.ts.to_rfc3339(),
                entry.tool,
                entry.verb,
                outcome
            ));
        }
        out
    }
}
