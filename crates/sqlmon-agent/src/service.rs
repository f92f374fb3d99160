//! Service managers.
//!
//! The supervisor routes each command to the handler registered for its
//! `tool`. Monitor services (`mm`, `sysconfig`, `qan`) manage a set of
//! running monitors keyed by instance uuid; the `log` and `data` services
//! expose get/set over the relay and spool settings. Handlers return a
//! payload value or an [`AgentError`]; the supervisor turns either into
//! the reply.

use crate::config::{write_atomic, Basedir};
use crate::relay::{RelayHandle, RelaySettings};
use crate::spool::{SpoolSettings, Spooler};
use crate::ticker::{SubId, TickerManager};
use async_trait::async_trait;
use serde::Deserialize;
use sqlmon_common::error::{AgentError, Result};
use sqlmon_common::status::StatusRegistry;
use sqlmon_common::types::{Command, SampleEnvelope};
use sqlmon_collector::{Monitor, MonitorConfig, MonitorFactory};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[async_trait]
pub trait ServiceHandler: Send + Sync {
    fn service(&self) -> &'static str;

    /// Executes one command. The supervisor serializes calls, so handlers
    /// never see concurrent commands.
    async fn handle(&self, cmd: &Command) -> Result<serde_json::Value>;

    /// Recycles the service's runtime state, keeping its configuration.
    /// Services with nothing to recycle keep the no-op default.
    async fn restart(&self) -> Result<()> {
        Ok(())
    }

    async fn status(&self) -> HashMap<String, String>;
}

struct RunningMonitor {
    monitor: Box<dyn Monitor>,
    sub: SubId,
    config: MonitorConfig,
}

/// Manages the monitors of one service kind. The set of running monitors
/// always equals the set of `<service>-<uuid>.conf` files on disk.
pub struct MonitorService {
    service: &'static str,
    basedir: Basedir,
    ticker: Arc<TickerManager>,
    sample_tx: mpsc::Sender<SampleEnvelope>,
    hostname: String,
    factory: Box<dyn MonitorFactory>,
    monitors: Mutex<HashMap<String, RunningMonitor>>,
    status: StatusRegistry,
}

#[derive(Deserialize)]
struct UuidPayload {
    uuid: String,
}

impl MonitorService {
    pub fn new(
        service: &'static str,
        basedir: Basedir,
        ticker: Arc<TickerManager>,
        sample_tx: mpsc::Sender<SampleEnvelope>,
        hostname: String,
        factory: Box<dyn MonitorFactory>,
        status: StatusRegistry,
    ) -> Self {
        status.set(service, "Idle (0 monitors)");
        Self {
            service,
            basedir,
            ticker,
            sample_tx,
            hostname,
            factory,
            monitors: Mutex::new(HashMap::new()),
            status,
        }
    }

    fn set_summary(&self, count: usize) {
        self.status
            .set(self.service, format!("Idle ({count} monitors)"));
    }

    /// Starts one monitor and persists its config. Roll-back on failure
    /// leaves no trace: no subscription, no map entry, no config file.
    async fn start_monitor(&self, config: MonitorConfig, persist: bool) -> Result<()> {
        let mut monitors = self.monitors.lock().await;
        if monitors.contains_key(&config.uuid) {
            return Err(AgentError::ServiceAlreadyRunning(format!(
                "{}-{}",
                self.service, config.uuid
            )));
        }

        let mut monitor = self.factory.build(config.clone(), &self.hostname, &self.status)?;
        let sub = self
            .ticker
            .subscribe(config.collect_period(), config.synchronized);
        let sub_id = sub.id;
        if let Err(e) = monitor.start(sub.rx, self.sample_tx.clone()).await {
            self.ticker.unsubscribe(sub_id);
            return Err(e);
        }

        if persist {
            let path = self.basedir.service_conf(self.service, &config.uuid);
            let raw = serde_json::to_string(&config)?;
            if let Err(e) = write_atomic(&path, raw.as_bytes()) {
                let _ = monitor.stop().await;
                self.ticker.unsubscribe(sub_id);
                return Err(e.into());
            }
        }

        tracing::info!(service = %self.service, uuid = %config.uuid, "Monitor started");
        monitors.insert(
            config.uuid.clone(),
            RunningMonitor {
                monitor,
                sub: sub_id,
                config,
            },
        );
        self.set_summary(monitors.len());
        Ok(())
    }

    /// Stops one monitor and removes its config file. Returns the config
    /// it was running with, for `Restart`.
    async fn stop_monitor(&self, uuid: &str) -> Result<MonitorConfig> {
        let mut monitors = self.monitors.lock().await;
        let Some(mut running) = monitors.remove(uuid) else {
            return Err(AgentError::ServiceNotRunning(format!(
                "{}-{uuid}",
                self.service
            )));
        };
        self.ticker.unsubscribe(running.sub);
        running.monitor.stop().await?;
        let _ = std::fs::remove_file(self.basedir.service_conf(self.service, uuid));
        self.status.remove(&format!("{}-{uuid}", self.service));
        tracing::info!(service = %self.service, uuid = %uuid, "Monitor stopped");
        self.set_summary(monitors.len());
        Ok(running.config)
    }

    /// Restarts every monitor whose config file survived the last run.
    /// With `strict` set the first failure aborts; otherwise bad configs
    /// are logged and skipped.
    pub async fn startup_scan(&self, strict: bool) -> Result<usize> {
        let prefix = format!("{}-", self.service);
        let mut started = 0;
        let dir = match std::fs::read_dir(self.basedir.config_dir()) {
            Ok(dir) => dir,
            Err(e) => {
                return if strict {
                    Err(e.into())
                } else {
                    Ok(0)
                }
            }
        };
        for dirent in dir.flatten() {
            let name = dirent.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || !name.ends_with(".conf") {
                continue;
            }
            let outcome = async {
                let raw = std::fs::read_to_string(dirent.path())?;
                let config: MonitorConfig = serde_json::from_str(&raw)
                    .map_err(|e| AgentError::ConfigInvalid(format!("{name}: {e}")))?;
                self.start_monitor(config, false).await
            }
            .await;
            match outcome {
                Ok(()) => started += 1,
                Err(e) if strict => return Err(e),
                Err(e) => {
                    tracing::warn!(service = %self.service, file = %name, error = %e,
                        "Skipping monitor config");
                }
            }
        }
        Ok(started)
    }

    pub async fn stop_all(&self) {
        let uuids: Vec<String> = self.monitors.lock().await.keys().cloned().collect();
        for uuid in uuids {
            if let Err(e) = self.stop_monitor(&uuid).await {
                tracing::warn!(service = %self.service, uuid = %uuid, error = %e,
                    "Stop failed during shutdown");
            }
        }
    }

    /// Stops and starts every running monitor with the config it is
    /// already running with.
    pub async fn restart_all(&self) -> Result<()> {
        for uuid in self.running().await {
            let config = self.stop_monitor(&uuid).await?;
            self.start_monitor(config, true).await?;
        }
        Ok(())
    }

    pub async fn running(&self) -> Vec<String> {
        let mut uuids: Vec<String> = self.monitors.lock().await.keys().cloned().collect();
        uuids.sort();
        uuids
    }
}

#[async_trait]
impl ServiceHandler for MonitorService {
    fn service(&self) -> &'static str {
        self.service
    }

    async fn handle(&self, cmd: &Command) -> Result<serde_json::Value> {
        match cmd.verb.as_str() {
            "Start" => {
                let config = MonitorConfig::decode(&cmd.payload)?;
                self.start_monitor(config, true).await?;
                Ok(serde_json::Value::Null)
            }
            "Stop" => {
                let p: UuidPayload = serde_json::from_value(cmd.payload.clone())
                    .map_err(|e| AgentError::ConfigInvalid(e.to_string()))?;
                self.stop_monitor(&p.uuid).await?;
                Ok(serde_json::Value::Null)
            }
            "Restart" => {
                let p: UuidPayload = serde_json::from_value(cmd.payload.clone())
                    .map_err(|e| AgentError::ConfigInvalid(e.to_string()))?;
                let config = self.stop_monitor(&p.uuid).await?;
                self.start_monitor(config, true).await?;
                Ok(serde_json::Value::Null)
            }
            "GetConfig" => {
                let monitors = self.monitors.lock().await;
                let configs: Vec<&MonitorConfig> =
                    monitors.values().map(|r| &r.config).collect();
                Ok(serde_json::to_value(configs)?)
            }
            verb => Err(AgentError::UnknownCommand(verb.to_string())),
        }
    }

    async fn restart(&self) -> Result<()> {
        self.restart_all().await
    }

    async fn status(&self) -> HashMap<String, String> {
        let monitors = self.monitors.lock().await;
        let mut map = HashMap::new();
        if let Some(v) = self.status.get(self.service) {
            map.insert(self.service.to_string(), v);
        }
        for running in monitors.values() {
            map.extend(running.monitor.status());
        }
        map
    }
}

/// `log` tool: get/set relay settings, persisted to `log.conf`.
pub struct LogService {
    relay: RelayHandle,
    conf_path: std::path::PathBuf,
}

impl LogService {
    pub fn new(relay: RelayHandle, basedir: &Basedir) -> Self {
        Self {
            relay,
            conf_path: basedir.log_conf(),
        }
    }
}

#[async_trait]
impl ServiceHandler for LogService {
    fn service(&self) -> &'static str {
        "log"
    }

    async fn handle(&self, cmd: &Command) -> Result<serde_json::Value> {
        match cmd.verb.as_str() {
            "GetConfig" => Ok(serde_json::to_value(self.relay.settings())?),
            "SetConfig" => {
                let settings: RelaySettings = serde_json::from_value(cmd.payload.clone())
                    .map_err(|e| AgentError::ConfigInvalid(e.to_string()))?;
                settings.save(&self.conf_path)?;
                self.relay.reconfigure(settings).await;
                Ok(serde_json::Value::Null)
            }
            verb => Err(AgentError::UnknownCommand(verb.to_string())),
        }
    }

    async fn status(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("log".to_string(), format!("{} dropped", self.relay.dropped()));
        map
    }
}

/// `data` tool: get/set spool settings, persisted to `data.conf`.
pub struct DataService {
    spool: Arc<Spooler>,
    status: StatusRegistry,
    conf_path: std::path::PathBuf,
}

impl DataService {
    pub fn new(spool: Arc<Spooler>, status: StatusRegistry, basedir: &Basedir) -> Self {
        Self {
            spool,
            status,
            conf_path: basedir.data_conf(),
        }
    }
}

#[async_trait]
impl ServiceHandler for DataService {
    fn service(&self) -> &'static str {
        "data"
    }

    async fn handle(&self, cmd: &Command) -> Result<serde_json::Value> {
        match cmd.verb.as_str() {
            "GetConfig" => Ok(serde_json::to_value(self.spool.settings())?),
            "SetConfig" => {
                let settings: SpoolSettings = serde_json::from_value(cmd.payload.clone())
                    .map_err(|e| AgentError::ConfigInvalid(e.to_string()))?;
                settings.save(&self.conf_path)?;
                self.spool.reconfigure(settings);
                Ok(serde_json::Value::Null)
            }
            verb => Err(AgentError::UnknownCommand(verb.to_string())),
        }
    }

    async fn status(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(v) = self.status.get("data") {
            map.insert("data".to_string(), v);
        }
        map.insert(
            "data-spool".to_string(),
            format!("{} queued ({} bytes)", self.spool.len(), self.spool.bytes()),
        );
        map
    }
}
