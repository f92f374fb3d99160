//! Monitor framework for the sqlmon agent.
//!
//! Each monitor periodically collects one kind of data from one instance:
//! OS metrics ([`os`]), database metrics ([`mysql`]), database configuration
//! snapshots ([`sysconfig`]) or query analytics ([`qan`]). All of them
//! conform to the [`Monitor`] contract; the agent holds them only through
//! it. A [`MonitorFactory`] keyed on service kind + instance kind builds the
//! concrete variant.

pub mod mysql;
pub mod os;
pub mod qan;
pub mod sysconfig;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlmon_common::error::{AgentError, Result};
use sqlmon_common::status::StatusRegistry;
use sqlmon_common::task::TaskHandle;
use sqlmon_common::types::{InstanceKind, SampleEnvelope};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::Mutex;

/// How long a monitor may wait on its output channel before dropping the
/// sample. A monitor never retries a lost sample and never blocks.
pub const SAMPLE_SEND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// One collected value: `{name, type, value}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
}

impl Metric {
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Gauge,
            value,
        }
    }

    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Counter,
            value,
        }
    }
}

fn default_max_workers() -> usize {
    2
}

fn default_worker_runtime() -> u64 {
    60
}

/// Per-instance monitor configuration, persisted to
/// `<basedir>/config/<service>-<uuid>.conf` while the monitor runs.
///
/// `collect`/`report` are periods in whole seconds; service defaults are
/// filled in by the factory when the control plane omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<u64>,
    #[serde(default)]
    pub synchronized: bool,
    /// Instance kind; inferred from `dsn` presence when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<InstanceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    /// Database-metrics subset to collect; empty means everything numeric.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<String>,
    /// Query-analytics slow log location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_log: Option<PathBuf>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Bound, in seconds, on how long an in-flight QAN worker may run once
    /// the monitor is draining.
    #[serde(default = "default_worker_runtime")]
    pub worker_runtime: u64,
    /// Override of the procfs root, for OS monitors under test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_root: Option<PathBuf>,
}

impl MonitorConfig {
    pub fn decode(payload: &serde_json::Value) -> Result<Self> {
        let cfg: Self = serde_json::from_value(payload.clone())
            .map_err(|e| AgentError::ConfigInvalid(e.to_string()))?;
        if cfg.uuid.is_empty() {
            return Err(AgentError::ConfigInvalid("uuid is required".to_string()));
        }
        Ok(cfg)
    }

    pub fn collect_period(&self) -> u64 {
        self.collect.unwrap_or(10)
    }

    pub fn instance_kind(&self) -> InstanceKind {
        self.kind.unwrap_or(if self.dsn.is_some() {
            InstanceKind::Database
        } else {
            InstanceKind::Os
        })
    }
}

/// The capability set every monitor exposes. Callers hold concrete monitors
/// only through this trait.
#[async_trait]
pub trait Monitor: Send {
    /// Status key for this monitor, `<service>-<uuid>`.
    fn name(&self) -> &str;

    fn config(&self) -> &MonitorConfig;

    /// Begins producing samples from `ticks` into `out`. Fails with
    /// [`AgentError::ServiceAlreadyRunning`] if already started.
    async fn start(
        &mut self,
        ticks: mpsc::Receiver<DateTime<Utc>>,
        out: mpsc::Sender<SampleEnvelope>,
    ) -> Result<()>;

    /// Blocks until the monitor's internal task has exited. Idempotent.
    async fn stop(&mut self) -> Result<()>;

    /// Current values of the status keys this monitor owns.
    fn status(&self) -> HashMap<String, String>;
}

/// One collection pass. Implemented by the OS, database-metrics and
/// database-configuration samplers; [`PeriodicMonitor`] drives the loop.
#[async_trait]
pub trait Sampler: Send + 'static {
    /// Produces the sample payload for one tick, or `None` when there is
    /// nothing to report this tick. Errors are logged and reflected in
    /// status; they never abort the monitor.
    async fn sample(&mut self, tick: DateTime<Utc>) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Generic tick-driven monitor: waits for ticks, runs the sampler, wraps the
/// payload in a [`SampleEnvelope`] and sends it downstream with a bounded
/// timeout.
pub struct PeriodicMonitor {
    key: String,
    service: &'static str,
    config: MonitorConfig,
    hostname: String,
    status: StatusRegistry,
    sampler: Arc<Mutex<Box<dyn Sampler>>>,
    task: Option<TaskHandle>,
}

impl PeriodicMonitor {
    pub fn new(
        service: &'static str,
        config: MonitorConfig,
        hostname: String,
        status: StatusRegistry,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        let key = format!("{service}-{}", config.uuid);
        status.set(&key, "Stopped");
        Self {
            key,
            service,
            config,
            hostname,
            status,
            sampler: Arc::new(Mutex::new(sampler)),
            task: None,
        }
    }
}

#[async_trait]
impl Monitor for PeriodicMonitor {
    fn name(&self) -> &str {
        &self.key
    }

    fn config(&self) -> &MonitorConfig {
        &self.config
    }

    async fn start(
        &mut self,
        ticks: mpsc::Receiver<DateTime<Utc>>,
        out: mpsc::Sender<SampleEnvelope>,
    ) -> Result<()> {
        if self.task.is_some() {
            return Err(AgentError::ServiceAlreadyRunning(self.key.clone()));
        }
        let key = self.key.clone();
        let service = self.service;
        let hostname = self.hostname.clone();
        let uuid = self.config.uuid.clone();
        let status = self.status.clone();
        let sampler = self.sampler.clone();
        self.task = Some(TaskHandle::spawn(move |stop| async move {
            run_periodic(key, service, hostname, uuid, status, sampler, ticks, out, stop).await;
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            if task.stop().await {
                tracing::warn!(monitor = %self.key, "Monitor task crashed");
            }
        }
        Ok(())
    }

    fn status(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(v) = self.status.get(&self.key) {
            map.insert(self.key.clone(), v);
        }
        map
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_periodic(
    key: String,
    service: &'static str,
    hostname: String,
    uuid: String,
    status: StatusRegistry,
    sampler: Arc<Mutex<Box<dyn Sampler>>>,
    mut ticks: mpsc::Receiver<DateTime<Utc>>,
    out: mpsc::Sender<SampleEnvelope>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    // Held for the whole run; freed when the task exits so the monitor can
    // be restarted with the same sampler state.
    let mut sampler = sampler.lock().await;
    status.set(&key, "Idle");
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            tick = ticks.recv() => {
                let Some(tick) = tick else { break };
                status.set(&key, "Collecting");
                match sampler.sample(tick).await {
                    Ok(Some(payload)) => {
                        let envelope = SampleEnvelope {
                            created_ts: tick,
                            hostname: hostname.clone(),
                            service: service.to_string(),
                            instance_uuid: uuid.clone(),
                            payload,
                        };
                        match out.send_timeout(envelope, SAMPLE_SEND_TIMEOUT).await {
                            Ok(()) => {}
                            Err(SendTimeoutError::Timeout(_)) => {
                                tracing::warn!(monitor = %key, "Lost sample; downstream slow");
                            }
                            Err(SendTimeoutError::Closed(_)) => break,
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(monitor = %key, error = %e, "Collection failed");
                        status.set(&key, format!("Error: {e}"));
                        continue;
                    }
                }
                status.set(&key, "Idle");
            }
        }
    }
    status.set(&key, "Stopped");
}

/// Builds the concrete monitor variant for a service kind + instance kind.
pub trait MonitorFactory: Send + Sync {
    fn build(
        &self,
        config: MonitorConfig,
        hostname: &str,
        status: &StatusRegistry,
    ) -> Result<Box<dyn Monitor>>;
}

/// Stock factory covering the built-in monitors.
pub struct StockFactory {
    service: &'static str,
}

impl StockFactory {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }
}

impl MonitorFactory for StockFactory {
    fn build(
        &self,
        mut config: MonitorConfig,
        hostname: &str,
        status: &StatusRegistry,
    ) -> Result<Box<dyn Monitor>> {
        match (self.service, config.instance_kind()) {
            ("mm", InstanceKind::Os) => {
                config.collect.get_or_insert(10);
                let root = config
                    .proc_root
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("/proc"));
                Ok(Box::new(PeriodicMonitor::new(
                    "mm",
                    config,
                    hostname.to_string(),
                    status.clone(),
                    Box::new(os::OsSampler::new(root)),
                )))
            }
            ("mm", InstanceKind::Database) => {
                config.collect.get_or_insert(10);
                let dsn = config
                    .dsn
                    .clone()
                    .ok_or_else(|| AgentError::ConfigInvalid("dsn is required".to_string()))?;
                let sampler = mysql::MySqlSampler::new(dsn, config.metrics.clone());
                Ok(Box::new(PeriodicMonitor::new(
                    "mm",
                    config,
                    hostname.to_string(),
                    status.clone(),
                    Box::new(sampler),
                )))
            }
            ("sysconfig", _) => {
                config.collect.get_or_insert(3600);
                // Configuration snapshots never phase-align; the agent must
                // not stall on startup waiting for a wall-clock boundary.
                config.synchronized = false;
                let dsn = config
                    .dsn
                    .clone()
                    .ok_or_else(|| AgentError::ConfigInvalid("dsn is required".to_string()))?;
                Ok(Box::new(PeriodicMonitor::new(
                    "sysconfig",
                    config,
                    hostname.to_string(),
                    status.clone(),
                    Box::new(sysconfig::SysconfigSampler::new(dsn)),
                )))
            }
            ("qan", _) => {
                config.collect.get_or_insert(60);
                Ok(Box::new(qan::QanMonitor::new(
                    config,
                    hostname.to_string(),
                    status.clone(),
                    Arc::new(qan::slowlog::EventCountParser),
                )?))
            }
            (service, kind) => Err(AgentError::ConfigInvalid(format!(
                "no monitor for service {service} and instance kind {kind:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ConstSampler(u64);

    #[async_trait]
    impl Sampler for ConstSampler {
        async fn sample(
            &mut self,
            _tick: DateTime<Utc>,
        ) -> anyhow::Result<Option<serde_json::Value>> {
            self.0 += 1;
            Ok(Some(json!({ "n": self.0 })))
        }
    }

    fn test_monitor() -> PeriodicMonitor {
        let config = MonitorConfig::decode(&json!({"uuid": "i-1", "collect": 1})).unwrap();
        PeriodicMonitor::new(
            "mm",
            config,
            "host-a".to_string(),
            StatusRegistry::new(),
            Box::new(ConstSampler(0)),
        )
    }

    #[tokio::test]
    async fn emits_one_envelope_per_tick() {
        let mut monitor = test_monitor();
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        monitor.start(tick_rx, out_tx).await.unwrap();

        let t0 = Utc::now();
        tick_tx.send(t0).await.unwrap();
        let env = out_rx.recv().await.unwrap();
        assert_eq!(env.service, "mm");
        assert_eq!(env.instance_uuid, "i-1");
        assert_eq!(env.created_ts, t0);
        assert_eq!(env.hostname, "host-a");

        monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn created_ts_non_decreasing() {
        let mut monitor = test_monitor();
        let (tick_tx, tick_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        monitor.start(tick_rx, out_tx).await.unwrap();

        let t0 = Utc::now();
        for i in 0..3 {
            tick_tx.send(t0 + chrono::Duration::seconds(i)).await.unwrap();
        }
        let mut last = None;
        for _ in 0..3 {
            let env = out_rx.recv().await.unwrap();
            if let Some(prev) = last {
                assert!(env.created_ts >= prev);
            }
            last = Some(env.created_ts);
        }
        monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_rejected_and_stop_idempotent() {
        let mut monitor = test_monitor();
        let (_tick_tx, tick_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        monitor.start(tick_rx, out_tx.clone()).await.unwrap();

        let (_tick_tx2, tick_rx2) = mpsc::channel(1);
        let err = monitor.start(tick_rx2, out_tx).await.unwrap_err();
        assert!(matches!(err, AgentError::ServiceAlreadyRunning(_)));

        monitor.stop().await.unwrap();
        monitor.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_downstream_drops_sample() {
        let mut monitor = test_monitor();
        let (tick_tx, tick_rx) = mpsc::channel(4);
        // Capacity 1 and nobody draining: the first sample fills the
        // channel, the second must be dropped after the send timeout
        // rather than blocking the monitor.
        let (out_tx, mut out_rx) = mpsc::channel(1);
        monitor.start(tick_rx, out_tx).await.unwrap();

        let t0 = Utc::now();
        tick_tx.send(t0).await.unwrap();
        tick_tx.send(t0 + chrono::Duration::seconds(1)).await.unwrap();
        drop(tick_tx);

        // Leave the channel untouched until the send timeout has elapsed
        // and the monitor has exited on its closed tick stream.
        tokio::time::sleep(SAMPLE_SEND_TIMEOUT * 2).await;

        let first = out_rx.recv().await.unwrap();
        assert_eq!(first.payload["n"], 1);
        assert!(out_rx.try_recv().is_err());
        monitor.stop().await.unwrap();
    }

    #[test]
    fn decode_requires_uuid() {
        let err = MonitorConfig::decode(&json!({"collect": 10})).unwrap_err();
        assert!(matches!(err, AgentError::ConfigInvalid(_)));
        let err = MonitorConfig::decode(&json!({"uuid": ""})).unwrap_err();
        assert!(matches!(err, AgentError::ConfigInvalid(_)));
    }

    #[test]
    fn instance_kind_inferred_from_dsn() {
        let cfg = MonitorConfig::decode(&json!({"uuid": "db-1", "dsn": "mysql://x"})).unwrap();
        assert_eq!(cfg.instance_kind(), InstanceKind::Database);
        let cfg = MonitorConfig::decode(&json!({"uuid": "os-1"})).unwrap();
        assert_eq!(cfg.instance_kind(), InstanceKind::Os);
    }
}
