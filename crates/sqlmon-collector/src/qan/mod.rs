//! Query-analytics monitor.
//!
//! Runs an interval state machine: a tick closes the current slow-log
//! interval and hands it to a parse worker while collection of the next
//! interval continues. At most `max_workers` parses run concurrently; a
//! tick that arrives with all workers busy drops its interval with a
//! warning, it is never queued. `stop()` drains in-flight workers bounded
//! by `worker_runtime`.

pub mod slowlog;

use crate::{Monitor, MonitorConfig, SAMPLE_SEND_TIMEOUT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slowlog::{IntervalIter, QanReport, SlowLogParser};
use sqlmon_common::error::{AgentError, Result};
use sqlmon_common::status::StatusRegistry;
use sqlmon_common::task::TaskHandle;
use sqlmon_common::types::SampleEnvelope;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinSet;

pub struct QanMonitor {
    key: String,
    config: MonitorConfig,
    hostname: String,
    status: StatusRegistry,
    parser: Arc<dyn SlowLogParser>,
    task: Option<TaskHandle>,
}

impl QanMonitor {
    pub fn new(
        config: MonitorConfig,
        hostname: String,
        status: StatusRegistry,
        parser: Arc<dyn SlowLogParser>,
    ) -> Result<Self> {
        if config.slow_log.is_none() {
            return Err(AgentError::ConfigInvalid(
                "slow_log is required for qan".to_string(),
            ));
        }
        let key = format!("qan-{}", config.uuid);
        status.set(&key, "Stopped");
        Ok(Self {
            key,
            config,
            hostname,
            status,
            parser,
            task: None,
        })
    }
}

#[async_trait]
impl Monitor for QanMonitor {
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
        let ctx = RunContext {
            key: self.key.clone(),
            config: self.config.clone(),
            hostname: self.hostname.clone(),
            status: self.status.clone(),
            parser: self.parser.clone(),
        };
        self.task = Some(TaskHandle::spawn(move |stop| async move {
            run_qan(ctx, ticks, out, stop).await;
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

struct RunContext {
    key: String,
    config: MonitorConfig,
    hostname: String,
    status: StatusRegistry,
    parser: Arc<dyn SlowLogParser>,
}

async fn run_qan(
    ctx: RunContext,
    mut ticks: mpsc::Receiver<DateTime<Utc>>,
    out: mpsc::Sender<SampleEnvelope>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let slow_log = ctx
        .config
        .slow_log
        .clone()
        .expect("validated at construction");
    let mut iter = IntervalIter::new(slow_log);
    let mut workers: JoinSet<anyhow::Result<QanReport>> = JoinSet::new();

    ctx.status.set(&ctx.key, "Idle");
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            tick = ticks.recv() => {
                let Some(tick) = tick else { break };
                if workers.len() >= ctx.config.max_workers {
                    tracing::warn!(
                        monitor = %ctx.key,
                        busy = workers.len(),
                        "All workers busy; dropping interval"
                    );
                    continue;
                }
                match iter.next_interval(tick) {
                    Ok(interval) => {
                        let parser = ctx.parser.clone();
                        workers.spawn_blocking(move || parser.parse(&interval));
                        ctx.status.set(
                            &ctx.key,
                            format!("Collecting ({} processing)", workers.len()),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(monitor = %ctx.key, error = %e, "Interval rotation failed");
                    }
                }
            }
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                emit_report(&ctx, joined, &out).await;
                if workers.is_empty() {
                    ctx.status.set(&ctx.key, "Idle");
                }
            }
        }
    }

    // Drain: let in-flight workers finish, bounded by worker_runtime.
    ctx.status.set(&ctx.key, "Draining");
    let deadline = Duration::from_secs(ctx.config.worker_runtime);
    let drained = tokio::time::timeout(deadline, async {
        while let Some(joined) = workers.join_next().await {
            emit_report(&ctx, joined, &out).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(monitor = %ctx.key, "Worker runtime exceeded on drain; aborting");
        workers.abort_all();
    }
    ctx.status.set(&ctx.key, "Stopped");
}

async fn emit_report(
    ctx: &RunContext,
    joined: std::result::Result<anyhow::Result<QanReport>, tokio::task::JoinError>,
    out: &mpsc::Sender<SampleEnvelope>,
) {
    let report = match joined {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            tracing::warn!(monitor = %ctx.key, error = %e, "Interval parse failed");
            ctx.status.set(&ctx.key, format!("Error: {e}"));
            return;
        }
        Err(e) => {
            tracing::warn!(monitor = %ctx.key, error = %e, "Parse worker crashed");
            return;
        }
    };
    let payload = match serde_json::to_value(&report) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(monitor = %ctx.key, error = %e, "Report serialization failed");
            return;
        }
    };
    let envelope = SampleEnvelope {
        created_ts: report.end_ts,
        hostname: ctx.hostname.clone(),
        service: "qan".to_string(),
        instance_uuid: ctx.config.uuid.clone(),
        payload,
    };
    match out.send_timeout(envelope, SAMPLE_SEND_TIMEOUT).await {
        Ok(()) => {}
        Err(SendTimeoutError::Timeout(_)) => {
            tracing::warn!(monitor = %ctx.key, "Lost sample; downstream slow");
        }
        Err(SendTimeoutError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn qan_config(dir: &TempDir, max_workers: usize) -> MonitorConfig {
        MonitorConfig::decode(&json!({
            "uuid": "db-1",
            "collect": 60,
            "slow_log": dir.path().join("slow.log"),
            "max_workers": max_workers,
            "worker_runtime": 2,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn tick_produces_one_report() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("slow.log"), "SELECT 1;\nSELECT 2;\n").unwrap();
        let mut monitor = QanMonitor::new(
            qan_config(&dir, 2),
            "host-a".to_string(),
            StatusRegistry::new(),
            Arc::new(slowlog::EventCountParser),
        )
        .unwrap();

        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        monitor.start(tick_rx, out_tx).await.unwrap();

        tick_tx.send(Utc::now()).await.unwrap();
        let env = out_rx.recv().await.unwrap();
        assert_eq!(env.service, "qan");
        assert_eq!(env.instance_uuid, "db-1");
        assert_eq!(env.payload["event_count"], 2);

        monitor.stop().await.unwrap();
    }

    struct StallingParser(Duration);

    impl SlowLogParser for StallingParser {
        fn parse(&self, interval: &slowlog::Interval) -> anyhow::Result<QanReport> {
            std::thread::sleep(self.0);
            Ok(QanReport {
                interval: interval.number,
                start_ts: interval.start_ts,
                end_ts: interval.end_ts,
                start_offset: interval.start_offset,
                end_offset: interval.end_offset,
                event_count: 0,
                classes: HashMap::new(),
            })
        }
    }

    #[tokio::test]
    async fn exhausted_workers_drop_interval() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("slow.log"), "SELECT 1;\n").unwrap();
        let mut monitor = QanMonitor::new(
            qan_config(&dir, 1),
            "host-a".to_string(),
            StatusRegistry::new(),
            Arc::new(StallingParser(Duration::from_millis(400))),
        )
        .unwrap();

        let (tick_tx, tick_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        monitor.start(tick_rx, out_tx).await.unwrap();

        // Three rapid ticks against a single slow worker: only the first
        // interval is parsed, the rest are dropped without blocking.
        let t0 = Utc::now();
        for i in 0..3 {
            tick_tx.send(t0 + chrono::Duration::seconds(i)).await.unwrap();
        }
        let first = out_rx.recv().await.unwrap();
        assert_eq!(first.payload["interval"], 1);

        monitor.stop().await.unwrap();
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_drains_in_flight_worker() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("slow.log"), "SELECT 1;\n").unwrap();
        let status = StatusRegistry::new();
        let mut monitor = QanMonitor::new(
            qan_config(&dir, 2),
            "host-a".to_string(),
            status.clone(),
            Arc::new(StallingParser(Duration::from_millis(150))),
        )
        .unwrap();

        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        monitor.start(tick_rx, out_tx).await.unwrap();
        tick_tx.send(Utc::now()).await.unwrap();

        // Stop while the worker is still parsing; the report must still
        // arrive because drain waits up to worker_runtime.
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.stop().await.unwrap();
        assert!(out_rx.recv().await.is_some());
        assert_eq!(status.get("qan-db-1").as_deref(), Some("Stopped"));
    }

    #[tokio::test]
    async fn missing_slow_log_config_rejected() {
        let cfg = MonitorConfig::decode(&json!({"uuid": "db-1"})).unwrap();
        let err = QanMonitor::new(
            cfg,
            "h".to_string(),
            StatusRegistry::new(),
            Arc::new(slowlog::EventCountParser),
        )
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, AgentError::ConfigInvalid(_)));
    }
}
