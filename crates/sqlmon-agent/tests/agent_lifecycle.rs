//! End-to-end command handling against a fully wired agent with an
//! in-memory transport standing in for the control plane.

use async_trait::async_trait;
use chrono::Utc;
use sqlmon_agent::config::Basedir;
use sqlmon_agent::service::{DataService, LogService, MonitorService, ServiceHandler};
use sqlmon_agent::spool::{spawn_sender, SpoolSettings, Spooler};
use sqlmon_agent::supervisor::Supervisor;
use sqlmon_agent::ticker::TickerManager;
use sqlmon_agent::transport::{LinkStatus, Transport, TransportError};
use sqlmon_collector::StockFactory;
use sqlmon_common::status::StatusRegistry;
use sqlmon_common::types::{Command, LogEvent, Reply, SampleEnvelope};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

struct TestTransport {
    cmd_rx: tokio::sync::Mutex<mpsc::Receiver<Command>>,
    replies: Mutex<Vec<Reply>>,
    batches: Mutex<Vec<SampleEnvelope>>,
}

#[async_trait]
impl Transport for TestTransport {
    fn send_reply(&self, reply: &Reply) -> Result<(), TransportError> {
        self.replies.lock().unwrap().push(reply.clone());
        Ok(())
    }

    fn send_log(&self, _event: &LogEvent) -> Result<(), TransportError> {
        Ok(())
    }

    fn send_ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn report_samples(&self, envelopes: &[SampleEnvelope]) -> Result<(), TransportError> {
        self.batches.lock().unwrap().extend_from_slice(envelopes);
        Ok(())
    }

    async fn recv_command(&self) -> Option<Command> {
        self.cmd_rx.lock().await.recv().await
    }

    fn status(&self) -> LinkStatus {
        LinkStatus::Connected
    }

    async fn wait_connected(&self, _timeout: Duration) -> bool {
        true
    }

    async fn disconnect(&self) {}
}

struct Harness {
    transport: Arc<TestTransport>,
    cmd_tx: mpsc::Sender<Command>,
    services: Vec<Arc<MonitorService>>,
    run: tokio::task::JoinHandle<()>,
    _shutdown: watch::Sender<bool>,
    // Held for the harness lifetime; dropping either handle would stop
    // its background loop mid-test.
    _sender: sqlmon_common::task::TaskHandle,
    _relay: sqlmon_agent::relay::Relay,
    dir: TempDir,
}

impl Harness {
    async fn spawn() -> Self {
        let dir = TempDir::new().unwrap();
        let basedir = Basedir::new(dir.path());
        basedir.init().unwrap();

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let transport = Arc::new(TestTransport {
            cmd_rx: tokio::sync::Mutex::new(cmd_rx),
            replies: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        });

        let status = StatusRegistry::new();
        let ticker = Arc::new(TickerManager::new());
        let spool = Spooler::open(basedir.spool_dir(), SpoolSettings::default()).unwrap();
        let sender = spawn_sender(spool.clone(), transport.clone(), status.clone());

        let (sample_tx, mut sample_rx) = mpsc::channel(64);
        let spool_writer = spool.clone();
        tokio::spawn(async move {
            while let Some(envelope) = sample_rx.recv().await {
                let _ = spool_writer.write(&envelope);
            }
        });

        let services: Vec<Arc<MonitorService>> = ["mm", "sysconfig", "qan"]
            .into_iter()
            .map(|service| {
                Arc::new(MonitorService::new(
                    service,
                    basedir.clone(),
                    ticker.clone(),
                    sample_tx.clone(),
                    "host-a".to_string(),
                    Box::new(StockFactory::new(service)),
                    status.clone(),
                ))
            })
            .collect();

        let mut handlers: Vec<Arc<dyn ServiceHandler>> = services
            .iter()
            .map(|s| s.clone() as Arc<dyn ServiceHandler>)
            .collect();
        let relay = sqlmon_agent::relay::Relay::spawn(
            sqlmon_agent::relay::RelaySettings::default(),
            transport.clone(),
        );
        handlers.push(Arc::new(LogService::new(relay.handle.clone(), &basedir)));
        handlers.push(Arc::new(DataService::new(spool.clone(), status.clone(), &basedir)));

        let config = sqlmon_agent::config::AgentConfig {
            agent_uuid: "agent-1".to_string(),
            server_host: "cp.example.com:9443".to_string(),
            api_key: "secret".to_string(),
            pid_file: None,
            log_file: None,
            keepalive_secs: 60,
            offline_bootstrap: true,
            strict: false,
            links: HashMap::new(),
        };
        let supervisor = Supervisor::new(
            transport.clone(),
            handlers,
            ticker,
            status,
            config,
            basedir.agent_conf(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_sup = supervisor.clone();
        let run = tokio::spawn(async move {
            run_sup.run(shutdown_rx).await;
        });

        Self {
            transport,
            cmd_tx,
            services,
            run,
            _shutdown: shutdown_tx,
            _sender: sender,
            _relay: relay,
            dir,
        }
    }

    fn command(&self, tool: &str, verb: &str, payload: serde_json::Value) -> Command {
        Command {
            id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            user: "test".to_string(),
            tool: tool.to_string(),
            verb: verb.to_string(),
            payload,
        }
    }

    /// Sends one command and waits for its reply.
    async fn roundtrip(&self, tool: &str, verb: &str, payload: serde_json::Value) -> Reply {
        let cmd = self.command(tool, verb, payload);
        let id = cmd.id.clone();
        self.cmd_tx.send(cmd).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(reply) = self
                    .transport
                    .replies
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|r| r.id == id)
                    .cloned()
                {
                    return reply;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no reply within deadline")
    }

    /// Minimal procfs fixture for an OS monitor.
    fn proc_root(&self) -> PathBuf {
        let root = self.dir.path().join("proc");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join("stat"),
            "cpu  100 0 50 850 0 0 0 0\nctxt 1000\nprocesses 42\n",
        )
        .unwrap();
        std::fs::write(root.join("meminfo"), "MemTotal: 16384 kB\n").unwrap();
        root
    }

    async fn stop(self) {
        for service in &self.services {
            service.stop_all().await;
        }
        self.run.abort();
    }
}

#[tokio::test]
async fn ping_and_version() {
    let agent = Harness::spawn().await;

    let reply = agent.roundtrip("agent", "Ping", serde_json::Value::Null).await;
    assert!(reply.is_ok());
    assert_eq!(reply.payload, serde_json::json!("pong"));

    let reply = agent.roundtrip("agent", "Version", serde_json::Value::Null).await;
    assert_eq!(reply.payload["version"], sqlmon_agent::VERSION);

    agent.stop().await;
}

#[tokio::test]
async fn unknown_verb_is_echoed() {
    let agent = Harness::spawn().await;
    let reply = agent.roundtrip("mm", "Pontificate", serde_json::Value::Null).await;
    assert_eq!(reply.error, "Unknown command: Pontificate");
    agent.stop().await;
}

#[tokio::test]
async fn os_monitor_lifecycle_ships_samples() {
    let agent = Harness::spawn().await;
    let payload = serde_json::json!({
        "uuid": "os-1",
        "collect": 1,
        "proc_root": agent.proc_root(),
    });

    let reply = agent.roundtrip("mm", "Start", payload).await;
    assert!(reply.is_ok(), "start failed: {}", reply.error);
    assert!(agent.dir.path().join("config").join("mm-os-1.conf").exists());

    // A sample reaches the control plane within a few collect periods.
    let envelope = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(envelope) = agent.transport.batches.lock().unwrap().first().cloned() {
                return envelope;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no sample shipped");
    assert_eq!(envelope.service, "mm");
    assert_eq!(envelope.instance_uuid, "os-1");
    assert_eq!(envelope.hostname, "host-a");

    let reply = agent.roundtrip("mm", "Stop", serde_json::json!({"uuid": "os-1"})).await;
    assert!(reply.is_ok());
    assert!(!agent.dir.path().join("config").join("mm-os-1.conf").exists());

    // Stopping again reports the same error every time.
    let reply = agent.roundtrip("mm", "Stop", serde_json::json!({"uuid": "os-1"})).await;
    assert_eq!(reply.error, "Service not running: mm-os-1");

    agent.stop().await;
}

#[tokio::test]
async fn status_report_covers_services_and_history() {
    let agent = Harness::spawn().await;
    agent.roundtrip("agent", "Ping", serde_json::Value::Null).await;

    let reply = agent.roundtrip("agent", "Status", serde_json::Value::Null).await;
    assert!(reply.is_ok());
    let report = reply.payload.as_str().unwrap();
    assert!(report.contains("sqlmon-agent"));
    assert!(report.contains("Service mm:"));
    assert!(report.contains("Service data:"));
    assert!(report.contains("agent.Ping: ok"));

    agent.stop().await;
}

#[tokio::test]
async fn stop_agent_ends_the_command_loop() {
    let agent = Harness::spawn().await;

    let reply = agent.roundtrip("agent", "Stop", serde_json::Value::Null).await;
    assert!(reply.is_ok());

    // The run task exits on its own after replying.
    tokio::time::timeout(Duration::from_secs(5), agent.run)
        .await
        .expect("command loop did not exit")
        .unwrap();
}

#[tokio::test]
async fn log_and_data_config_roundtrip() {
    let agent = Harness::spawn().await;

    let reply = agent
        .roundtrip("log", "SetConfig", serde_json::json!({"level": "debug"}))
        .await;
    assert!(reply.is_ok());
    let reply = agent.roundtrip("log", "GetConfig", serde_json::Value::Null).await;
    assert_eq!(reply.payload["level"], "debug");
    assert!(agent.dir.path().join("config").join("log.conf").exists());

    let reply = agent
        .roundtrip("data", "SetConfig", serde_json::json!({"max_bytes": 4096}))
        .await;
    assert!(reply.is_ok());
    let reply = agent.roundtrip("data", "GetConfig", serde_json::Value::Null).await;
    assert_eq!(reply.payload["max_bytes"], 4096);

    agent.stop().await;
}
