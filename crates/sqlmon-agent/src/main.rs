use clap::Parser;
use sqlmon_agent::config::{AgentConfig, Basedir, DEFAULT_BASEDIR};
use sqlmon_agent::pidfile::PidFile;
use sqlmon_agent::relay::{Relay, RelayLayer, RelaySettings};
use sqlmon_agent::service::{DataService, LogService, MonitorService, ServiceHandler};
use sqlmon_agent::spool::{spawn_sender, SpoolSettings, Spooler};
use sqlmon_agent::supervisor::Supervisor;
use sqlmon_agent::ticker::TickerManager;
use sqlmon_agent::transport::{TcpTransport, Transport, TransportConfig};
use sqlmon_collector::StockFactory;
use sqlmon_common::status::StatusRegistry;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const EXIT_BAD_CONFIG: u8 = 1;
const EXIT_PID_COLLISION: u8 = 2;
const EXIT_NO_LINK: u8 = 3;
const EXIT_SCAN_FAILED: u8 = 4;
const EXIT_FATAL: u8 = 5;

/// How long to wait for the first control-plane connection when offline
/// bootstrap is disabled.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "sqlmon-agent", version, about = "Database host monitoring agent")]
struct Cli {
    /// Agent state directory.
    #[arg(long, default_value = DEFAULT_BASEDIR)]
    basedir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let basedir = Basedir::new(&cli.basedir);
    if let Err(e) = basedir.init() {
        eprintln!("sqlmon-agent: cannot initialize {}: {e}", cli.basedir.display());
        return ExitCode::from(EXIT_BAD_CONFIG);
    }

    let config = match AgentConfig::load(&basedir.agent_conf()).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sqlmon-agent: {e}");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };

    let pid_path = config.pid_file.clone().unwrap_or_else(|| basedir.pid_file());
    let _pidfile = match PidFile::create(pid_path) {
        Ok(pidfile) => pidfile,
        Err(e) => {
            eprintln!("sqlmon-agent: {e}");
            return ExitCode::from(EXIT_PID_COLLISION);
        }
    };

    let transport: Arc<dyn Transport> = TcpTransport::spawn(TransportConfig {
        host: config.server_host.clone(),
        agent_uuid: config.agent_uuid.clone(),
        api_key: config.api_key.clone(),
        hostname: sqlmon_common::types::hostname(),
        version: sqlmon_agent::VERSION.to_string(),
    });

    let relay_settings = match RelaySettings::load(&basedir.log_conf()) {
        Ok(settings) => settings,
        Err(_) => RelaySettings {
            file: Some(config.log_file.clone().unwrap_or_else(|| basedir.log_file())),
            ..RelaySettings::default()
        },
    };
    let relay = Relay::spawn(relay_settings, transport.clone());
    let fatal_rx = relay.fatal_signal();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sqlmon=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .with(RelayLayer::new(relay.handle.clone()))
        .init();
    tracing::info!(version = %sqlmon_agent::VERSION, basedir = %cli.basedir.display(), "Agent starting");

    if !config.offline_bootstrap && !transport.wait_connected(CONNECT_DEADLINE).await {
        tracing::error!(host = %config.server_host, "No control-plane link and offline bootstrap is disabled");
        relay.stop().await;
        return ExitCode::from(EXIT_NO_LINK);
    }

    let status = StatusRegistry::new();
    let ticker = Arc::new(TickerManager::new());

    let spool_settings = SpoolSettings::load(&basedir.data_conf()).unwrap_or_default();
    let spool = match Spooler::open(basedir.spool_dir(), spool_settings) {
        Ok(spool) => spool,
        Err(e) => {
            tracing::error!(error = %e, "Cannot open spool directory");
            relay.stop().await;
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };
    let sender = spawn_sender(spool.clone(), transport.clone(), status.clone());

    // All monitors feed one channel; one writer owns the spool intake.
    let (sample_tx, mut sample_rx) = tokio::sync::mpsc::channel(256);
    let spool_writer = spool.clone();
    let writer = sqlmon_common::task::TaskHandle::spawn(move |mut stop| async move {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                envelope = sample_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Err(e) = spool_writer.write(&envelope) {
                        tracing::warn!(error = %e, "Sample not spooled");
                    }
                }
            }
        }
        // Monitors are already stopped; persist what they managed to queue.
        while let Ok(envelope) = sample_rx.try_recv() {
            let _ = spool_writer.write(&envelope);
        }
    });

    let hostname = sqlmon_common::types::hostname();
    let monitor_services: Vec<Arc<MonitorService>> = ["mm", "sysconfig", "qan"]
        .into_iter()
        .map(|service| {
            Arc::new(MonitorService::new(
                service,
                basedir.clone(),
                ticker.clone(),
                sample_tx.clone(),
                hostname.clone(),
                Box::new(StockFactory::new(service)),
                status.clone(),
            ))
        })
        .collect();

    for service in &monitor_services {
        match service.startup_scan(config.strict).await {
            Ok(started) if started > 0 => {
                tracing::info!(service = %service.service(), count = started, "Monitors restored");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(service = %service.service(), error = %e, "Startup scan failed");
                relay.stop().await;
                return ExitCode::from(EXIT_SCAN_FAILED);
            }
        }
    }

    let mut handlers: Vec<Arc<dyn ServiceHandler>> = monitor_services
        .iter()
        .map(|s| s.clone() as Arc<dyn ServiceHandler>)
        .collect();
    handlers.push(Arc::new(LogService::new(relay.handle.clone(), &basedir)));
    handlers.push(Arc::new(DataService::new(spool.clone(), status.clone(), &basedir)));

    let config_path = basedir.agent_conf();
    let supervisor = Supervisor::new(
        transport.clone(),
        handlers,
        ticker.clone(),
        status.clone(),
        config,
        config_path,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut fatal_watch = fatal_rx.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "Cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            _ = fatal_watch.changed() => tracing::error!("Fatal event relayed; shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    supervisor.run(shutdown_rx).await;

    tracing::info!("Agent stopping");
    for service in &monitor_services {
        service.stop_all().await;
    }
    writer.stop().await;
    sender.stop().await;
    transport.disconnect().await;
    relay.stop().await;
    if *fatal_rx.borrow() {
        return ExitCode::from(EXIT_FATAL);
    }
    ExitCode::SUCCESS
}
