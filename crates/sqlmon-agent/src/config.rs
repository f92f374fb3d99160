//! On-disk configuration.
//!
//! All config files are JSON objects under `<basedir>/config/`, written
//! atomically (write-temp-then-rename). The agent config is persisted once
//! at installation and mutated only via the `Update` command.

use serde::{Deserialize, Serialize};
use sqlmon_common::error::{AgentError, Result};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_BASEDIR: &str = "/var/lib/sqlmon";

fn default_keepalive() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Supervisor configuration, `<basedir>/config/agent.conf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_uuid: String,
    pub server_host: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// When false, failure to connect at startup is fatal (exit 3).
    #[serde(default = "default_true")]
    pub offline_bootstrap: bool,
    /// When true, a monitor failing its startup scan is fatal (exit 4).
    #[serde(default)]
    pub strict: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub links: HashMap<String, String>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| AgentError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("agent_uuid", &self.agent_uuid),
            ("server_host", &self.server_host),
            ("api_key", &self.api_key),
        ] {
            if value.is_empty() {
                return Err(AgentError::ConfigInvalid(format!("{field} is required")));
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        write_atomic(path, json.as_bytes())?;
        Ok(())
    }

    /// Applies an `Update` command: set fields present in the patch, leave
    /// the rest alone. The supervisor serializes calls.
    pub fn merge_update(&mut self, patch: &AgentUpdate) {
        if let Some(host) = &patch.server_host {
            self.server_host = host.clone();
        }
        if let Some(key) = &patch.api_key {
            self.api_key = key.clone();
        }
        if let Some(secs) = patch.keepalive_secs {
            self.keepalive_secs = secs;
        }
        if let Some(v) = patch.offline_bootstrap {
            self.offline_bootstrap = v;
        }
        if let Some(v) = patch.strict {
            self.strict = v;
        }
        if let Some(links) = &patch.links {
            self.links = links.clone();
        }
    }
}

/// Partial agent config carried by an `Update` command. Each field is
/// either absent (keep the current value) or present (overwrite).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentUpdate {
    pub server_host: Option<String>,
    pub api_key: Option<String>,
    pub keepalive_secs: Option<u64>,
    pub offline_bootstrap: Option<bool>,
    pub strict: Option<bool>,
    pub links: Option<HashMap<String, String>>,
}

/// The agent's directory tree. Initialized once at startup; read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct Basedir {
    root: PathBuf,
}

impl Basedir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the directory tree if missing.
    pub fn init(&self) -> io::Result<()> {
        for dir in [
            self.config_dir(),
            self.spool_dir(),
            self.log_dir(),
            self.run_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn agent_conf(&self) -> PathBuf {
        self.config_dir().join("agent.conf")
    }

    pub fn log_conf(&self) -> PathBuf {
        self.config_dir().join("log.conf")
    }

    pub fn data_conf(&self) -> PathBuf {
        self.config_dir().join("data.conf")
    }

    pub fn service_conf(&self, service: &str, uuid: &str) -> PathBuf {
        self.config_dir().join(format!("{service}-{uuid}.conf"))
    }

    pub fn instance_conf(&self, uuid: &str) -> PathBuf {
        self.config_dir().join(format!("instance-{uuid}.conf"))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.run_dir().join("agent.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("agent.log")
    }
}

/// Atomic file write: temp file in the same directory, then rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
