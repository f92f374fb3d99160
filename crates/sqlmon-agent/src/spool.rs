//! On-disk sample spooler.
//!
//! Every envelope is persisted as its own file under `<basedir>/data/`
//! before the send loop ever sees it, so samples survive restarts and
//! control-plane outages. File names are `<seq:020>-<service>`; the
//! zero-padded sequence number makes lexicographic directory order equal
//! write order, which is what preserves per-service FIFO. A byte quota
//! turns the directory into a ring: writes evict the oldest idle entry
//! until the new envelope fits.

use crate::config::write_atomic;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use sqlmon_common::error::{AgentError, Result};
use sqlmon_common::status::StatusRegistry;
use sqlmon_common::task::TaskHandle;
use sqlmon_common::types::SampleEnvelope;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

const BATCH_MAX_BYTES: u64 = 1024 * 1024;
const BATCH_MAX_COUNT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolSettings {
    /// Total bytes of spooled envelopes allowed on disk.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_max_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Default for SpoolSettings {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

impl SpoolSettings {
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

#[derive(Debug, Clone)]
struct Entry {
    service: String,
    bytes: u64,
    in_flight: bool,
}

#[derive(Default)]
struct SpoolIndex {
    next_seq: u64,
    entries: BTreeMap<u64, Entry>,
    total_bytes: u64,
}

pub struct Spooler {
    dir: PathBuf,
    settings: RwLock<SpoolSettings>,
    index: Mutex<SpoolIndex>,
    notify: Notify,
}

impl Spooler {
    /// Opens the spool directory and rebuilds the index from whatever
    /// files a previous run left behind.
    pub fn open(dir: impl Into<PathBuf>, settings: SpoolSettings) -> Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut index = SpoolIndex {
            next_seq: 1,
            ..Default::default()
        };
        for dirent in std::fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            let Some((seq_str, service)) = name.split_once('-') else {
                continue;
            };
            let Ok(seq) = seq_str.parse::<u64>() else {
                tracing::warn!(file = %name, "Unrecognized spool file; ignoring");
                continue;
            };
            let bytes = dirent.metadata()?.len();
            index.total_bytes += bytes;
            index.next_seq = index.next_seq.max(seq + 1);
            index.entries.insert(
                seq,
                Entry {
                    service: service.to_string(),
                    bytes,
                    in_flight: false,
                },
            );
        }
        if !index.entries.is_empty() {
            tracing::info!(
                count = index.entries.len(),
                bytes = index.total_bytes,
                "Recovered spooled samples"
            );
        }
        Ok(Arc::new(Self {
            dir,
            settings: RwLock::new(settings),
            index: Mutex::new(index),
            notify: Notify::new(),
        }))
    }

    pub fn settings(&self) -> SpoolSettings {
        self.settings.read().expect("spool settings poisoned").clone()
    }

    pub fn reconfigure(&self, settings: SpoolSettings) {
        *self.settings.write().expect("spool settings poisoned") = settings;
    }

    pub fn len(&self) -> usize {
        self.index.lock().expect("spool index poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        self.index.lock().expect("spool index poisoned").total_bytes
    }

    fn path_for(&self, seq: u64, service: &str) -> PathBuf {
        self.dir.join(format!("{seq:020}-{service}"))
    }

    /// Persists one envelope, evicting the oldest idle entries until it
    /// fits under the byte quota.
    pub fn write(&self, envelope: &SampleEnvelope) -> Result<u64> {
        let raw = serde_json::to_vec(envelope)?;
        let quota = self.settings().max_bytes;
        let mut index = self.index.lock().expect("spool index poisoned");

        while index.total_bytes + raw.len() as u64 > quota {
            let victim = index
                .entries
                .iter()
                .find(|(_, e)| !e.in_flight)
                .map(|(seq, e)| (*seq, e.clone()));
            let Some((seq, entry)) = victim else { break };
            let _ = std::fs::remove_file(self.path_for(seq, &entry.service));
            index.entries.remove(&seq);
            index.total_bytes -= entry.bytes;
            tracing::warn!(seq, service = %entry.service, "Spool quota reached; evicting oldest");
        }

        let seq = index.next_seq;
        index.next_seq += 1;
        let path = self.path_for(seq, &envelope.service);
        std::fs::write(&path, &raw)?;
        index.entries.insert(
            seq,
            Entry {
                service: envelope.service.clone(),
                bytes: raw.len() as u64,
                in_flight: false,
            },
        );
        index.total_bytes += raw.len() as u64;
        drop(index);
        self.notify.notify_one();
        Ok(seq)
    }

    /// Oldest idle entries up to the batch limits, marked in flight.
    /// Unreadable files are dropped from the spool with a warning.
    pub fn next_batch(&self) -> Vec<(u64, SampleEnvelope)> {
        let mut index = self.index.lock().expect("spool index poisoned");
        let mut batch = Vec::new();
        let mut bytes = 0u64;
        let mut picked = Vec::new();
        let mut broken = Vec::new();
        for (&seq, entry) in index.entries.iter() {
            if entry.in_flight {
                continue;
            }
            if batch.len() >= BATCH_MAX_COUNT || bytes + entry.bytes > BATCH_MAX_BYTES {
                break;
            }
            let path = self.path_for(seq, &entry.service);
            let envelope = std::fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_json::from_slice::<SampleEnvelope>(&raw)?));
            match envelope {
                Ok(envelope) => {
                    bytes += entry.bytes;
                    picked.push(seq);
                    batch.push((seq, envelope));
                }
                Err(e) => {
                    tracing::warn!(seq, error = %e, "Unreadable spool entry; discarding");
                    broken.push(seq);
                }
            }
        }
        for seq in picked {
            if let Some(entry) = index.entries.get_mut(&seq) {
                entry.in_flight = true;
            }
        }
        for seq in broken {
            if let Some(entry) = index.entries.remove(&seq) {
                index.total_bytes -= entry.bytes;
                let _ = std::fs::remove_file(self.path_for(seq, &entry.service));
            }
        }
        batch
    }

    /// Deletes acknowledged entries.
    pub fn ack(&self, seqs: &[u64]) {
        let mut index = self.index.lock().expect("spool index poisoned");
        for &seq in seqs {
            if let Some(entry) = index.entries.remove(&seq) {
                index.total_bytes -= entry.bytes;
                let _ = std::fs::remove_file(self.path_for(seq, &entry.service));
            }
        }
    }

    /// Returns in-flight entries to the idle pool after a failed send.
    pub fn requeue(&self, seqs: &[u64]) {
        let mut index = self.index.lock().expect("spool index poisoned");
        for &seq in seqs {
            if let Some(entry) = index.entries.get_mut(&seq) {
                entry.in_flight = false;
            }
        }
        drop(index);
        self.notify.notify_one();
    }

    async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}

/// Drives batches from the spool to the control plane. One batch in
/// flight at a time; failure requeues everything and backs off.
pub fn spawn_sender(
    spool: Arc<Spooler>,
    transport: Arc<dyn Transport>,
    status: StatusRegistry,
) -> TaskHandle {
    TaskHandle::spawn(move |mut stop| async move {
        let mut backoff =
            crate::transport::Backoff::new(Duration::from_secs(1), Duration::from_secs(300));
        status.set("data", "Idle");
        loop {
            let batch = spool.next_batch();
            if batch.is_empty() {
                status.set("data", "Idle");
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = spool.wait_for_work() => continue,
                }
            }

            status.set("data", format!("Sending ({} queued)", spool.len()));
            let seqs: Vec<u64> = batch.iter().map(|(seq, _)| *seq).collect();
            let envelopes: Vec<SampleEnvelope> =
                batch.into_iter().map(|(_, envelope)| envelope).collect();
            match transport.report_samples(&envelopes).await {
                Ok(()) => {
                    spool.ack(&seqs);
                    backoff.reset();
                }
                Err(e) => {
                    tracing::warn!(error = %e, count = seqs.len(), "Batch send failed; will retry");
                    spool.requeue(&seqs);
                    let delay = backoff.next_delay();
                    status.set("data", format!("Backoff ({} queued)", spool.len()));
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
        }
        status.set("data", "Stopped");
    })
}
