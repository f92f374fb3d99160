//! OS-metrics monitor.
//!
//! Samples kernel-exposed text files (stat, meminfo, loadavg, diskstats,
//! net/dev) into gauge/counter triples. CPU figures are per-state
//! percentages obtained by differencing the time-in-state counters against
//! the previous tick, so the first tick emits non-CPU metrics only.

pub mod procfs;

use crate::{Metric, Sampler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use procfs::{CpuTimes, ProcReader};
use serde_json::json;
use std::path::PathBuf;

pub struct OsSampler {
    reader: ProcReader,
    prev_cpu: Option<CpuTimes>,
}

impl OsSampler {
    pub fn new(root: PathBuf) -> Self {
        Self {
            reader: ProcReader::new(root),
            prev_cpu: None,
        }
    }
}

#[async_trait]
impl Sampler for OsSampler {
    async fn sample(&mut self, _tick: DateTime<Utc>) -> anyhow::Result<Option<serde_json::Value>> {
        let mut metrics: Vec<Metric> = Vec::new();

        // stat and meminfo must be readable; the rest are best-effort
        // (containers and stripped-down kernels omit some of these files).
        let cur = self.reader.cpu_times()?;
        metrics.extend(self.reader.meminfo()?);
        for result in [
            self.reader.loadavg(),
            self.reader.stat_counters(),
            self.reader.diskstats(),
            self.reader.netdev(),
        ] {
            match result {
                Ok(more) => metrics.extend(more),
                Err(e) => tracing::debug!(error = %e, "Skipping unavailable proc file"),
            }
        }

        if let Some(prev) = self.prev_cpu.take() {
            metrics.extend(CpuTimes::percentages(&prev, &cur));
        }
        self.prev_cpu = Some(cur);

        Ok(Some(json!({ "metrics": metrics })))
    }
}
