//! Readers for the kernel-exposed text files the OS monitor samples.
//!
//! The root is a parameter so tests can point the reader at fixture files;
//! production uses `/proc`.

use crate::{Metric, MetricKind};
use std::io;
use std::path::PathBuf;

/// Device name prefixes excluded from disk metrics (pseudo devices that
/// only add noise).
const NOISE_PREFIXES: &[&str] = &["ram", "loop"];

/// Aggregate CPU jiffies from the `cpu ` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// Per-state percentages over the interval `prev..cur`. Returns an empty
    /// vec when the counters did not advance (sub-jiffy interval or counter
    /// reset).
    pub fn percentages(prev: &CpuTimes, cur: &CpuTimes) -> Vec<Metric> {
        let total = cur.total().saturating_sub(prev.total());
        if total == 0 {
            return Vec::new();
        }
        let pct = |state: &str, p: u64, c: u64| {
            Metric::gauge(
                format!("cpu.{state}"),
                c.saturating_sub(p) as f64 * 100.0 / total as f64,
            )
        };
        vec![
            pct("user", prev.user, cur.user),
            pct("nice", prev.nice, cur.nice),
            pct("system", prev.system, cur.system),
            pct("idle", prev.idle, cur.idle),
            pct("iowait", prev.iowait, cur.iowait),
            pct("irq", prev.irq, cur.irq),
            pct("softirq", prev.softirq, cur.softirq),
            pct("steal", prev.steal, cur.steal),
        ]
    }
}

pub struct ProcReader {
    root: PathBuf,
}

impl ProcReader {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn read(&self, rel: &str) -> io::Result<String> {
        std::fs::read_to_string(self.root.join(rel))
    }

    /// Aggregate CPU counters from `stat`.
    pub fn cpu_times(&self) -> io::Result<CpuTimes> {
        let content = self.read("stat")?;
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() != Some("cpu") {
                continue;
            }
            let mut next = || fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            return Ok(CpuTimes {
                user: next(),
                nice: next(),
                system: next(),
                idle: next(),
                iowait: next(),
                irq: next(),
                softirq: next(),
                steal: next(),
            });
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no aggregate cpu line in stat",
        ))
    }

    /// Context-switch and fork counters from `stat`.
    pub fn stat_counters(&self) -> io::Result<Vec<Metric>> {
        let content = self.read("stat")?;
        let mut metrics = Vec::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("ctxt") => {
                    if let Some(v) = fields.next().and_then(|v| v.parse().ok()) {
                        metrics.push(Metric::counter("stat.context_switches", v));
                    }
                }
                Some("processes") => {
                    if let Some(v) = fields.next().and_then(|v| v.parse().ok()) {
                        metrics.push(Metric::counter("stat.forks", v));
                    }
                }
                _ => {}
            }
        }
        Ok(metrics)
    }

    /// `meminfo` values, converted from kB to bytes.
    pub fn meminfo(&self) -> io::Result<Vec<Metric>> {
        let content = self.read("meminfo")?;
        let mut metrics = Vec::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let Some(name) = fields.next() else { continue };
            let Some(value) = fields.next().and_then(|v| v.parse::<f64>().ok()) else {
                continue;
            };
            let bytes = match fields.next() {
                Some("kB") => value * 1024.0,
                _ => value,
            };
            let name = name.trim_end_matches(':').to_lowercase();
            metrics.push(Metric::gauge(format!("memory.{name}"), bytes));
        }
        Ok(metrics)
    }

    /// Load averages from `loadavg`.
    pub fn loadavg(&self) -> io::Result<Vec<Metric>> {
        let content = self.read("loadavg")?;
        let mut fields = content.split_whitespace();
        let mut metrics = Vec::new();
        for name in ["loadavg.1m", "loadavg.5m", "loadavg.15m"] {
            if let Some(v) = fields.next().and_then(|v| v.parse().ok()) {
                metrics.push(Metric::gauge(name, v));
            }
        }
        Ok(metrics)
    }

    /// Per-device IO counters from `diskstats`, noise devices excluded.
    pub fn diskstats(&self) -> io::Result<Vec<Metric>> {
        let content = self.read("diskstats")?;
        let mut metrics = Vec::new();
        for line in content.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // major minor device reads ... (field layout per proc(5))
            if fields.len() < 14 {
                continue;
            }
            let device = fields[2];
            if NOISE_PREFIXES.iter().any(|p| device.starts_with(p)) {
                continue;
            }
            let counter = |idx: usize| fields[idx].parse::<f64>().ok();
            let pairs = [
                (3, "reads"),
                (5, "sectors_read"),
                (7, "writes"),
                (9, "sectors_written"),
            ];
            for (idx, name) in pairs {
                if let Some(v) = counter(idx) {
                    metrics.push(Metric::counter(format!("disk.{device}.{name}"), v));
                }
            }
        }
        Ok(metrics)
    }

    /// Per-interface byte/packet counters from `net/dev`.
    pub fn netdev(&self) -> io::Result<Vec<Metric>> {
        let content = self.read("net/dev")?;
        let mut metrics = Vec::new();
        for line in content.lines().skip(2) {
            let Some((iface, rest)) = line.split_once(':') else {
                continue;
            };
            let iface = iface.trim();
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            let pairs = [(0, "rx_bytes"), (1, "rx_packets"), (8, "tx_bytes"), (9, "tx_packets")];
            for (idx, name) in pairs {
                if let Ok(v) = fields[idx].parse::<f64>() {
                    metrics.push(Metric::counter(format!("net.{iface}.{name}"), v));
                }
            }
        }
        Ok(metrics)
    }
}

// Kind helper used in tests and by the payload shape.
impl Metric {
    pub fn is_counter(&self) -> bool {
        self.kind == MetricKind::Counter
    }
}

/// Writes a consistent set of procfs fixture files for monitor tests.
#[cfg(test)]
pub(crate) fn write_fixtures(root: &std::path::Path, cpu_jiffies: &[u64; 8]) {
    use std::fs;
    fs::create_dir_all(root.join("net")).unwrap();
    let c = cpu_jiffies;
    fs::write(
        root.join("stat"),
        format!(
            "cpu  {} {} {} {} {} {} {} {}\n\
             cpu0 1 2 3 4 5 6 7 8\n\
             ctxt 9876543\n\
             processes 4242\n",
            c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]
        ),
    )
    .unwrap();
    fs::write(
        root.join("meminfo"),
        "MemTotal:       16384 kB\nMemFree:         8192 kB\nCached:          4096 kB\n",
    )
    .unwrap();
    fs::write(root.join("loadavg"), "0.50 0.40 0.30 2/512 12345\n").unwrap();
    fs::write(
        root.join("diskstats"),
        "   8       0 sda 100 0 2000 50 200 0 4000 80 0 0 0 0 0 0\n\
            1       0 ram0 1 0 8 0 0 0 0 0 0 0 0 0 0 0\n\
           7       0 loop0 2 0 16 0 0 0 0 0 0 0 0 0 0 0\n",
    )
    .unwrap();
    fs::write(
        root.join("net/dev"),
        "Inter-|   Receive                                                |  Transmit\n \
         face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n \
           eth0: 1000 10 0 0 0 0 0 0 2000 20 0 0 0 0 0 0\n",
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cpu_percentages_sum_to_hundred() {
        let prev = CpuTimes {
            user: 100,
            nice: 0,
            system: 50,
            idle: 800,
            iowait: 50,
            irq: 0,
            softirq: 0,
            steal: 0,
        };
        let cur = CpuTimes {
            user: 150,
            nice: 0,
            system: 75,
            idle: 850,
            iowait: 75,
            irq: 0,
            softirq: 0,
            steal: 0,
        };
        let metrics = CpuTimes::percentages(&prev, &cur);
        let sum: f64 = metrics.iter().map(|m| m.value).sum();
        assert!((sum - 100.0).abs() < 1e-9);
        let user = metrics.iter().find(|m| m.name == "cpu.user").unwrap();
        assert!((user.value - 33.333).abs() < 0.01);
    }

    #[test]
    fn cpu_percentages_empty_when_counters_static() {
        let times = CpuTimes::default();
        assert!(CpuTimes::percentages(&times, &times).is_empty());
    }

    #[test]
    fn parses_fixture_files() {
        let dir = TempDir::new().unwrap();
        write_fixtures(dir.path(), &[100, 0, 50, 800, 50, 0, 0, 0]);
        let reader = ProcReader::new(dir.path().to_path_buf());

        let cpu = reader.cpu_times().unwrap();
        assert_eq!(cpu.user, 100);
        assert_eq!(cpu.idle, 800);

        let mem = reader.meminfo().unwrap();
        let total = mem.iter().find(|m| m.name == "memory.memtotal").unwrap();
        assert_eq!(total.value, 16384.0 * 1024.0);

        let load = reader.loadavg().unwrap();
        assert_eq!(load.len(), 3);
        assert_eq!(load[0].value, 0.50);

        let counters = reader.stat_counters().unwrap();
        assert!(counters.iter().all(|m| m.is_counter()));
    }

    #[test]
    fn noise_devices_excluded() {
        let dir = TempDir::new().unwrap();
        write_fixtures(dir.path(), &[1, 0, 0, 1, 0, 0, 0, 0]);
        let reader = ProcReader::new(dir.path().to_path_buf());
        let disks = reader.diskstats().unwrap();
        assert!(disks.iter().any(|m| m.name.starts_with("disk.sda.")));
        assert!(!disks.iter().any(|m| m.name.contains("ram0")));
        assert!(!disks.iter().any(|m| m.name.contains("loop0")));
    }

    #[test]
    fn netdev_counters() {
        let dir = TempDir::new().unwrap();
        write_fixtures(dir.path(), &[1, 0, 0, 1, 0, 0, 0, 0]);
        let reader = ProcReader::new(dir.path().to_path_buf());
        let net = reader.netdev().unwrap();
        let rx = net.iter().find(|m| m.name == "net.eth0.rx_bytes").unwrap();
        assert_eq!(rx.value, 1000.0);
        let tx = net.iter().find(|m| m.name == "net.eth0.tx_bytes").unwrap();
        assert_eq!(tx.value, 2000.0);
    }
}
