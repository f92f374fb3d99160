//! Slow-log interval bookkeeping and the parser contract.
//!
//! The monitor only cares about byte ranges: each tick closes the interval
//! `[last position, current length)` of the slow log. Positions are
//! monotonically non-decreasing within a single agent process; when the
//! file is rotated underneath us (length shrinks) the new file's positions
//! restart from 0. What the bytes mean is the parser's business.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// One closed slow-log interval, ready for a worker to parse.
#[derive(Debug, Clone)]
pub struct Interval {
    pub number: u64,
    pub path: PathBuf,
    pub start_offset: u64,
    pub end_offset: u64,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

/// Tracks the rotation boundary across ticks.
pub struct IntervalIter {
    path: PathBuf,
    pos: u64,
    last_ts: DateTime<Utc>,
    number: u64,
}

impl IntervalIter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            pos: 0,
            last_ts: Utc::now(),
            number: 0,
        }
    }

    /// Closes the current interval at `tick` and advances the boundary.
    pub fn next_interval(&mut self, tick: DateTime<Utc>) -> std::io::Result<Interval> {
        let len = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if len < self.pos {
            // File was rotated; restart from the beginning of the new file.
            self.pos = 0;
        }
        self.number += 1;
        let interval = Interval {
            number: self.number,
            path: self.path.clone(),
            start_offset: self.pos,
            end_offset: len,
            start_ts: self.last_ts,
            end_ts: tick,
        };
        self.pos = len;
        self.last_ts = tick;
        Ok(interval)
    }
}

/// Aggregated result of parsing one interval.
#[derive(Debug, Clone, Serialize)]
pub struct QanReport {
    pub interval: u64,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub start_offset: u64,
    pub end_offset: u64,
    pub event_count: u64,
    /// Query fingerprint → occurrence count.
    pub classes: HashMap<String, u64>,
}

/// Parses one closed interval into a report. Slow-log formats vary by
/// server flavor; concrete grammars live behind this seam.
pub trait SlowLogParser: Send + Sync + 'static {
    fn parse(&self, interval: &Interval) -> anyhow::Result<QanReport>;
}

/// Minimal parser: counts statements (non-comment lines terminated by `;`)
/// and buckets them by leading keyword.
pub struct EventCountParser;

impl SlowLogParser for EventCountParser {
    fn parse(&self, interval: &Interval) -> anyhow::Result<QanReport> {
        let mut classes: HashMap<String, u64> = HashMap::new();
        let mut event_count = 0u64;

        let span = interval.end_offset.saturating_sub(interval.start_offset);
        if span > 0 {
            let mut file = std::fs::File::open(&interval.path)?;
            file.seek(SeekFrom::Start(interval.start_offset))?;
            let mut buf = vec![0u8; span as usize];
            file.read_exact(&mut buf)?;
            let text = String::from_utf8_lossy(&buf);
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') || !line.ends_with(';') {
                    continue;
                }
                event_count += 1;
                let keyword = line
                    .split_whitespace()
                    .next()
                    .unwrap_or("unknown")
                    .to_uppercase();
                *classes.entry(keyword).or_insert(0) += 1;
            }
        }

        Ok(QanReport {
            interval: interval.number,
            start_ts: interval.start_ts,
            end_ts: interval.end_ts,
            start_offset: interval.start_offset,
            end_offset: interval.end_offset,
            event_count,
            classes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn offsets_monotonic_across_ticks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slow.log");
        std::fs::write(&path, "SELECT 1;\n").unwrap();

        let mut iter = IntervalIter::new(path.clone());
        let first = iter.next_interval(Utc::now()).unwrap();
        assert_eq!(first.start_offset, 0);
        assert_eq!(first.end_offset, 10);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "SELECT 2;").unwrap();
        let second = iter.next_interval(Utc::now()).unwrap();
        assert_eq!(second.start_offset, 10);
        assert!(second.end_offset > second.start_offset);
        assert_eq!(second.number, 2);
    }

    #[test]
    fn rotation_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slow.log");
        std::fs::write(&path, "SELECT 1;\nSELECT 2;\n").unwrap();

        let mut iter = IntervalIter::new(path.clone());
        iter.next_interval(Utc::now()).unwrap();

        // Rotate: the new file is shorter than the previous boundary.
        std::fs::write(&path, "SELECT 3;\n").unwrap();
        let interval = iter.next_interval(Utc::now()).unwrap();
        assert_eq!(interval.start_offset, 0);
        assert_eq!(interval.end_offset, 10);
    }

    #[test]
    fn missing_file_yields_empty_interval() {
        let dir = TempDir::new().unwrap();
        let mut iter = IntervalIter::new(dir.path().join("absent.log"));
        let interval = iter.next_interval(Utc::now()).unwrap();
        assert_eq!(interval.start_offset, 0);
        assert_eq!(interval.end_offset, 0);
    }

    #[test]
    fn event_count_parser_buckets_by_keyword() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slow.log");
        std::fs::write(
            &path,
            "# Time: 2026-08-30T10:00:00\nSELECT * FROM t1;\nselect 1;\nUPDATE t2 SET a = 1;\n",
        )
        .unwrap();

        let mut iter = IntervalIter::new(path);
        let interval = iter.next_interval(Utc::now()).unwrap();
        let report = EventCountParser.parse(&interval).unwrap();
        assert_eq!(report.event_count, 3);
        assert_eq!(report.classes["SELECT"], 2);
        assert_eq!(report.classes["UPDATE"], 1);
    }
}
