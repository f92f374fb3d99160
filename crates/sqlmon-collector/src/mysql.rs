//! Database-metrics monitor.
//!
//! Opens a fresh connection on every tick (two attempts), samples
//! `SHOW GLOBAL STATUS` and `SHOW GLOBAL VARIABLES`, keeps the configured
//! subset and emits one envelope. Connection failures go to status and a
//! warn log, never to a command reply.

use crate::{Metric, MetricKind, Sampler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::mysql::MySqlConnection;
use sqlx::{Connection, Row};
use std::time::Duration;

/// Status variables that are point-in-time values rather than
/// monotonically increasing counters.
const GAUGE_VARIABLES: &[&str] = &[
    "threads_connected",
    "threads_running",
    "threads_cached",
    "open_tables",
    "open_files",
    "open_streams",
    "slave_running",
    "innodb_page_size",
    "innodb_buffer_pool_pages_free",
    "innodb_buffer_pool_pages_total",
    "qcache_free_blocks",
    "qcache_free_memory",
    "qcache_queries_in_cache",
    "qcache_total_blocks",
];

pub struct MySqlSampler {
    dsn: String,
    /// Lower-cased subset filter; empty collects everything numeric.
    subset: Vec<String>,
}

impl MySqlSampler {
    pub fn new(dsn: String, subset: Vec<String>) -> Self {
        let subset = subset.into_iter().map(|s| s.to_lowercase()).collect();
        Self { dsn, subset }
    }

    fn wanted(&self, name: &str) -> bool {
        self.subset.is_empty() || self.subset.iter().any(|s| s == name)
    }
}

/// Classifies a status variable and parses its value; `None` for
/// non-numeric variables outside the ON/OFF convention.
pub fn status_metric(name: &str, value: &str) -> Option<Metric> {
    let name = name.to_lowercase();
    let value: f64 = match value {
        "ON" | "Yes" => 1.0,
        "OFF" | "No" => 0.0,
        v => v.parse().ok()?,
    };
    let kind = if GAUGE_VARIABLES.contains(&name.as_str()) {
        MetricKind::Gauge
    } else {
        MetricKind::Counter
    };
    Some(Metric {
        name: format!("mysql.{name}"),
        kind,
        value,
    })
}

/// Server variables are point-in-time settings, always gauges; `None`
/// for non-numeric values outside the ON/OFF convention.
pub fn variable_metric(name: &str, value: &str) -> Option<Metric> {
    let name = name.to_lowercase();
    let value: f64 = match value {
        "ON" | "Yes" => 1.0,
        "OFF" | "No" => 0.0,
        v => v.parse().ok()?,
    };
    Some(Metric {
        name: format!("mysql.{name}"),
        kind: MetricKind::Gauge,
        value,
    })
}

pub async fn connect_with_retry(dsn: &str, attempts: u32) -> sqlx::Result<MySqlConnection> {
    let mut last = None;
    for attempt in 1..=attempts {
        match MySqlConnection::connect(dsn).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                if attempt < attempts {
                    tracing::debug!(attempt, error = %e, "Connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                last = Some(e);
            }
        }
    }
    Err(last.expect("at least one connect attempt"))
}

#[async_trait]
impl Sampler for MySqlSampler {
    async fn sample(&mut self, _tick: DateTime<Utc>) -> anyhow::Result<Option<serde_json::Value>> {
        let mut conn = connect_with_retry(&self.dsn, 2).await?;
        let rows = sqlx::query("SHOW GLOBAL STATUS").fetch_all(&mut conn).await?;

        let mut metrics = Vec::new();
        for row in rows {
            let name: String = row.try_get(0)?;
            let value: String = row.try_get(1)?;
            if !self.wanted(&name.to_lowercase()) {
                continue;
            }
            if let Some(metric) = status_metric(&name, &value) {
                metrics.push(metric);
            }
        }

        let rows = sqlx::query("SHOW GLOBAL VARIABLES").fetch_all(&mut conn).await?;
        for row in rows {
            let name: String = row.try_get(0)?;
            let value: String = row.try_get(1)?;
            if !self.wanted(&name.to_lowercase()) {
                continue;
            }
            if let Some(metric) = variable_metric(&name, &value) {
                metrics.push(metric);
            }
        }
        conn.close().await.ok();

        Ok(Some(json!({ "metrics": metrics })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_classified() {
        let m = status_metric("Questions", "123456").unwrap();
        assert_eq!(m.kind, MetricKind::Counter);
        assert_eq!(m.name, "mysql.questions");
        assert_eq!(m.value, 123456.0);

        let m = status_metric("Threads_connected", "17").unwrap();
        assert_eq!(m.kind, MetricKind::Gauge);
    }

    #[test]
    fn on_off_values_mapped() {
        assert_eq!(status_metric("Slave_running", "ON").unwrap().value, 1.0);
        assert_eq!(status_metric("Slave_running", "OFF").unwrap().value, 0.0);
    }

    #[test]
    fn variables_always_gauges() {
        let m = variable_metric("Max_connections", "151").unwrap();
        assert_eq!(m.kind, MetricKind::Gauge);
        assert_eq!(m.name, "mysql.max_connections");
        assert_eq!(m.value, 151.0);
        // Version strings and the like are skipped.
        assert!(variable_metric("version", "8.0.36").is_none());
    }

    #[test]
    fn non_numeric_values_skipped() {
        assert!(status_metric("Ssl_cipher", "DHE-RSA-AES256-SHA").is_none());
    }

    #[test]
    fn subset_filter() {
        let sampler = MySqlSampler::new(
            "mysql://u@localhost/".to_string(),
            vec!["Questions".to_string()],
        );
        assert!(sampler.wanted("questions"));
        assert!(!sampler.wanted("uptime"));

        let all = MySqlSampler::new("mysql://u@localhost/".to_string(), Vec::new());
        assert!(all.wanted("anything"));
    }
}
