//! Database-configuration monitor.
//!
//! On each (typically hourly, unsynchronized) tick, snapshots
//! `SHOW GLOBAL VARIABLES` into a list of `{variable, value}` pairs.

use crate::mysql::connect_with_retry;
use crate::Sampler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::{Connection, Row};

#[derive(Debug, Clone, Serialize)]
pub struct VariableSetting {
    pub variable: String,
    pub value: String,
}

pub struct SysconfigSampler {
    dsn: String,
}

impl SysconfigSampler {
    pub fn new(dsn: String) -> Self {
        Self { dsn }
    }
}

#[async_trait]
impl Sampler for SysconfigSampler {
    async fn sample(&mut self, _tick: DateTime<Utc>) -> anyhow::Result<Option<serde_json::Value>> {
        let mut conn = connect_with_retry(&self.dsn, 2).await?;
        let rows = sqlx::query("SHOW GLOBAL VARIABLES")
            .fetch_all(&mut conn)
            .await?;

        let mut settings = Vec::with_capacity(rows.len());
        for row in rows {
            settings.push(VariableSetting {
                variable: row.try_get(0)?,
                value: row.try_get(1)?,
            });
        }
        conn.close().await.ok();

        Ok(Some(json!({ "settings": settings })))
    }
}
