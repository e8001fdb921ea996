use crate::events::{OrderPlan, PlannedTrade};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Order-execution transport. The core only requires an idempotent-submit
/// contract: `idempotency_key` is derived from the metrics log entry id,
/// so a redelivered entry cannot double-submit.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn submit(&self, plan: &OrderPlan, idempotency_key: &str) -> Result<()>;
}

/// Append-only store of planned trades. No updates or deletes.
#[async_trait]
pub trait TradeLedger: Send + Sync {
    async fn append(&self, trade: &PlannedTrade) -> Result<()>;
    async fn read_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PlannedTrade>>;
}

/// Notification delivery seam; the transport behind it is external.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, title: &str, body: &str) -> Result<()>;
}

/// Alert sink that writes to the process log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlert;

#[async_trait]
impl AlertSink for LogAlert {
    async fn send(&self, title: &str, body: &str) -> Result<()> {
        tracing::error!(title, body, "alert");
        Ok(())
    }
}
