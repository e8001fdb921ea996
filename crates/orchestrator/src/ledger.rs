use anyhow::Result;
use async_trait::async_trait;
use capflow_core::events::{PlannedTrade, Side};
use capflow_core::traits::TradeLedger;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::sync::Mutex;

/// In-process append-only ledger for tests and backtests.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    rows: Mutex<Vec<PlannedTrade>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rows(&self) -> Vec<PlannedTrade> {
        self.rows.lock().expect("ledger lock poisoned").clone()
    }
}

#[async_trait]
impl TradeLedger for MemoryLedger {
    async fn append(&self, trade: &PlannedTrade) -> Result<()> {
        self.rows
            .lock()
            .expect("ledger lock poisoned")
            .push(trade.clone());
        Ok(())
    }

    async fn read_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PlannedTrade>> {
        Ok(self
            .rows
            .lock()
            .expect("ledger lock poisoned")
            .iter()
            .filter(|t| t.ts >= from && t.ts < to)
            .cloned()
            .collect())
    }
}

/// Planned-trade ledger backed by `PostgreSQL`.
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Connects to the database and creates the ledger table if absent.
    ///
    /// # Errors
    /// Returns an error if the connection or schema setup fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let ledger = Self { pool };
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS trades_planned (
                id BIGSERIAL PRIMARY KEY,
                ts TIMESTAMPTZ NOT NULL DEFAULT now(),
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty DOUBLE PRECISION NOT NULL,
                entry_price DOUBLE PRECISION NOT NULL,
                sl_price DOUBLE PRECISION NOT NULL,
                tp_price DOUBLE PRECISION NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TradeLedger for PgLedger {
    async fn append(&self, trade: &PlannedTrade) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO trades_planned (ts, symbol, side, qty, entry_price, sl_price, tp_price)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(trade.ts)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.qty)
        .bind(trade.entry_price)
        .bind(trade.sl_price)
        .bind(trade.tp_price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PlannedTrade>> {
        let rows = sqlx::query(
            r"
            SELECT ts, symbol, side, qty, entry_price, sl_price, tp_price
            FROM trades_planned
            WHERE ts >= $1 AND ts < $2
            ORDER BY ts
            ",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let side: String = row.try_get("side")?;
                Ok(PlannedTrade {
                    ts: row.try_get("ts")?,
                    symbol: row.try_get("symbol")?,
                    side: Side::from_str(&side)?,
                    qty: row.try_get("qty")?,
                    entry_price: row.try_get("entry_price")?,
                    sl_price: row.try_get("sl_price")?,
                    tp_price: row.try_get("tp_price")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capflow_core::events::OrderPlan;
    use chrono::TimeZone;

    fn trade(ts: DateTime<Utc>) -> PlannedTrade {
        PlannedTrade::from_plan(
            &OrderPlan {
                symbol: "BTCUSDT".to_string(),
                side: Side::Long,
                qty: 10.0,
                entry_price: 100.0,
                sl_price: 90.0,
                tp_price: 130.0,
            },
            ts,
        )
    }

    #[tokio::test]
    async fn memory_ledger_reads_by_range() {
        let ledger = MemoryLedger::new();
        let t0 = Utc.timestamp_opt(1_000, 0).unwrap();
        let t1 = Utc.timestamp_opt(2_000, 0).unwrap();
        let t2 = Utc.timestamp_opt(3_000, 0).unwrap();
        ledger.append(&trade(t0)).await.unwrap();
        ledger.append(&trade(t1)).await.unwrap();
        ledger.append(&trade(t2)).await.unwrap();

        let rows = ledger.read_range(t0, t2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, t0);
        assert_eq!(rows[1].ts, t1);
    }
}
