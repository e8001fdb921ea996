use crate::formulas::{compute_all, IndicatorParams, IndicatorSet};
use crate::window::{RollingWindow, SampleFrame};
use anyhow::{bail, Context, Result};
use capflow_bus::{EventBus, StreamEntry};
use capflow_core::config::MetricsConfig;
use capflow_core::events::{MetricsSnapshot, RawMarketEvent};
use capflow_core::keys::{
    HEARTBEAT_TTL_SECS, METRICS_STREAM, METRIC_ENGINE_GROUP, METRIC_ENGINE_HB_KEY, RAW_STREAM,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONSUMER: &str = "worker";
/// Bar-to-publish latency above this is logged.
const LATENCY_WARN_MS: i64 = 400;

/// Consumes the raw market stream and republishes closed-bar metric
/// snapshots, one rolling window per symbol.
///
/// Delivery is at-least-once; redelivered bars are absorbed by the
/// per-symbol minute dedup, so reprocessing after a crash cannot emit a
/// duplicate snapshot for the same (symbol, minute).
pub struct MetricEngine<B: EventBus> {
    bus: Arc<B>,
    cfg: MetricsConfig,
    params: IndicatorParams,
    windows: HashMap<String, RollingWindow>,
    last_minute: HashMap<String, i64>,
    should_stop: Arc<AtomicBool>,
}

impl<B: EventBus> MetricEngine<B> {
    #[must_use]
    pub fn new(bus: Arc<B>, cfg: MetricsConfig) -> Self {
        let params = IndicatorParams::from(&cfg);
        Self {
            bus,
            cfg,
            params,
            windows: HashMap::new(),
            last_minute: HashMap::new(),
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that makes `run` return after the in-flight batch is acked.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.should_stop)
    }

    /// Runs the consumer loop until the stop handle is set.
    ///
    /// # Errors
    /// Returns an error only on bus failures; malformed entries are
    /// logged, acknowledged, and dropped.
    pub async fn run(&mut self) -> Result<()> {
        self.bus
            .create_group(RAW_STREAM, METRIC_ENGINE_GROUP)
            .await
            .context("create metric-engine consumer group")?;
        tracing::info!(
            stream = RAW_STREAM,
            group = METRIC_ENGINE_GROUP,
            buffer_size = self.cfg.buffer_size,
            "metric engine started"
        );
        self.recover_pending().await?;
        while !self.should_stop.load(Ordering::SeqCst) {
            self.poll_once().await?;
        }
        tracing::info!("metric engine stopped");
        Ok(())
    }

    /// Reprocesses deliveries left unacknowledged by a previous run.
    /// Safe to repeat: duplicate bars fall to the minute dedup.
    async fn recover_pending(&mut self) -> Result<()> {
        loop {
            let pending = self
                .bus
                .claim_pending(
                    RAW_STREAM,
                    METRIC_ENGINE_GROUP,
                    CONSUMER,
                    self.cfg.batch_size,
                )
                .await
                .context("claim pending raw entries")?;
            if pending.is_empty() {
                return Ok(());
            }
            tracing::info!(count = pending.len(), "reprocessing pending deliveries");
            self.process_batch(pending).await?;
        }
    }

    /// Reads one batch, processes and acks each entry, then refreshes the
    /// heartbeat whether or not any bar closed.
    ///
    /// # Errors
    /// Returns an error on bus failures.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let entries = self
            .bus
            .read_group(
                RAW_STREAM,
                METRIC_ENGINE_GROUP,
                CONSUMER,
                self.cfg.batch_size,
                Duration::from_millis(self.cfg.block_ms),
            )
            .await
            .context("read raw stream")?;
        let processed = entries.len();
        self.process_batch(entries).await?;
        self.heartbeat().await?;
        Ok(processed)
    }

    async fn process_batch(&mut self, entries: Vec<StreamEntry>) -> Result<()> {
        for entry in entries {
            if let Err(err) = self.process_entry(&entry).await {
                tracing::warn!(id = %entry.id, error = %err, "dropping malformed raw entry");
            }
            // Ack after processing: a crash before this point redelivers,
            // and the minute dedup makes the redelivery harmless.
            self.bus
                .ack(RAW_STREAM, METRIC_ENGINE_GROUP, &entry.id)
                .await
                .context("ack raw entry")?;
        }
        Ok(())
    }

    async fn process_entry(&mut self, entry: &StreamEntry) -> Result<()> {
        let Some(data) = entry.fields.get("data") else {
            bail!("missing data field");
        };
        let raw: RawMarketEvent = serde_json::from_str(data).context("decode raw event")?;
        if raw.feed != "kline" {
            return Ok(());
        }
        let Some(bar) = raw.payload.k else {
            bail!("kline event without payload.k");
        };
        if !bar.closed {
            return Ok(());
        }

        let window = self
            .windows
            .entry(raw.symbol.clone())
            .or_insert_with(|| RollingWindow::new(self.cfg.buffer_size));
        window.update(&SampleFrame {
            price: bar.close,
            volume: bar.volume,
            open_interest: bar.open_interest,
            funding_rate: bar.funding_rate,
            liquidation_notional: bar.liquidation_notional,
        });

        let minute = raw.ts / 60_000;
        if self.last_minute.get(&raw.symbol) == Some(&minute) {
            // Duplicate or retried delivery of an already-emitted bar.
            return Ok(());
        }

        let set = {
            let view = window.view(window.len())?;
            compute_all(&view, &self.params)
        };
        let snapshot = build_snapshot(raw.ts, &raw.symbol, bar.close, &set);
        self.bus
            .publish(METRICS_STREAM, snapshot.to_fields(), Some(self.cfg.maxlen))
            .await
            .context("publish metrics snapshot")?;

        let latency = Utc::now().timestamp_millis() - raw.ts;
        if latency > LATENCY_WARN_MS {
            tracing::warn!(symbol = %raw.symbol, ms = latency, "bar-to-metrics latency");
        }
        self.last_minute.insert(raw.symbol, minute);
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        self.bus
            .set_key(
                METRIC_ENGINE_HB_KEY,
                &Utc::now().timestamp_millis().to_string(),
                Some(Duration::from_secs(HEARTBEAT_TTL_SECS)),
            )
            .await
            .context("refresh metric-engine heartbeat")?;
        Ok(())
    }
}

fn build_snapshot(ts: i64, symbol: &str, price: f64, set: &IndicatorSet) -> MetricsSnapshot {
    MetricsSnapshot {
        ts,
        symbol: symbol.to_string(),
        price,
        pdd: set.pdd,
        vsr: set.vsr,
        ois: set.ois,
        frd: set.frd,
        atr: set.atr,
        ll: set.ll,
        lva: set.lva,
        lsi: set.lsi,
        lcf: set.lcf,
    }
}
