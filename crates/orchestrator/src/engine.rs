use crate::stats::OrchestratorStats;
use anyhow::{Context, Result};
use capflow_bus::{EventBus, StreamEntry};
use capflow_core::account::AccountState;
use capflow_core::config::{OrchestratorConfig, RiskConfig, StrategyConfig};
use capflow_core::events::{MetricsSnapshot, PlannedTrade};
use capflow_core::keys::{
    HEARTBEAT_TTL_SECS, METRICS_STREAM, ORCHESTRATOR_GROUP, ORCHESTRATOR_HB_KEY,
};
use capflow_core::traits::{ExecutionGateway, TradeLedger};
use capflow_risk::killswitch::KillSwitch;
use capflow_risk::manager::{vet_and_size, RiskVerdict};
use capflow_strategy::generate_signal;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CONSUMER: &str = "bot";

enum EntryOutcome {
    Processed,
    Halted,
}

/// The decision cycle: metrics entry → signal → risk verdict → dispatch.
///
/// The kill switch is consulted before any entry is read, so no code path
/// can construct and dispatch a plan while halted; a `FatalHalt` verdict
/// from the risk manager folds onto the same shared flag. Heartbeats keep
/// flowing while halted so monitoring can tell "halted but alive" from
/// "dead process".
pub struct Orchestrator<B: EventBus> {
    bus: Arc<B>,
    gateway: Arc<dyn ExecutionGateway>,
    ledger: Arc<dyn TradeLedger>,
    killswitch: KillSwitch<B>,
    account: AccountState,
    cfg: OrchestratorConfig,
    strategy_cfg: StrategyConfig,
    risk_cfg: RiskConfig,
    stats: Arc<OrchestratorStats>,
    should_stop: Arc<AtomicBool>,
    halt_logged: bool,
}

impl<B: EventBus> Orchestrator<B> {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<B>,
        gateway: Arc<dyn ExecutionGateway>,
        ledger: Arc<dyn TradeLedger>,
        killswitch: KillSwitch<B>,
        cfg: OrchestratorConfig,
        strategy_cfg: StrategyConfig,
        risk_cfg: RiskConfig,
    ) -> Self {
        let account = AccountState::new(risk_cfg.start_equity);
        Self {
            bus,
            gateway,
            ledger,
            killswitch,
            account,
            cfg,
            strategy_cfg,
            risk_cfg,
            stats: Arc::new(OrchestratorStats::default()),
            should_stop: Arc::new(AtomicBool::new(false)),
            halt_logged: false,
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<OrchestratorStats> {
        Arc::clone(&self.stats)
    }

    /// Handle that makes `run` return after the in-flight cycle completes.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.should_stop)
    }

    #[must_use]
    pub const fn account(&self) -> &AccountState {
        &self.account
    }

    /// Single-writer mutation point for external fill accounting.
    pub fn account_mut(&mut self) -> &mut AccountState {
        &mut self.account
    }

    /// Runs decision cycles until the stop handle is set.
    ///
    /// # Errors
    /// Returns an error only on bus failures.
    pub async fn run(&mut self) -> Result<()> {
        self.bus
            .create_group(METRICS_STREAM, ORCHESTRATOR_GROUP)
            .await
            .context("create orchestrator consumer group")?;
        tracing::info!(
            stream = METRICS_STREAM,
            group = ORCHESTRATOR_GROUP,
            "orchestrator started"
        );
        self.recover_pending().await?;
        while !self.should_stop.load(Ordering::SeqCst) {
            self.process_once().await?;
        }
        tracing::info!("orchestrator stopped");
        Ok(())
    }

    /// Replays deliveries left unacknowledged by a previous run through
    /// the normal per-entry path. The gateway's idempotency keys keep a
    /// replayed dispatch from double-submitting. Skipped while halted;
    /// the entries stay pending for after the unhalt.
    async fn recover_pending(&mut self) -> Result<()> {
        if self.killswitch.is_halted().await? {
            return Ok(());
        }
        let mut last_head: Option<String> = None;
        loop {
            let pending = self
                .bus
                .claim_pending(
                    METRICS_STREAM,
                    ORCHESTRATOR_GROUP,
                    CONSUMER,
                    self.cfg.batch_size,
                )
                .await
                .context("claim pending metrics entries")?;
            if pending.is_empty() {
                return Ok(());
            }
            if last_head.as_deref() == Some(pending[0].id.as_str()) {
                tracing::warn!(
                    stuck = %pending[0].id,
                    "pending entry not progressing; deferring to the live loop"
                );
                return Ok(());
            }
            last_head = Some(pending[0].id.clone());
            tracing::info!(count = pending.len(), "reprocessing pending deliveries");
            if self.handle_entries(pending).await? {
                return Ok(());
            }
        }
    }

    /// One decision cycle.
    ///
    /// # Errors
    /// Returns an error on bus failures. Gateway and ledger failures are
    /// contained per entry: the entry stays unacknowledged for redelivery.
    pub async fn process_once(&mut self) -> Result<()> {
        let started = Instant::now();

        if self.killswitch.is_halted().await? {
            if !self.halt_logged {
                tracing::warn!("kill switch engaged; order dispatch suspended");
                self.halt_logged = true;
            }
            self.stats.record_cycle(started.elapsed());
            self.heartbeat().await?;
            return Ok(());
        }
        self.halt_logged = false;

        let entries = self
            .bus
            .read_group(
                METRICS_STREAM,
                ORCHESTRATOR_GROUP,
                CONSUMER,
                self.cfg.batch_size,
                Duration::from_millis(self.cfg.block_ms),
            )
            .await
            .context("read metrics stream")?;

        self.handle_entries(entries).await?;

        self.stats.record_cycle(started.elapsed());
        self.heartbeat().await?;
        self.killswitch.monitor(&self.account).await?;
        Ok(())
    }

    /// Runs the per-entry decision path over a batch. Returns true when a
    /// fatal halt cut the batch short.
    async fn handle_entries(&mut self, entries: Vec<StreamEntry>) -> Result<bool> {
        for entry in entries {
            match self.process_entry(&entry).await {
                Ok(EntryOutcome::Processed) => {
                    self.bus
                        .ack(METRICS_STREAM, ORCHESTRATOR_GROUP, &entry.id)
                        .await
                        .context("ack metrics entry")?;
                }
                Ok(EntryOutcome::Halted) => {
                    // The halt decision for this entry is final; ack it so
                    // an eventual unhalt does not replay it into a re-halt.
                    self.bus
                        .ack(METRICS_STREAM, ORCHESTRATOR_GROUP, &entry.id)
                        .await
                        .context("ack metrics entry")?;
                    return Ok(true);
                }
                Err(err) => {
                    tracing::error!(
                        id = %entry.id,
                        error = %err,
                        "entry processing failed; left unacked for redelivery"
                    );
                }
            }
        }
        Ok(false)
    }

    async fn process_entry(&mut self, entry: &StreamEntry) -> Result<EntryOutcome> {
        let snapshot = match MetricsSnapshot::from_fields(&entry.fields) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(id = %entry.id, error = %err, "dropping malformed metrics entry");
                return Ok(EntryOutcome::Processed);
            }
        };

        let Some(signal) =
            generate_signal(&snapshot.symbol, snapshot.price, &snapshot, &self.strategy_cfg)
        else {
            return Ok(EntryOutcome::Processed);
        };

        match vet_and_size(&signal, &self.account, &self.risk_cfg) {
            RiskVerdict::Sized(plan) => {
                let idempotency_key = format!("metrics-{}", entry.id);
                self.gateway
                    .submit(&plan, &idempotency_key)
                    .await
                    .context("dispatch order plan")?;
                self.stats.inc_orders_sent();
                self.ledger
                    .append(&PlannedTrade::from_plan(&plan, Utc::now()))
                    .await
                    .context("append planned trade")?;
                tracing::info!(
                    symbol = %plan.symbol,
                    qty = plan.qty,
                    entry = plan.entry_price,
                    "order plan dispatched"
                );
                Ok(EntryOutcome::Processed)
            }
            RiskVerdict::FatalHalt(reason) => {
                self.killswitch
                    .halt(&reason)
                    .await
                    .context("engage kill switch")?;
                Ok(EntryOutcome::Halted)
            }
            RiskVerdict::Rejected(reason) => {
                tracing::debug!(symbol = %snapshot.symbol, ?reason, "signal rejected");
                Ok(EntryOutcome::Processed)
            }
        }
    }

    async fn heartbeat(&self) -> Result<()> {
        self.bus
            .set_key(
                ORCHESTRATOR_HB_KEY,
                &Utc::now().timestamp_millis().to_string(),
                Some(Duration::from_secs(HEARTBEAT_TTL_SECS)),
            )
            .await
            .context("refresh orchestrator heartbeat")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaperGateway;
    use crate::ledger::MemoryLedger;
    use async_trait::async_trait;
    use capflow_bus::MemoryBus;
    use capflow_core::config::KillSwitchConfig;
    use capflow_core::events::OrderPlan;
    use capflow_core::keys::KILLSWITCH_KEY;
    use capflow_core::traits::{AlertSink, LogAlert};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct CountingGateway {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionGateway for CountingGateway {
        async fn submit(&self, _plan: &OrderPlan, _key: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn qualifying_fields(ts: i64) -> HashMap<String, String> {
        MetricsSnapshot {
            ts,
            symbol: "BTCUSDT".to_string(),
            price: 80.0,
            pdd: -0.25,
            vsr: 4.0,
            ois: 0.2,
            frd: -0.03,
            atr: 1.5,
            ll: 0.2,
            lva: 1.0,
            lsi: 2.5,
            lcf: 1_000.0,
        }
        .to_fields()
    }

    struct Harness {
        bus: Arc<MemoryBus>,
        gateway: Arc<CountingGateway>,
        ledger: Arc<MemoryLedger>,
        orchestrator: Orchestrator<MemoryBus>,
    }

    fn harness(risk_cfg: RiskConfig) -> Harness {
        let bus = Arc::new(MemoryBus::new());
        let gateway = Arc::new(CountingGateway {
            calls: AtomicUsize::new(0),
        });
        let ledger = Arc::new(MemoryLedger::new());
        let ks_cfg = KillSwitchConfig {
            unhalt_passphrase: "open-sesame".to_string(),
            lag_threshold_ms: 500,
        };
        let killswitch = KillSwitch::new(
            Arc::clone(&bus),
            Arc::new(LogAlert) as Arc<dyn AlertSink>,
            &ks_cfg,
            &risk_cfg,
        );
        let orchestrator = Orchestrator::new(
            Arc::clone(&bus),
            Arc::clone(&gateway) as Arc<dyn ExecutionGateway>,
            Arc::clone(&ledger) as Arc<dyn TradeLedger>,
            killswitch,
            OrchestratorConfig {
                batch_size: 10,
                block_ms: 0,
            },
            StrategyConfig::default(),
            risk_cfg,
        );
        Harness {
            bus,
            gateway,
            ledger,
            orchestrator,
        }
    }

    async fn seed(bus: &MemoryBus, fields: HashMap<String, String>) {
        bus.create_group(METRICS_STREAM, ORCHESTRATOR_GROUP)
            .await
            .unwrap();
        bus.publish(METRICS_STREAM, fields, None).await.unwrap();
    }

    #[tokio::test]
    async fn qualifying_snapshot_dispatches_and_ledgers() {
        let mut h = harness(RiskConfig::default());
        seed(&h.bus, qualifying_fields(60_000)).await;

        h.orchestrator.process_once().await.unwrap();

        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 1);
        let rows = h.ledger.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BTCUSDT");
        // 1% of 10_000 over the 1.5 stop distance.
        assert!((rows[0].qty - 100.0 / 1.5).abs() < 1e-9);
        assert_eq!(h.orchestrator.stats().orders_sent(), 1);
        // The entry was acked: nothing pending.
        let pending = h
            .bus
            .claim_pending(METRICS_STREAM, ORCHESTRATOR_GROUP, CONSUMER, 10)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn halted_flag_blocks_dispatch_before_reads() {
        let mut h = harness(RiskConfig::default());
        seed(&h.bus, qualifying_fields(60_000)).await;
        h.bus.set_key(KILLSWITCH_KEY, "1", None).await.unwrap();

        for _ in 0..3 {
            h.orchestrator.process_once().await.unwrap();
        }

        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);
        assert!(h.ledger.rows().is_empty());
        // Still alive: the heartbeat kept refreshing.
        assert!(h
            .bus
            .get_key(ORCHESTRATOR_HB_KEY)
            .await
            .unwrap()
            .is_some());
        // The entry was never consumed while halted.
        assert_eq!(h.bus.stream_len(METRICS_STREAM).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn drawdown_trip_halts_then_fails_closed() {
        let mut h = harness(RiskConfig {
            max_dd_pct: 20.0,
            ..RiskConfig::default()
        });
        h.bus
            .create_group(METRICS_STREAM, ORCHESTRATOR_GROUP)
            .await
            .unwrap();
        h.orchestrator.account_mut().settle(-2_000.0); // 20% drawdown

        // First cycle: monitor trips the switch at cycle end.
        h.orchestrator.process_once().await.unwrap();
        assert!(h.orchestrator.killswitch.is_halted().await.unwrap());

        // Qualifying entries arriving afterwards must never dispatch.
        h.bus
            .publish(METRICS_STREAM, qualifying_fields(60_000), None)
            .await
            .unwrap();
        for _ in 0..3 {
            h.orchestrator.process_once().await.unwrap();
        }
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);

        // Authenticated unhalt restores dispatch.
        h.orchestrator.killswitch.unhalt("open-sesame").await.unwrap();
        h.orchestrator.account_mut().settle(2_000.0);
        h.orchestrator.process_once().await.unwrap();
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_halt_from_risk_manager_engages_the_switch() {
        let mut h = harness(RiskConfig {
            max_dd_pct: 10.0,
            daily_stop: 1_000_000.0, // keep the soft stop out of the way
            ..RiskConfig::default()
        });
        seed(&h.bus, qualifying_fields(60_000)).await;
        // Past the hard-stop drawdown but with the monitor's own checks
        // not yet run: the verdict path must engage the switch itself.
        h.orchestrator.account_mut().equity -= 1_500.0;

        h.orchestrator.process_once().await.unwrap();

        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);
        assert!(h.orchestrator.killswitch.is_halted().await.unwrap());
        assert_eq!(
            h.orchestrator.killswitch.halt_reason().await.unwrap().as_deref(),
            Some("max drawdown reached")
        );
    }

    #[tokio::test]
    async fn restart_replays_pending_deliveries() {
        let mut h = harness(RiskConfig::default());
        seed(&h.bus, qualifying_fields(60_000)).await;
        // A previous consumer crashed after delivery, before ack.
        h.bus
            .read_group(METRICS_STREAM, ORCHESTRATOR_GROUP, CONSUMER, 10, Duration::ZERO)
            .await
            .unwrap();

        h.orchestrator.stop_handle().store(true, Ordering::SeqCst);
        h.orchestrator.run().await.unwrap();

        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 1);
        let pending = h
            .bus
            .claim_pending(METRICS_STREAM, ORCHESTRATOR_GROUP, CONSUMER, 10)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn non_qualifying_snapshot_is_acked_without_dispatch() {
        let mut h = harness(RiskConfig::default());
        let mut fields = qualifying_fields(60_000);
        fields.insert("pdd".to_string(), "0.0".to_string());
        seed(&h.bus, fields).await;

        h.orchestrator.process_once().await.unwrap();

        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);
        let pending = h
            .bus
            .claim_pending(METRICS_STREAM, ORCHESTRATOR_GROUP, CONSUMER, 10)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn malformed_entry_is_dropped_not_retried() {
        let mut h = harness(RiskConfig::default());
        seed(
            &h.bus,
            HashMap::from([("garbage".to_string(), "1".to_string())]),
        )
        .await;

        h.orchestrator.process_once().await.unwrap();
        let pending = h
            .bus
            .claim_pending(METRICS_STREAM, ORCHESTRATOR_GROUP, CONSUMER, 10)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }
}
