use anyhow::{Context, Result};
use capflow_backtest::{load_bars, run_backtest, SymbolSeries};
use capflow_bus::{EventBus, MemoryBus};
use capflow_core::keys::{METRICS_STREAM, PAPER_FILLS_STREAM, RAW_STREAM};
use capflow_core::traits::{AlertSink, ExecutionGateway, LogAlert, TradeLedger};
use capflow_core::ConfigLoader;
use capflow_metrics::MetricEngine;
use capflow_orchestrator::{MemoryLedger, Orchestrator, PaperGateway, PgLedger};
use capflow_risk::KillSwitch;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub struct RiskOverrides {
    pub risk_pct: Option<f64>,
    pub max_dd: Option<f64>,
    pub daily_stop: Option<f64>,
}

/// Feeds a raw-event JSONL file through the full pipeline over an
/// in-process bus and reports what came out the other end.
pub async fn run_replay(config_path: &str, events: &Path, postgres: bool) -> Result<()> {
    let cfg = ConfigLoader::load_from(config_path).context("load configuration")?;
    let bus = Arc::new(MemoryBus::new());

    let ledger: Arc<dyn TradeLedger> = if postgres {
        Arc::new(
            PgLedger::connect(&cfg.database.url, cfg.database.max_connections)
                .await
                .context("connect planned-trade ledger")?,
        )
    } else {
        Arc::new(MemoryLedger::new())
    };
    let gateway: Arc<dyn ExecutionGateway> = Arc::new(PaperGateway::new(Arc::clone(&bus)));
    let killswitch = KillSwitch::new(
        Arc::clone(&bus),
        Arc::new(LogAlert) as Arc<dyn AlertSink>,
        &cfg.killswitch,
        &cfg.risk,
    );

    let mut engine = MetricEngine::new(Arc::clone(&bus), cfg.metrics.clone());
    let engine_stop = engine.stop_handle();
    let mut orchestrator = Orchestrator::new(
        Arc::clone(&bus),
        gateway,
        ledger,
        killswitch,
        cfg.orchestrator.clone(),
        cfg.strategy.clone(),
        cfg.risk.clone(),
    );
    let orchestrator_stop = orchestrator.stop_handle();
    let stats = orchestrator.stats();

    let engine_task = tokio::spawn(async move { engine.run().await });
    let orchestrator_task = tokio::spawn(async move { orchestrator.run().await });

    let fed = feed_events(&bus, events).await?;
    tracing::info!(count = fed, file = %events.display(), "raw events published");

    tokio::select! {
        () = drain(&bus, &stats) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; shutting down");
        }
    }

    engine_stop.store(true, Ordering::SeqCst);
    orchestrator_stop.store(true, Ordering::SeqCst);
    engine_task.await?.context("metric engine task")?;
    orchestrator_task.await?.context("orchestrator task")?;

    let metrics_len = bus.stream_len(METRICS_STREAM).await?;
    let fills_len = bus.stream_len(PAPER_FILLS_STREAM).await?;
    tracing::info!(
        raw_events = fed,
        metric_snapshots = metrics_len,
        orders_sent = stats.orders_sent(),
        paper_fills = fills_len,
        last_cycle_ms = stats.last_cycle_ms(),
        "replay finished"
    );
    Ok(())
}

async fn feed_events(bus: &Arc<MemoryBus>, path: &Path) -> Result<usize> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read events file {}", path.display()))?;
    let mut fed = 0;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        bus.publish(
            RAW_STREAM,
            HashMap::from([("data".to_string(), line.to_string())]),
            None,
        )
        .await?;
        fed += 1;
    }
    Ok(fed)
}

/// Resolves once the pipeline has gone quiet: no new metric snapshots or
/// dispatched orders across two consecutive checks.
async fn drain(bus: &Arc<MemoryBus>, stats: &Arc<capflow_orchestrator::OrchestratorStats>) {
    let mut last = (0, 0, 0);
    let mut quiet = 0;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let metrics_len = bus.stream_len(METRICS_STREAM).await.unwrap_or(0);
        let fills_len = bus.stream_len(PAPER_FILLS_STREAM).await.unwrap_or(0);
        let current = (metrics_len, fills_len, stats.orders_sent() as usize);
        if current == last {
            quiet += 1;
            if quiet >= 2 {
                return;
            }
        } else {
            quiet = 0;
            last = current;
        }
    }
}

pub fn run_backtest_cmd(
    config_path: &str,
    data_dir: &Path,
    symbols: &[String],
    overrides: RiskOverrides,
    trades_out: &PathBuf,
    stats_out: &PathBuf,
) -> Result<()> {
    let mut cfg = ConfigLoader::load_from(config_path).context("load configuration")?;
    if let Some(risk_pct) = overrides.risk_pct {
        cfg.risk.risk_pct = risk_pct;
    }
    if let Some(max_dd) = overrides.max_dd {
        cfg.risk.max_dd_pct = max_dd;
    }
    if let Some(daily_stop) = overrides.daily_stop {
        cfg.risk.daily_stop = daily_stop;
    }

    let mut series = Vec::new();
    for symbol in symbols {
        let path = data_dir.join(format!("{symbol}.csv"));
        if !path.exists() {
            tracing::warn!(symbol, path = %path.display(), "no bar file; skipping");
            continue;
        }
        let bars = load_bars(&path)?;
        tracing::info!(symbol, bars = bars.len(), "loaded bar series");
        series.push(SymbolSeries {
            symbol: symbol.clone(),
            bars,
        });
    }

    let (trades, stats) = run_backtest(&series, &cfg);

    let mut writer = csv::Writer::from_path(trades_out)
        .with_context(|| format!("open {}", trades_out.display()))?;
    for trade in &trades {
        writer.serialize(trade)?;
    }
    writer.flush()?;
    std::fs::write(stats_out, serde_json::to_string_pretty(&stats)?)
        .with_context(|| format!("write {}", stats_out.display()))?;

    tracing::info!(
        trades = trades.len(),
        win_rate = stats.win_rate,
        avg_r = stats.avg_r,
        max_dd = stats.max_dd,
        "backtest finished"
    );
    println!(
        "{} trades written to {}, stats to {}",
        trades.len(),
        trades_out.display(),
        stats_out.display()
    );
    Ok(())
}
