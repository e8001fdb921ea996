//! End-to-end pipeline: raw kline events → metric engine → metrics
//! stream → orchestrator → paper fills + planned-trade ledger.

use capflow_bus::{EventBus, MemoryBus};
use capflow_core::config::{
    KillSwitchConfig, MetricsConfig, OrchestratorConfig, RiskConfig, StrategyConfig,
};
use capflow_core::events::{KlineBar, RawMarketEvent, RawPayload};
use capflow_core::keys::{
    METRICS_STREAM, METRIC_ENGINE_GROUP, ORCHESTRATOR_GROUP, PAPER_FILLS_STREAM, RAW_STREAM,
};
use capflow_core::traits::{AlertSink, ExecutionGateway, LogAlert, TradeLedger};
use capflow_metrics::MetricEngine;
use capflow_orchestrator::{MemoryLedger, Orchestrator, PaperGateway};
use capflow_risk::KillSwitch;
use std::collections::HashMap;
use std::sync::Arc;

fn kline_fields(symbol: &str, minute: i64, close: f64, bar: &KlineBar) -> HashMap<String, String> {
    let event = RawMarketEvent {
        ts: minute * 60_000,
        symbol: symbol.to_string(),
        feed: "kline".to_string(),
        payload: RawPayload {
            k: Some(KlineBar {
                open_time: minute * 60_000,
                close,
                ..bar.clone()
            }),
        },
    };
    HashMap::from([(
        "data".to_string(),
        serde_json::to_string(&event).unwrap(),
    )])
}

fn calm_bar() -> KlineBar {
    KlineBar {
        open_time: 0,
        close: 100.0,
        volume: 1.0,
        closed: true,
        open_interest: 100.0,
        funding_rate: 0.0,
        liquidation_notional: 0.0,
    }
}

fn crash_bar() -> KlineBar {
    KlineBar {
        volume: 10.0,
        open_interest: 120.0,
        funding_rate: -0.03,
        liquidation_notional: 1_000.0,
        ..calm_bar()
    }
}

/// 100 calm bars, then a 15-bar 21% capitulation.
async fn feed_capitulation(bus: &MemoryBus) {
    for minute in 0..100 {
        bus.publish(
            RAW_STREAM,
            kline_fields("BTCUSDT", minute + 1, 100.0, &calm_bar()),
            None,
        )
        .await
        .unwrap();
    }
    for j in 0..15i64 {
        let close = 100.0 - 1.4 * (j + 1) as f64;
        bus.publish(
            RAW_STREAM,
            kline_fields("BTCUSDT", 101 + j, close, &crash_bar()),
            None,
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn capitulation_flows_into_exactly_one_dispatched_plan() {
    let bus = Arc::new(MemoryBus::new());
    let metrics_cfg = MetricsConfig {
        buffer_size: 256,
        block_ms: 0,
        ..MetricsConfig::default()
    };
    let mut engine = MetricEngine::new(Arc::clone(&bus), metrics_cfg);

    let ledger = Arc::new(MemoryLedger::new());
    let killswitch = KillSwitch::new(
        Arc::clone(&bus),
        Arc::new(LogAlert) as Arc<dyn AlertSink>,
        &KillSwitchConfig::default(),
        &RiskConfig::default(),
    );
    let mut orchestrator = Orchestrator::new(
        Arc::clone(&bus),
        Arc::new(PaperGateway::new(Arc::clone(&bus))) as Arc<dyn ExecutionGateway>,
        Arc::clone(&ledger) as Arc<dyn TradeLedger>,
        killswitch,
        OrchestratorConfig {
            batch_size: 200,
            block_ms: 0,
        },
        StrategyConfig::default(),
        RiskConfig::default(),
    );

    bus.create_group(RAW_STREAM, METRIC_ENGINE_GROUP)
        .await
        .unwrap();
    bus.create_group(METRICS_STREAM, ORCHESTRATOR_GROUP)
        .await
        .unwrap();

    feed_capitulation(&bus).await;
    // Two polls cover the 115 raw entries at the default batch of 100.
    engine.poll_once().await.unwrap();
    engine.poll_once().await.unwrap();
    assert_eq!(bus.stream_len(METRICS_STREAM).await.unwrap(), 115);

    orchestrator.process_once().await.unwrap();

    // Only the final crash bar qualifies: one plan, one fill, one row.
    assert_eq!(orchestrator.stats().orders_sent(), 1);
    assert_eq!(bus.stream_len(PAPER_FILLS_STREAM).await.unwrap(), 1);
    let rows = ledger.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].symbol, "BTCUSDT");
    assert_eq!(rows[0].entry_price, 79.0);
    // 1% of 10_000 over the 1.4 ATR stop distance.
    assert!((rows[0].qty - 100.0 / 1.4).abs() < 1e-9);
}

#[tokio::test]
async fn halt_state_is_shared_across_switch_instances() {
    let bus = Arc::new(MemoryBus::new());
    let make = || {
        KillSwitch::new(
            Arc::clone(&bus),
            Arc::new(LogAlert) as Arc<dyn AlertSink>,
            &KillSwitchConfig {
                unhalt_passphrase: "open-sesame".to_string(),
                lag_threshold_ms: 500,
            },
            &RiskConfig::default(),
        )
    };
    let first = make();
    let second = make();

    first.halt("drawdown_limit").await.unwrap();
    assert!(second.is_halted().await.unwrap());

    second.unhalt("open-sesame").await.unwrap();
    assert!(!first.is_halted().await.unwrap());
}
