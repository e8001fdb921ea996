//! Stream, group, and key names shared by every component on the bus.

/// Raw market events as published by the collector.
pub const RAW_STREAM: &str = "market.raw";
/// Closed-bar metric snapshots, field-per-key records.
pub const METRICS_STREAM: &str = "market.metrics";
/// Simulated fills produced by the paper gateway.
pub const PAPER_FILLS_STREAM: &str = "fills.paper";

pub const METRIC_ENGINE_GROUP: &str = "metric-engine";
pub const ORCHESTRATOR_GROUP: &str = "orchestrator";

/// Liveness keys hold an epoch-millisecond timestamp with a short expiry;
/// external monitoring alerts on staleness.
pub const METRIC_ENGINE_HB_KEY: &str = "metric-engine:hb";
pub const ORCHESTRATOR_HB_KEY: &str = "orchestrator:hb";
pub const HEARTBEAT_TTL_SECS: u64 = 5;

/// Holds `"1"` while trading is halted, absent otherwise.
pub const KILLSWITCH_KEY: &str = "killswitch:halted";
pub const KILLSWITCH_REASON_KEY: &str = "killswitch:reason";
/// Written by infrastructure monitoring; read by the kill switch.
pub const BUS_LAG_KEY: &str = "bus:lag_ms";
