pub mod account;
pub mod config;
pub mod config_loader;
pub mod events;
pub mod keys;
pub mod traits;

pub use account::AccountState;
pub use config::{
    AppConfig, BacktestConfig, DatabaseConfig, KillSwitchConfig, MetricsConfig,
    OrchestratorConfig, RiskConfig, StrategyConfig,
};
pub use config_loader::ConfigLoader;
pub use events::{
    KlineBar, MetricsSnapshot, OrderPlan, PlannedTrade, RawMarketEvent, RawPayload, Side, Signal,
};
pub use traits::{AlertSink, ExecutionGateway, LogAlert, TradeLedger};
