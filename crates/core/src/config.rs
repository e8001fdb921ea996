use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub metrics: MetricsConfig,
    pub orchestrator: OrchestratorConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub killswitch: KillSwitchConfig,
    pub backtest: BacktestConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Rolling window capacity per symbol, in one-minute bars (24h).
    pub buffer_size: usize,
    /// Indicator lookback in bars.
    pub lookback: usize,
    /// ATR-style first-difference period.
    pub atr_period: usize,
    /// Consumer-group read batch size.
    pub batch_size: usize,
    /// Blocking-read timeout in milliseconds.
    pub block_ms: u64,
    /// Approximate retained length of the metrics stream.
    pub maxlen: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1440,
            lookback: 15,
            atr_period: 14,
            batch_size: 100,
            block_ms: 1000,
            maxlen: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub batch_size: usize,
    pub block_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            block_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Upper bound on the liquidation cost-flow metric for entries.
    pub cost_threshold: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            cost_threshold: 1_000_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Percent of equity risked per trade.
    pub risk_pct: f64,
    /// Hard-stop drawdown limit, percent of starting equity.
    pub max_dd_pct: f64,
    /// Daily soft stop in account currency.
    pub daily_stop: f64,
    /// Kill-switch daily loss cap as a fraction of starting equity.
    pub daily_loss_cap: f64,
    /// Taker fee in basis points, used by the backtest fee model.
    pub fee_bps: f64,
    /// Exchange minimum order quantity.
    pub exchange_min_qty: f64,
    pub start_equity: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_pct: 1.0,
            max_dd_pct: 50.0,
            daily_stop: 1_000.0,
            daily_loss_cap: 0.05,
            fee_bps: 0.1,
            exchange_min_qty: 0.001,
            start_equity: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Secret required to clear a halt. Empty rejects every unhalt.
    pub unhalt_passphrase: String,
    /// Infrastructure lag threshold in milliseconds.
    pub lag_threshold_ms: i64,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            unhalt_passphrase: String::new(),
            lag_threshold_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Bars to hold a position before the time exit closes it.
    pub max_hold_bars: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self { max_hold_bars: 90 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/capflow".to_string(),
            max_connections: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.metrics.buffer_size, 1440);
        assert_eq!(config.metrics.lookback, 15);
        assert_eq!(config.risk.max_dd_pct, 50.0);
        assert_eq!(config.killswitch.lag_threshold_ms, 500);
        assert_eq!(config.backtest.max_hold_bars, 90);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        use figment::providers::{Format, Toml};
        let config: AppConfig = figment::Figment::new()
            .merge(Toml::string("[risk]\nrisk_pct = 2.0\n"))
            .extract()
            .unwrap();
        assert_eq!(config.risk.risk_pct, 2.0);
        assert_eq!(config.risk.daily_stop, 1_000.0);
        assert_eq!(config.metrics.buffer_size, 1440);
    }
}
