use serde::{Deserialize, Serialize};

/// Account equity snapshot read by the risk manager and kill switch.
///
/// Single-writer: only the orchestrator's settlement logic (backtest) or
/// external fill accounting (live) mutates it. `daily_pnl` is cumulative
/// since the last external reset; the core defines no rollover boundary
/// of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: f64,
    pub start_equity: f64,
    pub daily_pnl: f64,
}

impl AccountState {
    #[must_use]
    pub const fn new(start_equity: f64) -> Self {
        Self {
            equity: start_equity,
            start_equity,
            daily_pnl: 0.0,
        }
    }

    /// Realized decline from starting equity, in account currency.
    #[must_use]
    pub fn drawdown(&self) -> f64 {
        self.start_equity - self.equity
    }

    /// Realized decline as a percentage of starting equity.
    #[must_use]
    pub fn drawdown_pct(&self) -> f64 {
        if self.start_equity == 0.0 {
            return 0.0;
        }
        self.drawdown() / self.start_equity * 100.0
    }

    /// Books a realized profit or loss into equity and the daily total.
    pub fn settle(&mut self, pnl: f64) {
        self.equity += pnl;
        self.daily_pnl += pnl;
    }

    /// Invoked by an external scheduler at its chosen day boundary.
    pub fn reset_daily_pnl(&mut self) {
        self.daily_pnl = 0.0;
    }
}
