use capflow_core::account::AccountState;
use capflow_core::config::RiskConfig;
use capflow_core::events::{OrderPlan, Signal};

/// Outcome of vetting one signal.
///
/// `FatalHalt` is a process-level condition, not a per-trade rejection:
/// the caller must stop dispatching and fold the reason onto the shared
/// halt flag.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Sized(OrderPlan),
    Rejected(RejectReason),
    FatalHalt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Expected value per unit risk is non-positive, or reward below 2R.
    NoEdge,
    /// Cumulative daily loss reached the soft stop.
    DailyStop,
    /// Entry and stop coincide; size would be unbounded.
    ZeroStopDistance,
    /// Sized quantity falls under the exchange minimum.
    BelowMinQty,
}

/// Vets a signal against account limits and sizes it by fixed fractional
/// risk, so the loss at the stop is `risk_pct` of equity regardless of
/// volatility.
#[must_use]
pub fn vet_and_size(signal: &Signal, account: &AccountState, cfg: &RiskConfig) -> RiskVerdict {
    let edge = signal.p_hit_rate_est * signal.r_multiple - (1.0 - signal.p_hit_rate_est);
    if edge <= 0.0 || signal.r_multiple < 2.0 {
        return RiskVerdict::Rejected(RejectReason::NoEdge);
    }

    if account.drawdown() >= cfg.max_dd_pct / 100.0 * account.start_equity {
        return RiskVerdict::FatalHalt("max drawdown reached".to_string());
    }

    if -account.daily_pnl >= cfg.daily_stop {
        return RiskVerdict::Rejected(RejectReason::DailyStop);
    }

    let risk_amount = cfg.risk_pct / 100.0 * account.equity;
    let stop_dist = (signal.entry_price - signal.sl_price).abs();
    if stop_dist <= 0.0 {
        return RiskVerdict::Rejected(RejectReason::ZeroStopDistance);
    }
    let qty = risk_amount / stop_dist;
    if qty < cfg.exchange_min_qty {
        return RiskVerdict::Rejected(RejectReason::BelowMinQty);
    }

    RiskVerdict::Sized(OrderPlan {
        symbol: signal.symbol.clone(),
        side: signal.side,
        qty,
        entry_price: signal.entry_price,
        sl_price: signal.sl_price,
        tp_price: signal.tp_price,
    })
}
