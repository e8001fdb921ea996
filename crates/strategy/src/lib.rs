//! Capitulation-reversal entry rule.
//!
//! A single stateless evaluator: a metrics snapshot either qualifies and
//! maps deterministically onto a long [`Signal`], or it does not. No
//! short-side rule is defined.

use capflow_core::config::StrategyConfig;
use capflow_core::events::{MetricsSnapshot, Side, Signal};

/// Planned reward distance as a multiple of the risked distance.
const R_MULTIPLE: f64 = 3.0;
/// Calibrated hit-rate estimate for qualifying entries.
const P_HIT_RATE_EST: f64 = 0.4;

/// Evaluates the entry rule against one closed-bar snapshot.
///
/// All legs are conjunctive: a 15-bar price drawdown of at least 20%
/// with surging volume and open interest, funding pressure turning
/// negative, liquidation flow confirming (surge index or quiet
/// liquidation tape), and acceptable entry cost.
#[must_use]
pub fn generate_signal(
    symbol: &str,
    last_price: f64,
    metrics: &MetricsSnapshot,
    cfg: &StrategyConfig,
) -> Option<Signal> {
    let capitulation = metrics.pdd <= -0.2
        && metrics.vsr >= 3.0
        && metrics.ois >= 0.15
        && metrics.frd <= -0.02;
    if !capitulation {
        return None;
    }
    if !(metrics.lsi >= 2.0 || metrics.ll <= 0.5 * metrics.atr) {
        return None;
    }
    if metrics.lcf > cfg.cost_threshold {
        return None;
    }

    let entry = last_price;
    let sl = entry - metrics.atr;
    let tp = entry + R_MULTIPLE * (entry - sl);
    tracing::debug!(symbol, entry, sl, tp, "entry rule satisfied");
    Some(Signal {
        symbol: symbol.to_string(),
        side: Side::Long,
        entry_price: entry,
        sl_price: sl,
        tp_price: tp,
        p_hit_rate_est: P_HIT_RATE_EST,
        r_multiple: R_MULTIPLE,
    })
}
