use crate::data::BarRecord;
use capflow_core::account::AccountState;
use capflow_core::config::AppConfig;
use capflow_core::events::{MetricsSnapshot, Side, Signal};
use capflow_metrics::formulas::{compute_all, IndicatorParams};
use capflow_metrics::window::{RollingWindow, SampleFrame};
use capflow_risk::manager::{vet_and_size, RiskVerdict};
use capflow_strategy::generate_signal;
use serde::Serialize;

/// A round trip closed by stop-loss, take-profit, or the time exit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTrade {
    /// Exit bar close time, epoch milliseconds.
    pub ts: i64,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry: f64,
    pub exit: f64,
    pub pnl: f64,
    /// Realized profit as a multiple of the risked distance.
    pub r: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestStats {
    pub win_rate: f64,
    pub avg_r: f64,
    pub profit_factor: f64,
    pub max_dd: f64,
    pub tail_ratio: f64,
}

/// One symbol's replay input.
#[derive(Debug, Clone)]
pub struct SymbolSeries {
    pub symbol: String,
    pub bars: Vec<BarRecord>,
}

struct OpenPosition {
    signal: Signal,
    qty: f64,
    entry_bar: usize,
}

/// Replays the live decision path (window update, indicators, signal,
/// risk vetting) over historical bars, settling exits against the
/// account. A `FatalHalt` verdict ends the whole run, mirroring the
/// process-wide halt in live trading.
#[must_use]
pub fn run_backtest(data: &[SymbolSeries], cfg: &AppConfig) -> (Vec<ClosedTrade>, BacktestStats) {
    let params = IndicatorParams::from(&cfg.metrics);
    let start_equity = cfg.risk.start_equity;
    let mut account = AccountState::new(start_equity);
    let mut trades: Vec<ClosedTrade> = Vec::new();

    'symbols: for series in data {
        let mut window = RollingWindow::new(cfg.metrics.buffer_size);
        let mut open: Option<OpenPosition> = None;

        for (i, bar) in series.bars.iter().enumerate() {
            window.update(&SampleFrame {
                price: bar.close,
                volume: bar.volume,
                open_interest: bar.open_interest,
                funding_rate: bar.funding_rate,
                liquidation_notional: bar.liquidation_notional,
            });
            if window.len() < cfg.metrics.lookback {
                continue;
            }

            if let Some(position) = open.take() {
                match close_if_exited(&position, bar, i, cfg) {
                    Some((exit_price, exit_fee)) => {
                        let pnl = (exit_price - position.signal.entry_price) * position.qty
                            - exit_fee;
                        account.settle(pnl);
                        let risked =
                            (position.signal.entry_price - position.signal.sl_price).abs()
                                * position.qty;
                        trades.push(ClosedTrade {
                            ts: bar.ts,
                            symbol: series.symbol.clone(),
                            side: position.signal.side,
                            qty: position.qty,
                            entry: position.signal.entry_price,
                            exit: exit_price,
                            pnl,
                            r: if risked > 0.0 { pnl / risked } else { 0.0 },
                        });
                    }
                    None => {
                        open = Some(position);
                    }
                }
                continue;
            }

            let view = match window.view(window.len()) {
                Ok(view) => view,
                Err(_) => continue,
            };
            let set = compute_all(&view, &params);
            let snapshot = MetricsSnapshot {
                ts: bar.ts,
                symbol: series.symbol.clone(),
                price: bar.close,
                pdd: set.pdd,
                vsr: set.vsr,
                ois: set.ois,
                frd: set.frd,
                atr: set.atr,
                ll: set.ll,
                lva: set.lva,
                lsi: set.lsi,
                lcf: set.lcf,
            };

            let Some(signal) =
                generate_signal(&series.symbol, bar.close, &snapshot, &cfg.strategy)
            else {
                continue;
            };
            match vet_and_size(&signal, &account, &cfg.risk) {
                RiskVerdict::Sized(plan) => {
                    let entry_fee = plan.qty * bar.close * cfg.risk.fee_bps / 10_000.0;
                    account.equity -= entry_fee;
                    open = Some(OpenPosition {
                        signal,
                        qty: plan.qty,
                        entry_bar: i,
                    });
                }
                RiskVerdict::FatalHalt(reason) => {
                    tracing::warn!(reason, "backtest halted");
                    break 'symbols;
                }
                RiskVerdict::Rejected(_) => {}
            }
        }
    }

    let stats = summarize(&trades, start_equity, account.equity);
    (trades, stats)
}

/// Exit priority per bar: stop-loss, then take-profit, then the time exit
/// after `max_hold_bars`.
fn close_if_exited(
    position: &OpenPosition,
    bar: &BarRecord,
    bar_index: usize,
    cfg: &AppConfig,
) -> Option<(f64, f64)> {
    let exit_price = if bar.low <= position.signal.sl_price {
        position.signal.sl_price
    } else if bar.high >= position.signal.tp_price {
        position.signal.tp_price
    } else if bar_index - position.entry_bar >= cfg.backtest.max_hold_bars {
        bar.close
    } else {
        return None;
    };
    let exit_fee = position.qty * exit_price * cfg.risk.fee_bps / 10_000.0;
    Some((exit_price, exit_fee))
}

fn summarize(trades: &[ClosedTrade], start_equity: f64, end_equity: f64) -> BacktestStats {
    let wins: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl > 0.0).collect();
    let losses: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl <= 0.0).collect();

    let win_rate = if trades.is_empty() {
        0.0
    } else {
        wins.len() as f64 / trades.len() as f64
    };
    let avg_r = if trades.is_empty() {
        0.0
    } else {
        trades.iter().map(|t| t.r).sum::<f64>() / trades.len() as f64
    };
    let gross_loss: f64 = losses.iter().map(|t| t.pnl).sum::<f64>().abs();
    let profit_factor = if gross_loss == 0.0 {
        f64::INFINITY
    } else {
        wins.iter().map(|t| t.pnl).sum::<f64>() / gross_loss
    };
    let max_dd = ((start_equity - end_equity) / start_equity).max(0.0);
    let best_win = wins.iter().map(|t| t.r).fold(f64::NAN, f64::max);
    let worst_loss = losses.iter().map(|t| t.r).fold(f64::NAN, f64::min);
    let tail_ratio = if wins.is_empty() || losses.is_empty() || worst_loss == 0.0 {
        0.0
    } else {
        best_win / worst_loss.abs()
    };

    BacktestStats {
        win_rate,
        avg_r,
        profit_factor,
        max_dd,
        tail_ratio,
    }
}
