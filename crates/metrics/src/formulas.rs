//! Indicator formulas over window views.
//!
//! Every function is pure and deterministic, and returns 0.0 instead of
//! NaN/inf when history is insufficient or a denominator is zero, so a
//! thin data feed never fabricates a signal. Identical window contents
//! must reproduce identical results bit for bit.

use crate::window::{SeriesView, WindowView};
use capflow_core::config::MetricsConfig;

/// Samples considered for the volume/liquidation trailing baselines (24h).
const BASELINE_WINDOW: usize = 1440;
/// Samples considered for the funding-rate trailing mean (7d).
const FUNDING_WINDOW: usize = 10_080;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorParams {
    pub lookback: usize,
    pub atr_period: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            lookback: 15,
            atr_period: 14,
        }
    }
}

impl From<&MetricsConfig> for IndicatorParams {
    fn from(cfg: &MetricsConfig) -> Self {
        Self {
            lookback: cfg.lookback,
            atr_period: cfg.atr_period,
        }
    }
}

/// The full derived-metric bundle for one closed bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorSet {
    pub pdd: f64,
    pub vsr: f64,
    pub ois: f64,
    pub frd: f64,
    pub atr: f64,
    pub ll: f64,
    pub lva: f64,
    pub lsi: f64,
    pub lcf: f64,
}

#[must_use]
pub fn compute_all(view: &WindowView<'_>, params: &IndicatorParams) -> IndicatorSet {
    IndicatorSet {
        pdd: trailing_change(&view.price, params.lookback),
        vsr: volume_surge_ratio(&view.volume, params.lookback),
        ois: trailing_change(&view.open_interest, params.lookback),
        frd: funding_rate_delta(&view.funding_rate),
        atr: mean_abs_first_diff(&view.price, params.atr_period),
        ll: mean_abs_first_diff(&view.liq_notional, params.atr_period),
        lva: delta_vs_trailing_mean(&view.volume, params.lookback),
        lsi: surge_index(&view.liq_notional, params.lookback),
        lcf: tail_sum(&view.liq_notional, params.lookback),
    }
}

/// Relative change of the last sample against the sample `lookback` bars
/// earlier: `(last - base) / base`. Used for price drawdown (`pdd`) and
/// open-interest surge (`ois`).
#[must_use]
pub fn trailing_change(series: &SeriesView<'_>, lookback: usize) -> f64 {
    let len = series.len();
    if len <= lookback {
        return 0.0;
    }
    let base = series.at(len - 1 - lookback);
    if base == 0.0 {
        return 0.0;
    }
    (series.at(len - 1) - base) / base
}

/// Lookback volume sum over the 24h trailing median (`vsr`).
#[must_use]
pub fn volume_surge_ratio(volume: &SeriesView<'_>, lookback: usize) -> f64 {
    let recent: f64 = volume.tail(lookback).iter().sum();
    let baseline = median(&volume.tail(BASELINE_WINDOW));
    if baseline == 0.0 {
        return 0.0;
    }
    recent / baseline
}

/// Last funding rate minus its trailing mean over up to 7 days (`frd`).
#[must_use]
pub fn funding_rate_delta(funding: &SeriesView<'_>) -> f64 {
    let Some(last) = funding.last() else {
        return 0.0;
    };
    last - mean(&funding.tail(FUNDING_WINDOW))
}

/// Mean absolute first difference of the last `period` samples. Serves as
/// the ATR proxy on prices (`atr`) and the liquidation-pressure level on
/// liquidation notionals (`ll`).
#[must_use]
pub fn mean_abs_first_diff(series: &SeriesView<'_>, period: usize) -> f64 {
    if period < 2 || series.len() < period {
        return 0.0;
    }
    let tail = series.tail(period);
    let mut sum = 0.0;
    let mut prev = tail.at(0);
    for value in tail.iter().skip(1) {
        sum += (value - prev).abs();
        prev = value;
    }
    sum / (period - 1) as f64
}

/// Last sample minus the mean of the last `lookback` samples (`lva`).
#[must_use]
pub fn delta_vs_trailing_mean(series: &SeriesView<'_>, lookback: usize) -> f64 {
    if series.len() < lookback {
        return 0.0;
    }
    match series.last() {
        Some(last) => last - mean(&series.tail(lookback)),
        None => 0.0,
    }
}

/// Short-over-long trailing-mean ratio (`lsi`): lookback mean against the
/// 24h baseline mean.
#[must_use]
pub fn surge_index(series: &SeriesView<'_>, lookback: usize) -> f64 {
    if series.len() < lookback {
        return 0.0;
    }
    let baseline = mean(&series.tail(BASELINE_WINDOW));
    if baseline == 0.0 {
        return 0.0;
    }
    mean(&series.tail(lookback)) / baseline
}

/// Sum of the last `lookback` samples (`lcf`, notional cost flow).
#[must_use]
pub fn tail_sum(series: &SeriesView<'_>, lookback: usize) -> f64 {
    series.tail(lookback).iter().sum()
}

fn mean(series: &SeriesView<'_>) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    series.iter().sum::<f64>() / series.len() as f64
}

fn median(series: &SeriesView<'_>) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = series.iter().collect();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
