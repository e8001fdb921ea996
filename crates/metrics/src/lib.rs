pub mod engine;
pub mod formulas;
pub mod window;

pub use engine::MetricEngine;
pub use formulas::{compute_all, IndicatorParams, IndicatorSet};
pub use window::{RollingWindow, SampleFrame, SeriesView, WindowError, WindowView};
