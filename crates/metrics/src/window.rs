use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("view length {requested} exceeds capacity {capacity}")]
    InvalidRange { requested: usize, capacity: usize },
}

/// One closed bar's worth of samples for a single symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleFrame {
    pub price: f64,
    pub volume: f64,
    pub open_interest: f64,
    pub funding_rate: f64,
    pub liquidation_notional: f64,
}

/// Fixed-capacity circular buffer of five parallel time series.
///
/// `update` is O(1) and allocation-free; views are read-only slice pairs
/// over the ring storage, so per-tick cost stays bounded regardless of
/// history depth.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    idx: usize,
    full: bool,
    price: Vec<f64>,
    volume: Vec<f64>,
    open_interest: Vec<f64>,
    funding_rate: Vec<f64>,
    liq_notional: Vec<f64>,
}

impl RollingWindow {
    /// # Panics
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be non-zero");
        Self {
            capacity,
            idx: 0,
            full: false,
            price: vec![0.0; capacity],
            volume: vec![0.0; capacity],
            open_interest: vec![0.0; capacity],
            funding_rate: vec![0.0; capacity],
            liq_notional: vec![0.0; capacity],
        }
    }

    /// Appends one sample at the write cursor and advances it modulo
    /// capacity; the buffer reports full once the cursor first wraps.
    pub fn update(&mut self, frame: &SampleFrame) {
        self.price[self.idx] = frame.price;
        self.volume[self.idx] = frame.volume;
        self.open_interest[self.idx] = frame.open_interest;
        self.funding_rate[self.idx] = frame.funding_rate;
        self.liq_notional[self.idx] = frame.liquidation_notional;
        self.idx = (self.idx + 1) % self.capacity;
        if self.idx == 0 {
            self.full = true;
        }
    }

    /// Number of samples currently retrievable.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.full {
            self.capacity
        } else {
            self.idx
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.full
    }

    /// Returns the `count` most recent samples per series, oldest first.
    ///
    /// When the ring has wrapped, the view is the logical concatenation of
    /// the tail and head segments, composed from two borrowed slices with
    /// no copying or rotation of the underlying storage.
    ///
    /// # Errors
    /// Fails with [`WindowError::InvalidRange`] when `count > capacity`.
    pub fn view(&self, count: usize) -> Result<WindowView<'_>, WindowError> {
        if count > self.capacity {
            return Err(WindowError::InvalidRange {
                requested: count,
                capacity: self.capacity,
            });
        }
        let begin = (self.idx + self.capacity - count) % self.capacity;
        let split = if count == 0 {
            // Empty view; both segments zero-length.
            (begin, begin, 0)
        } else if begin + count <= self.capacity {
            (begin, begin + count, 0)
        } else {
            (begin, self.capacity, begin + count - self.capacity)
        };
        fn segment(storage: &[f64], split: (usize, usize, usize)) -> SeriesView<'_> {
            SeriesView {
                first: &storage[split.0..split.1],
                second: &storage[..split.2],
            }
        }
        Ok(WindowView {
            price: segment(&self.price, split),
            volume: segment(&self.volume, split),
            open_interest: segment(&self.open_interest, split),
            funding_rate: segment(&self.funding_rate, split),
            liq_notional: segment(&self.liq_notional, split),
        })
    }
}

/// Ordered view of all five series over the same sample range.
#[derive(Debug, Clone, Copy)]
pub struct WindowView<'a> {
    pub price: SeriesView<'a>,
    pub volume: SeriesView<'a>,
    pub open_interest: SeriesView<'a>,
    pub funding_rate: SeriesView<'a>,
    pub liq_notional: SeriesView<'a>,
}

/// Read-only, oldest-first view of one series: two borrowed ring segments
/// composing the unrotated window.
#[derive(Debug, Clone, Copy)]
pub struct SeriesView<'a> {
    first: &'a [f64],
    second: &'a [f64],
}

impl<'a> SeriesView<'a> {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at logical index `i` (0 = oldest).
    ///
    /// # Panics
    /// Panics if `i` is out of bounds.
    #[must_use]
    pub fn at(&self, i: usize) -> f64 {
        if i < self.first.len() {
            self.first[i]
        } else {
            self.second[i - self.first.len()]
        }
    }

    #[must_use]
    pub fn last(&self) -> Option<f64> {
        self.second.last().or_else(|| self.first.last()).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + 'a {
        self.first.iter().chain(self.second.iter()).copied()
    }

    /// View of the last `n` samples (all of them when `n >= len`).
    #[must_use]
    pub fn tail(&self, n: usize) -> SeriesView<'a> {
        let skip = self.len().saturating_sub(n);
        if skip >= self.first.len() {
            SeriesView {
                first: &self.second[skip - self.first.len()..],
                second: &[],
            }
        } else {
            SeriesView {
                first: &self.first[skip..],
                second: self.second,
            }
        }
    }
}
