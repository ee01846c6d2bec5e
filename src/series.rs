//! Scalar time series with a default value and cached moving averages.

use std::{cell::RefCell, collections::BTreeMap};

/// Ordered mapping from time to value.
///
/// Queries at unknown times return the default value. Backward moving
/// averages are computed on demand and dropped on every mutation.
#[derive(Debug, Clone)]
pub struct TimeSeries<K> {
    data: BTreeMap<K, f64>,
    default: f64,
    ma_cache: RefCell<BTreeMap<usize, BTreeMap<K, f64>>>,
}

impl<K: Ord + Copy> TimeSeries<K> {
    pub fn new(default: f64) -> Self {
        Self {
            data: BTreeMap::new(),
            default,
            ma_cache: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn from_pairs<I: IntoIterator<Item = (K, f64)>>(pairs: I, default: f64) -> Self {
        let mut series = Self::new(default);
        series.data.extend(pairs);
        series
    }

    pub fn value(&self, time: K) -> f64 {
        self.data.get(&time).copied().unwrap_or(self.default)
    }

    pub fn times(&self) -> impl Iterator<Item = K> + '_ {
        self.data.keys().copied()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.values().copied()
    }

    pub fn first_time(&self) -> Option<K> {
        self.data.keys().next().copied()
    }

    pub fn last_time(&self) -> Option<K> {
        self.data.keys().next_back().copied()
    }

    /// Average of the `days` entries ending at `time`, fewer at the start of the series.
    pub fn ma_value(&self, time: K, days: usize) -> f64 {
        self.with_ma(days, |ma| ma.get(&time).copied())
            .unwrap_or(self.default)
    }

    pub fn ma_values(&self, days: usize) -> Vec<f64> {
        self.with_ma(days, |ma| ma.values().copied().collect())
    }

    /// Set the value at `time`, replacing any previous one.
    pub fn append_value(&mut self, time: K, value: f64) {
        self.data.insert(time, value);
        self.invalidate();
    }

    /// Add to the value at `time`, or create it.
    pub fn add_value(&mut self, time: K, value: f64) {
        *self.data.entry(time).or_insert(0.0) += value;
        self.invalidate();
    }

    /// Multiply the value at `time`, or create it with `value`.
    pub fn multiply_value(&mut self, time: K, value: f64) {
        self.data
            .entry(time)
            .and_modify(|val| *val *= value)
            .or_insert(value);
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.ma_cache.get_mut().clear();
    }

    fn with_ma<T>(&self, days: usize, f: impl FnOnce(&BTreeMap<K, f64>) -> T) -> T {
        let mut cache = self.ma_cache.borrow_mut();
        let ma = cache.entry(days).or_insert_with(|| self.compute_ma(days));
        f(ma)
    }

    fn compute_ma(&self, days: usize) -> BTreeMap<K, f64> {
        let days = days.max(1);
        let vals: Vec<f64> = self.data.values().copied().collect();
        self.data
            .keys()
            .enumerate()
            .map(|(idx, &time)| {
                let window = &vals[(idx + 1).saturating_sub(days)..=idx];
                (time, window.iter().sum::<f64>() / window.len() as f64)
            })
            .collect()
    }
}
