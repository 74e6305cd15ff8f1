//! Input/target window slicing over a normalized series

use ndarray::{s, ArrayView2};

use crate::error::{ForecastError, Result};

/// Adjacent, non-overlapping input and target spans of one series
#[derive(Debug, Clone)]
pub struct Window<'a> {
    /// Row index of the first input observation
    pub start: usize,
    pub input: ArrayView2<'a, f64>,
    /// `None` for a live window whose future is not observed yet
    pub target: Option<ArrayView2<'a, f64>>,
}

impl Window<'_> {
    /// Row index of the first target observation
    pub fn target_start(&self) -> usize {
        self.start + self.input.nrows()
    }
}

/// Slices series into windows of `input_len` inputs and `horizon` targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBuilder {
    input_len: usize,
    horizon: usize,
}

impl WindowBuilder {
    pub fn new(input_len: usize, horizon: usize) -> Self {
        Self { input_len, horizon }
    }

    pub fn input_len(&self) -> usize {
        self.input_len
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Number of windows in a series of `n` rows: `max(0, n - L - H + 1)`
    pub fn window_count(&self, n: usize) -> usize {
        (n + 1).saturating_sub(self.input_len + self.horizon)
    }

    /// Lazy stride-1 pass from row 0; empty when the series is too short
    pub fn build<'a>(&self, series: ArrayView2<'a, f64>) -> Windows<'a> {
        Windows {
            series,
            input_len: self.input_len,
            horizon: self.horizon,
            next: 0,
            end: self.window_count(series.nrows()),
        }
    }

    /// The most recent `input_len` rows, with no target span
    pub fn latest_window<'a>(&self, series: ArrayView2<'a, f64>) -> Result<Window<'a>> {
        let n = series.nrows();
        if n < self.input_len {
            return Err(ForecastError::InsufficientHistory {
                required: self.input_len,
                available: n,
            });
        }
        let start = n - self.input_len;
        Ok(Window {
            start,
            input: series.slice_move(s![start.., ..]),
            target: None,
        })
    }
}

/// Restartable iterator over the windows of one series
///
/// Cloning yields an independent pass; windows borrow the series rather
/// than copying it.
#[derive(Debug, Clone)]
pub struct Windows<'a> {
    series: ArrayView2<'a, f64>,
    input_len: usize,
    horizon: usize,
    next: usize,
    end: usize,
}

impl<'a> Iterator for Windows<'a> {
    type Item = Window<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        self.next += 1;
        let split = start + self.input_len;
        Some(Window {
            start,
            input: self.series.slice_move(s![start..split, ..]),
            target: Some(self.series.slice_move(s![split..split + self.horizon, ..])),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Windows<'_> {}
