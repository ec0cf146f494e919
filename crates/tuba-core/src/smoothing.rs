//! Centred moving-average smoothing of telemetry series.
//!
//! Each numeric channel of a reading is averaged independently over a window
//! centred on the sample. Near the ends of the series the window is clipped
//! to the available samples, so the output always has the input's length.

use std::fmt;

use serde::{Deserialize, Serialize};

use tuba_types::{Reading, SourcedReading};

use crate::error::{Error, Result};

/// Odd window width of at least 3 samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct Window(usize);

impl Window {
    /// Smallest accepted width.
    pub const MIN: usize = 3;

    /// Create a window of `width` samples.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for widths below 3 or even widths.
    pub fn new(width: usize) -> Result<Self> {
        if width < Self::MIN || width % 2 == 0 {
            return Err(Error::InvalidConfig(format!(
                "smoothing window must be an odd integer >= {}, got {width}",
                Self::MIN
            )));
        }
        Ok(Self(width))
    }

    /// Width in samples.
    #[must_use]
    pub fn width(self) -> usize {
        self.0
    }
}

impl Default for Window {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<usize> for Window {
    type Error = Error;

    fn try_from(width: usize) -> Result<Self> {
        Self::new(width)
    }
}

impl From<Window> for usize {
    fn from(window: Window) -> Self {
        window.0
    }
}

/// Numeric channels of a sample that can be smoothed.
///
/// Non-numeric fields (labels, provenance) are carried over from `self` by
/// [`with_channels`](Channels::with_channels).
pub trait Channels: Clone {
    /// The channel values in a fixed order.
    fn channels(&self) -> Vec<f64>;

    /// A copy of `self` with the channels replaced, in the same order.
    #[must_use]
    fn with_channels(&self, values: &[f64]) -> Self;
}

impl Channels for Reading {
    fn channels(&self) -> Vec<f64> {
        vec![self.brix, self.gravity, self.temperature]
    }

    fn with_channels(&self, values: &[f64]) -> Self {
        let get = |i: usize, fallback: f64| values.get(i).copied().unwrap_or(fallback);
        Reading {
            time: self.time.clone(),
            brix: get(0, self.brix),
            gravity: get(1, self.gravity),
            temperature: get(2, self.temperature),
        }
    }
}

impl Channels for SourcedReading {
    fn channels(&self) -> Vec<f64> {
        self.reading().channels()
    }

    fn with_channels(&self, values: &[f64]) -> Self {
        match self {
            SourcedReading::Live(r) => SourcedReading::Live(r.with_channels(values)),
            SourcedReading::Simulated(r) => SourcedReading::Simulated(r.with_channels(values)),
        }
    }
}

/// Smooth a series with a centred moving average.
///
/// For sample `i` the window covers `[i - w/2, i + ceil(w/2))` clipped to
/// the series bounds. Non-finite values are left out of the mean; a window
/// with no finite value yields NaN for that channel. A series shorter than
/// the window is returned unchanged.
///
/// ```
/// use tuba_core::smoothing::{smooth, Window};
/// use tuba_types::Reading;
///
/// let r = |brix| Reading { time: String::new(), brix, gravity: 1.0, temperature: 30.0 };
/// let out = smooth(&[r(10.0), r(20.0), r(30.0)], Window::new(3).unwrap());
/// assert_eq!(out.iter().map(|r| r.brix).collect::<Vec<_>>(), vec![15.0, 20.0, 25.0]);
/// ```
#[must_use]
pub fn smooth<T: Channels>(series: &[T], window: Window) -> Vec<T> {
    let w = window.width();
    if series.len() < w {
        return series.to_vec();
    }

    let values: Vec<Vec<f64>> = series.iter().map(Channels::channels).collect();
    let half_before = w / 2;
    let half_after = w.div_ceil(2);

    series
        .iter()
        .enumerate()
        .map(|(i, sample)| {
            let lo = i.saturating_sub(half_before);
            let hi = (i + half_after).min(series.len());
            let averaged: Vec<f64> = (0..values[i].len())
                .map(|channel| finite_mean(values[lo..hi].iter().map(|v| v[channel])))
                .collect();
            sample.with_channels(&averaged)
        })
        .collect()
}

fn finite_mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .filter(|v| v.is_finite())
        .fold((0.0, 0u32), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / f64::from(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(time: &str, brix: f64, gravity: f64, temperature: f64) -> Reading {
        Reading {
            time: time.to_string(),
            brix,
            gravity,
            temperature,
        }
    }

    fn brix(series: &[Reading]) -> Vec<f64> {
        series.iter().map(|r| r.brix).collect()
    }

    #[test]
    fn test_window_validation() {
        assert!(Window::new(3).is_ok());
        assert!(Window::new(7).is_ok());
        assert!(Window::new(1).is_err());
        assert!(Window::new(4).is_err());
        assert!(Window::new(0).is_err());
        assert_eq!(Window::default().width(), 3);
    }

    #[test]
    fn test_window_deserialize_validates() {
        assert_eq!(serde_json::from_str::<Window>("5").unwrap().width(), 5);
        assert!(serde_json::from_str::<Window>("2").is_err());
    }

    #[test]
    fn test_short_series_is_unchanged() {
        let series = vec![reading("1", 10.0, 1.05, 30.0), reading("2", 20.0, 1.04, 31.0)];
        assert_eq!(smooth(&series, Window::new(3).unwrap()), series);
        assert!(smooth::<Reading>(&[], Window::default()).is_empty());
    }

    #[test]
    fn test_edges_use_clipped_window() {
        let series: Vec<_> = [10.0, 20.0, 30.0, 40.0]
            .iter()
            .enumerate()
            .map(|(i, b)| reading(&i.to_string(), *b, 1.0, 30.0))
            .collect();
        let out = smooth(&series, Window::new(3).unwrap());
        assert_eq!(brix(&out), vec![15.0, 20.0, 30.0, 35.0]);
    }

    #[test]
    fn test_channels_are_independent_and_labels_kept() {
        let series = vec![
            reading("a", 10.0, 1.060, 28.0),
            reading("b", 10.0, 1.050, 30.0),
            reading("c", 10.0, 1.040, 32.0),
        ];
        let out = smooth(&series, Window::new(3).unwrap());
        assert_eq!(out[1].time, "b");
        assert_eq!(out[1].brix, 10.0);
        assert!((out[1].gravity - 1.050).abs() < 1e-9);
        assert!((out[1].temperature - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_values_are_excluded() {
        let series = vec![
            reading("1", 10.0, 1.0, f64::NAN),
            reading("2", f64::NAN, 1.0, f64::NAN),
            reading("3", 30.0, 1.0, f64::NAN),
        ];
        let out = smooth(&series, Window::new(3).unwrap());
        assert_eq!(out[1].brix, 20.0);
        assert_eq!(out[0].brix, 10.0);
        assert!(out.iter().all(|r| r.temperature.is_nan()));
    }

    #[test]
    fn test_sourced_readings_keep_provenance() {
        let series = vec![
            SourcedReading::Live(reading("1", 10.0, 1.0, 30.0)),
            SourcedReading::Live(reading("2", 20.0, 1.0, 30.0)),
            SourcedReading::Simulated(reading("3", 30.0, 1.0, 30.0)),
        ];
        let out = smooth(&series, Window::new(3).unwrap());
        assert!(!out[0].is_simulated());
        assert!(out[2].is_simulated());
        assert_eq!(out[2].reading().brix, 25.0);
    }

    #[test]
    fn test_wide_window() {
        let series: Vec<_> = (0..7)
            .map(|i| reading(&i.to_string(), f64::from(i), 1.0, 30.0))
            .collect();
        let out = smooth(&series, Window::new(5).unwrap());
        // [i-2, i+3) clipped: i=0 -> 0..3, i=3 -> 1..6, i=6 -> 4..7
        assert_eq!(out[0].brix, 1.0);
        assert_eq!(out[3].brix, 3.0);
        assert_eq!(out[6].brix, 5.0);
    }
}
