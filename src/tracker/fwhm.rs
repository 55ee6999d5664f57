//! Half-power width by stepping markers away from the peak.
//!
//! Starting at the peak, a search marker steps outward one trace point at a
//! time until the level falls `drop_db` below the peak. The crossing frequency
//! is interpolated linearly between the last point above and the first point
//! at or below the target level. The search never leaves the swept window; a
//! skirt that runs off-screen yields no crossing.

use async_trait::async_trait;

use crate::adapters::Transport;
use crate::error::{AppResult, MonitorError};
use crate::instrument::{FrequencyWindow, MarkerReading, SpectrumAnalyzer};

use super::state::MarkerAssignment;

/// Direction of a crossing search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Below the peak
    Lower,
    /// Above the peak
    Upper,
}

impl Side {
    fn sign(self) -> f64 {
        match self {
            Side::Lower => -1.0,
            Side::Upper => 1.0,
        }
    }
}

/// Reads the trace level at a frequency.
#[async_trait]
pub trait LevelSource: Send {
    /// Level (dB) at `hz`, read on behalf of the `side` search.
    async fn amplitude_at(&mut self, side: Side, hz: f64) -> AppResult<f64>;
}

/// Reads the analyzer trace with the lower and upper markers.
pub struct MarkerLevels<'a, T> {
    analyzer: &'a mut SpectrumAnalyzer<T>,
    markers: MarkerAssignment,
}

impl<'a, T: Transport> MarkerLevels<'a, T> {
    /// Read through `analyzer` using the markers in `markers`.
    pub fn new(analyzer: &'a mut SpectrumAnalyzer<T>, markers: MarkerAssignment) -> Self {
        Self { analyzer, markers }
    }
}

#[async_trait]
impl<'a, T: Transport> LevelSource for MarkerLevels<'a, T> {
    async fn amplitude_at(&mut self, side: Side, hz: f64) -> AppResult<f64> {
        let marker = match side {
            Side::Lower => self.markers.lower,
            Side::Upper => self.markers.upper,
        };
        self.analyzer.set_marker(marker, hz).await?;
        self.analyzer.read_marker_amplitude(marker).await
    }
}

/// Parameters of one width measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossingSearch {
    /// Distance between sampled points (Hz)
    pub step_hz: f64,
    /// Level drop that defines the width (dB)
    pub drop_db: f64,
    /// Window the search must stay inside
    pub window: FrequencyWindow,
}

impl CrossingSearch {
    /// Search over `window` stepping one trace point of a `points`-point sweep.
    pub fn over_trace(window: FrequencyWindow, points: u32, drop_db: f64) -> Self {
        Self {
            step_hz: window.span_hz / f64::from(points.max(2) - 1),
            drop_db,
            window,
        }
    }
}

/// The two half-power points around a peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfPowerPoints {
    /// Crossing below the peak (Hz)
    pub lower_hz: f64,
    /// Crossing above the peak (Hz)
    pub upper_hz: f64,
}

impl HalfPowerPoints {
    /// Full width between the crossings.
    pub fn width_hz(&self) -> f64 {
        self.upper_hz - self.lower_hz
    }
}

fn interpolate(above: (f64, f64), below: (f64, f64), target_db: f64) -> f64 {
    let (f_above, a_above) = above;
    let (f_below, a_below) = below;
    let fall = a_above - a_below;
    if fall.abs() < f64::EPSILON {
        return f_below;
    }
    f_above + (f_below - f_above) * (a_above - target_db) / fall
}

/// Step away from `peak` on `side` until the level crosses the target.
///
/// Returns `Ok(None)` when the window edge is reached first.
pub async fn find_crossing<P: LevelSource + ?Sized>(
    levels: &mut P,
    peak: MarkerReading,
    side: Side,
    search: &CrossingSearch,
) -> AppResult<Option<f64>> {
    if !(search.step_hz.is_finite() && search.step_hz > 0.0) {
        return Err(MonitorError::Measurement(format!(
            "invalid crossing search step {} Hz",
            search.step_hz
        )));
    }
    let target_db = peak.amplitude_db - search.drop_db;
    let mut previous = (peak.frequency_hz, peak.amplitude_db);
    let mut steps = 1u32;
    loop {
        let hz = peak.frequency_hz + side.sign() * search.step_hz * f64::from(steps);
        if !search.window.contains(hz) {
            return Ok(None);
        }
        let level = levels.amplitude_at(side, hz).await?;
        if level <= target_db {
            return Ok(Some(interpolate(previous, (hz, level), target_db)));
        }
        previous = (hz, level);
        steps += 1;
    }
}

/// Measure both crossings around `peak`.
///
/// Fails with [`MonitorError::Measurement`] when either side has no crossing
/// inside the window.
pub async fn measure_fwhm<P: LevelSource + ?Sized>(
    levels: &mut P,
    peak: MarkerReading,
    search: &CrossingSearch,
) -> AppResult<HalfPowerPoints> {
    let Some(lower_hz) = find_crossing(levels, peak, Side::Lower, search).await? else {
        return Err(MonitorError::Measurement(format!(
            "no {} dB crossing below {:.1} Hz within the span",
            search.drop_db, peak.frequency_hz
        )));
    };
    let Some(upper_hz) = find_crossing(levels, peak, Side::Upper, search).await? else {
        return Err(MonitorError::Measurement(format!(
            "no {} dB crossing above {:.1} Hz within the span",
            search.drop_db, peak.frequency_hz
        )));
    };
    Ok(HalfPowerPoints { lower_hz, upper_hz })
}
