//! Sweep settings and the analyzer's value ranges.
//!
//! Filter bandwidths on the FSEB20 come in 1-2-3-5 steps per decade. The
//! analyzer rounds any other value itself, silently; the driver snaps before
//! sending so the value it reports is the value the instrument uses.
//!
//! The frequency range is 9 kHz to 7 GHz. A center/span pair whose window
//! leaves that range is either rejected or pulled back inside it, per
//! [`RangePolicy`]. Nothing out of range is ever written.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, MonitorError};

/// Lowest frequency the analyzer sweeps.
pub const MIN_FREQUENCY_HZ: f64 = 9.0e3;
/// Highest frequency the analyzer sweeps.
pub const MAX_FREQUENCY_HZ: f64 = 7.0e9;

const LADDER_MANTISSAS: [f64; 4] = [1.0, 2.0, 3.0, 5.0];

/// Inclusive limits of a filter bandwidth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthLimits {
    /// Narrowest filter
    pub min_hz: f64,
    /// Widest filter
    pub max_hz: f64,
}

impl BandwidthLimits {
    /// Whether `hz` lies within the limits.
    pub fn contains(&self, hz: f64) -> bool {
        hz >= self.min_hz && hz <= self.max_hz
    }
}

/// Resolution bandwidth range.
pub const RBW_LIMITS: BandwidthLimits = BandwidthLimits {
    min_hz: 10.0,
    max_hz: 10.0e6,
};

/// Video bandwidth range.
pub const VBW_LIMITS: BandwidthLimits = BandwidthLimits {
    min_hz: 1.0,
    max_hz: 10.0e6,
};

/// All 1-2-3-5 steps within `limits`, ascending.
pub fn ladder(limits: BandwidthLimits) -> Vec<f64> {
    let first_decade = limits.min_hz.log10().floor() as i32;
    let last_decade = limits.max_hz.log10().ceil() as i32;
    (first_decade..=last_decade)
        .flat_map(|exp| {
            let decade = 10f64.powi(exp);
            LADDER_MANTISSAS.iter().map(move |m| m * decade)
        })
        .filter(|&step| step >= limits.min_hz * (1.0 - 1e-9) && step <= limits.max_hz * (1.0 + 1e-9))
        .collect()
}

/// Snap `hz` to the nearest ladder step within `limits`.
///
/// Values outside the limits clamp to the boundary. "Nearest" is measured on
/// a log scale, so 4 Hz snaps to 5 Hz; exact log ties go to the narrower step.
pub fn snap_bandwidth(hz: f64, limits: BandwidthLimits) -> f64 {
    if hz.is_nan() || hz <= limits.min_hz {
        return limits.min_hz;
    }
    if hz >= limits.max_hz {
        return limits.max_hz;
    }
    let target = hz.ln();
    ladder(limits)
        .into_iter()
        .fold((limits.min_hz, f64::INFINITY), |(best, best_dist), step| {
            let dist = (step.ln() - target).abs();
            if dist < best_dist - 1e-12 {
                (step, dist)
            } else {
                (best, best_dist)
            }
        })
        .0
}

/// Snap a resolution bandwidth request.
pub fn snap_rbw(hz: f64) -> f64 {
    snap_bandwidth(hz, RBW_LIMITS)
}

/// Snap a video bandwidth request.
pub fn snap_vbw(hz: f64) -> f64 {
    snap_bandwidth(hz, VBW_LIMITS)
}

/// What to do when a requested frequency window leaves the analyzer's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePolicy {
    /// Fail with [`MonitorError::OutOfRange`]; nothing is written.
    #[default]
    Reject,
    /// Shrink the span and shift the center until the window fits.
    Clamp,
}

/// A validated center/span pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyWindow {
    /// Center frequency (Hz)
    pub center_hz: f64,
    /// Span (Hz)
    pub span_hz: f64,
}

impl FrequencyWindow {
    /// Lower edge of the window.
    pub fn start_hz(&self) -> f64 {
        self.center_hz - self.span_hz / 2.0
    }

    /// Upper edge of the window.
    pub fn stop_hz(&self) -> f64 {
        self.center_hz + self.span_hz / 2.0
    }

    /// Whether `hz` lies inside the window.
    pub fn contains(&self, hz: f64) -> bool {
        hz >= self.start_hz() && hz <= self.stop_hz()
    }

    /// Validate a center/span pair against the analyzer's range.
    pub fn resolve(center_hz: f64, span_hz: f64, policy: RangePolicy) -> AppResult<Self> {
        if !center_hz.is_finite() || !span_hz.is_finite() || span_hz <= 0.0 {
            return Err(MonitorError::OutOfRange(format!(
                "center {} Hz / span {} Hz is not a sweepable window",
                center_hz, span_hz
            )));
        }

        let window = Self { center_hz, span_hz };
        if window.start_hz() >= MIN_FREQUENCY_HZ && window.stop_hz() <= MAX_FREQUENCY_HZ {
            return Ok(window);
        }

        match policy {
            RangePolicy::Reject => Err(MonitorError::OutOfRange(format!(
                "window {:.0}-{:.0} Hz outside {:.0}-{:.0} Hz",
                window.start_hz(),
                window.stop_hz(),
                MIN_FREQUENCY_HZ,
                MAX_FREQUENCY_HZ
            ))),
            RangePolicy::Clamp => {
                let span_hz = span_hz.min(MAX_FREQUENCY_HZ - MIN_FREQUENCY_HZ);
                let lowest = MIN_FREQUENCY_HZ + span_hz / 2.0;
                let highest = MAX_FREQUENCY_HZ - span_hz / 2.0;
                let center_hz = if lowest >= highest {
                    (MIN_FREQUENCY_HZ + MAX_FREQUENCY_HZ) / 2.0
                } else {
                    center_hz.clamp(lowest, highest)
                };
                Ok(Self { center_hz, span_hz })
            }
        }
    }
}

/// One complete display setting, built fresh for every tracking iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSetting {
    /// Center frequency (Hz)
    pub center_frequency: f64,
    /// Span (Hz)
    pub span: f64,
    /// Resolution bandwidth (Hz), on the ladder
    pub resolution_bandwidth: f64,
    /// Video bandwidth (Hz), on the ladder
    pub video_bandwidth: f64,
}

impl SweepSetting {
    /// Build a setting, snapping both bandwidths and validating the window.
    pub fn new(
        center_hz: f64,
        span_hz: f64,
        rbw_hz: f64,
        vbw_hz: f64,
        policy: RangePolicy,
    ) -> AppResult<Self> {
        let window = FrequencyWindow::resolve(center_hz, span_hz, policy)?;
        Ok(Self {
            center_frequency: window.center_hz,
            span: window.span_hz,
            resolution_bandwidth: snap_rbw(rbw_hz),
            video_bandwidth: snap_vbw(vbw_hz),
        })
    }

    /// The frequency window this setting sweeps.
    pub fn window(&self) -> FrequencyWindow {
        FrequencyWindow {
            center_hz: self.center_frequency,
            span_hz: self.span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rbw_ladder_bounds() {
        let steps = ladder(RBW_LIMITS);
        assert_eq!(steps.first().copied(), Some(10.0));
        assert_eq!(steps.last().copied(), Some(10.0e6));
        assert_eq!(&steps[..5], &[10.0, 20.0, 30.0, 50.0, 100.0]);
        // 10, 20, 30, 50 for each of six decades, then 10 MHz
        assert_eq!(steps.len(), 6 * 4 + 1);
    }

    #[test]
    fn test_vbw_ladder_starts_at_one_hertz() {
        let steps = ladder(VBW_LIMITS);
        assert_eq!(&steps[..4], &[1.0, 2.0, 3.0, 5.0]);
        assert_eq!(steps.len(), 7 * 4 + 1);
    }

    #[test]
    fn test_snap_exact_steps_unchanged() {
        for step in ladder(RBW_LIMITS) {
            assert_eq!(snap_rbw(step), step);
        }
    }

    #[test]
    fn test_snap_to_nearest_step() {
        assert_eq!(snap_rbw(24.0), 20.0);
        assert_eq!(snap_rbw(26.0), 30.0);
        assert_eq!(snap_rbw(4_100.0), 5_000.0);
        assert_eq!(snap_rbw(7_000.0), 5_000.0);
        assert_eq!(snap_rbw(8_000.0), 10_000.0);
        assert_eq!(snap_vbw(1.4), 1.0);
        assert_eq!(snap_vbw(2.6), 3.0);
    }

    #[test]
    fn test_snap_result_always_on_ladder_and_in_range() {
        let rbw_steps = ladder(RBW_LIMITS);
        let vbw_steps = ladder(VBW_LIMITS);
        let mut hz = 0.01;
        while hz < 1.0e8 {
            let rbw = snap_rbw(hz);
            let vbw = snap_vbw(hz);
            assert!(rbw_steps.contains(&rbw), "{} -> {}", hz, rbw);
            assert!(vbw_steps.contains(&vbw), "{} -> {}", hz, vbw);
            assert!(RBW_LIMITS.contains(rbw));
            assert!(VBW_LIMITS.contains(vbw));
            hz *= 1.37;
        }
    }

    #[test]
    fn test_snap_clamps_out_of_range() {
        assert_eq!(snap_rbw(1.0), 10.0);
        assert_eq!(snap_rbw(-5.0), 10.0);
        assert_eq!(snap_rbw(50.0e6), 10.0e6);
        assert_eq!(snap_vbw(0.1), 1.0);
        assert_eq!(snap_vbw(1.0e9), 10.0e6);
        assert_eq!(snap_rbw(f64::NAN), 10.0);
    }

    #[test]
    fn test_window_inside_range_is_unchanged() {
        for policy in [RangePolicy::Reject, RangePolicy::Clamp] {
            let w = FrequencyWindow::resolve(21.0e6, 5.0e6, policy).unwrap();
            assert_eq!(w.center_hz, 21.0e6);
            assert_eq!(w.span_hz, 5.0e6);
        }
    }

    #[test]
    fn test_reject_below_minimum() {
        let err = FrequencyWindow::resolve(1.0e6, 5.0e6, RangePolicy::Reject).unwrap_err();
        assert!(matches!(err, MonitorError::OutOfRange(_)));
    }

    #[test]
    fn test_reject_above_maximum() {
        assert!(FrequencyWindow::resolve(6.999e9, 10.0e6, RangePolicy::Reject).is_err());
    }

    #[test]
    fn test_clamp_shifts_center_inside() {
        let w = FrequencyWindow::resolve(1.0e6, 5.0e6, RangePolicy::Clamp).unwrap();
        assert_eq!(w.span_hz, 5.0e6);
        assert!((w.start_hz() - MIN_FREQUENCY_HZ).abs() < 1e-6);

        let w = FrequencyWindow::resolve(6.999e9, 10.0e6, RangePolicy::Clamp).unwrap();
        assert!((w.stop_hz() - MAX_FREQUENCY_HZ).abs() < 1e-3);
    }

    #[test]
    fn test_clamp_shrinks_oversized_span() {
        let w = FrequencyWindow::resolve(3.0e9, 10.0e9, RangePolicy::Clamp).unwrap();
        assert!(w.start_hz() >= MIN_FREQUENCY_HZ - 1e-3);
        assert!(w.stop_hz() <= MAX_FREQUENCY_HZ + 1e-3);
    }

    #[test]
    fn test_every_accepted_window_is_in_range() {
        let centers = [0.0, 5.0e3, 9.0e3, 1.0e6, 21.0e6, 3.5e9, 6.9e9, 7.0e9, 8.0e9];
        let spans = [1.0, 250.0, 5.0e6, 1.0e9, 7.0e9, 1.0e10];
        for &c in &centers {
            for &s in &spans {
                for policy in [RangePolicy::Reject, RangePolicy::Clamp] {
                    if let Ok(w) = FrequencyWindow::resolve(c, s, policy) {
                        assert!(w.start_hz() >= MIN_FREQUENCY_HZ - 1e-3, "{:?}", w);
                        assert!(w.stop_hz() <= MAX_FREQUENCY_HZ + 1e-3, "{:?}", w);
                    } else {
                        assert_eq!(policy, RangePolicy::Reject);
                    }
                }
            }
        }
    }

    #[test]
    fn test_non_positive_span_always_rejected() {
        for policy in [RangePolicy::Reject, RangePolicy::Clamp] {
            assert!(FrequencyWindow::resolve(21.0e6, 0.0, policy).is_err());
            assert!(FrequencyWindow::resolve(21.0e6, -1.0, policy).is_err());
            assert!(FrequencyWindow::resolve(f64::NAN, 1.0, policy).is_err());
        }
    }

    #[test]
    fn test_sweep_setting_snaps_bandwidths() {
        let s = SweepSetting::new(21.0e6, 50.0e3, 900.0, 2_400.0, RangePolicy::Reject).unwrap();
        assert_eq!(s.resolution_bandwidth, 1_000.0);
        assert_eq!(s.video_bandwidth, 2_000.0);
        assert!(s.window().contains(21.0e6));
    }
}
