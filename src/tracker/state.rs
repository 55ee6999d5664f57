//! Tracker state carried from one iteration to the next.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::error_recovery::FailureBudget;
use crate::publish::BeatnoteRecord;

/// Zoom level of the tracking loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerMode {
    /// Wide span around the counter estimate
    Search,
    /// Reduced span, re-centered on the measured peak
    Narrow,
    /// Smallest span that holds the linewidth
    Zoomed,
}

impl fmt::Display for TrackerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackerMode::Search => "SEARCH",
            TrackerMode::Narrow => "NARROW",
            TrackerMode::Zoomed => "ZOOMED",
        };
        f.write_str(name)
    }
}

/// Which analyzer marker plays which role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerAssignment {
    /// Marker moved to the peak
    pub peak: u8,
    /// Marker searching below the peak
    pub lower: u8,
    /// Marker searching above the peak
    pub upper: u8,
}

impl Default for MarkerAssignment {
    fn default() -> Self {
        Self {
            peak: 1,
            lower: 2,
            upper: 3,
        }
    }
}

/// Result of one measured iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatnoteEstimate {
    /// Measured peak frequency (Hz)
    pub center_frequency_hz: f64,
    /// Half-power width, when it could be taken (Hz)
    pub fwhm_hz: Option<f64>,
    /// Centers agree within tolerance and the width is below threshold
    pub stable: bool,
    /// Mode the iteration ran in
    pub mode: TrackerMode,
    /// Peak level (dB)
    pub amplitude_db: f64,
    /// Span swept (Hz)
    pub span_hz: f64,
    /// Resolution bandwidth used (Hz)
    pub resolution_bandwidth_hz: f64,
}

impl BeatnoteEstimate {
    /// Record for the publish sink, stamped now.
    pub fn to_record(&self) -> BeatnoteRecord {
        BeatnoteRecord {
            timestamp: Utc::now(),
            center_frequency_hz: self.center_frequency_hz,
            fwhm_hz: self.fwhm_hz,
            stable: self.stable,
            mode: self.mode,
            resolution_bandwidth_hz: self.resolution_bandwidth_hz,
        }
    }
}

/// The last `capacity` measured centers.
#[derive(Debug, Clone)]
pub struct StabilityWindow {
    centers: VecDeque<f64>,
    capacity: usize,
}

impl StabilityWindow {
    /// Window that judges the last `capacity` centers.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            centers: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a center, dropping the oldest once full.
    pub fn push(&mut self, center_hz: f64) {
        if self.centers.len() == self.capacity {
            self.centers.pop_front();
        }
        self.centers.push_back(center_hz);
    }

    /// Forget all centers.
    pub fn clear(&mut self) {
        self.centers.clear();
    }

    /// Number of centers held.
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    /// Whether no center is held.
    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// Max minus min of the held centers.
    pub fn spread(&self) -> Option<f64> {
        let min = self.centers.iter().copied().reduce(f64::min)?;
        let max = self.centers.iter().copied().reduce(f64::max)?;
        Some(max - min)
    }

    /// Full, and every held center lies within `tolerance_hz` of every other.
    pub fn is_stable(&self, tolerance_hz: f64) -> bool {
        self.centers.len() == self.capacity
            && self.spread().is_some_and(|spread| spread <= tolerance_hz)
    }
}

/// Everything the tracker remembers between iterations.
#[derive(Debug, Clone)]
pub struct TrackerState {
    /// Current zoom level
    pub mode: TrackerMode,
    /// Last measured peak, the center of the next NARROW/ZOOMED sweep
    pub center_hz: Option<f64>,
    /// Last measured width, sizes the ZOOMED span
    pub fwhm_hz: Option<f64>,
    /// Span of the last sweep
    pub span_hz: Option<f64>,
    /// Resolution bandwidth of the last sweep
    pub rbw_hz: Option<f64>,
    /// Recent centers for the stability judgment
    pub history: StabilityWindow,
    /// Counter frequency seen in the previous iteration
    pub last_counter_hz: Option<f64>,
    /// Consecutive link failures
    pub failures: FailureBudget,
    /// Latest published estimate
    pub last_estimate: Option<BeatnoteEstimate>,
    /// Marker roles
    pub markers: MarkerAssignment,
    /// Iterations started
    pub iterations: u64,
}

impl TrackerState {
    /// Fresh state in SEARCH mode.
    pub fn new(stable_count: usize, max_consecutive_failures: u32) -> Self {
        Self {
            mode: TrackerMode::Search,
            center_hz: None,
            fwhm_hz: None,
            span_hz: None,
            rbw_hz: None,
            history: StabilityWindow::new(stable_count),
            last_counter_hz: None,
            failures: FailureBudget::new(max_consecutive_failures),
            last_estimate: None,
            markers: MarkerAssignment::default(),
            iterations: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_needs_full_history() {
        let mut window = StabilityWindow::new(3);
        window.push(21.0e6);
        window.push(21.0e6 + 100.0);
        assert!(!window.is_stable(1.0e3));
        window.push(21.0e6 - 100.0);
        assert!(window.is_stable(1.0e3));
        assert_eq!(window.spread(), Some(200.0));
    }

    #[test]
    fn test_window_drops_oldest() {
        let mut window = StabilityWindow::new(2);
        window.push(0.0);
        window.push(5_000.0);
        assert!(!window.is_stable(1.0e3));
        window.push(5_500.0);
        assert_eq!(window.len(), 2);
        assert!(window.is_stable(1.0e3));
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.spread(), None);
    }

    #[test]
    fn test_mode_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TrackerMode::Zoomed).unwrap(),
            "\"zoomed\""
        );
        assert_eq!(TrackerMode::Narrow.to_string(), "NARROW");
    }
}
