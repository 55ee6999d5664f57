//! Spectrum analyzer support.
//!
//! - [`fseb20`]: the command table of the R&S FSEB20, generic over any
//!   [`Transport`](crate::adapters::Transport).
//! - [`sweep`]: frequency range and bandwidth ladder rules applied before a
//!   setting is written.
//! - [`simulated`]: an in-process analyzer answering the same command set,
//!   used by the tests and by `--simulate`.

pub mod fseb20;
pub mod simulated;
pub mod sweep;

use serde::Serialize;

pub use fseb20::{AnalyzerOptions, SpectrumAnalyzer, MARKER_COUNT};
pub use simulated::{SimulatedAnalyzer, SimulatedSignal};
pub use sweep::{FrequencyWindow, RangePolicy, SweepSetting};

/// Frequency and amplitude reported by one marker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarkerReading {
    /// Marker position (Hz)
    pub frequency_hz: f64,
    /// Trace level at the marker (dB)
    pub amplitude_db: f64,
}
