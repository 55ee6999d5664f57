//! Simulated FSEB20
//!
//! Answers the subset of the analyzer's command language that
//! [`SpectrumAnalyzer`](super::SpectrumAnalyzer) emits, against a model of a
//! single beat note on top of a flat noise floor. The trace shape is a
//! Lorentzian whose width is the larger of the signal linewidth and the
//! resolution bandwidth, so narrowing the filter sharpens the peak the way it
//! does on the real instrument.
//!
//! Clones share state: keep one handle to move the signal or stall the sweep
//! while the tracker owns another.
//!
//! ```
//! use beatnote_monitor::instrument::{SimulatedAnalyzer, SimulatedSignal};
//!
//! let sim = SimulatedAnalyzer::new().with_signal(SimulatedSignal {
//!     center_hz: 21.000_05e6,
//!     ..SimulatedSignal::default()
//! });
//! sim.set_peak_level(-120.0); // beat note gone
//! ```

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::fseb20::{MARKER_COUNT, SWEEPING_BIT};
use super::sweep::{snap_rbw, snap_vbw, MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ};
use crate::adapters::Transport;
use crate::error::{AppResult, MonitorError};

/// Identity reported by `*IDN?`.
pub const SIMULATED_IDENTITY: &str = "Rohde&Schwarz,FSEB 20,839337/007,1.71";

/// SCPI "not a number", returned when an N-dB-down point does not exist.
const SCPI_NAN: &str = "9.91E37";

/// The beat note seen by the simulated analyzer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedSignal {
    /// Beat note frequency (Hz)
    pub center_hz: f64,
    /// Intrinsic linewidth, full width at half maximum (Hz)
    pub fwhm_hz: f64,
    /// Level at the peak (dB)
    pub peak_db: f64,
    /// Displayed noise floor (dB)
    pub noise_floor_db: f64,
}

impl Default for SimulatedSignal {
    fn default() -> Self {
        Self {
            center_hz: 21.000_05e6,
            fwhm_hz: 40.0,
            peak_db: -10.0,
            noise_floor_db: -100.0,
        }
    }
}

impl SimulatedSignal {
    /// Trace level at `hz` with a resolution filter of `rbw_hz`.
    pub fn level_at(&self, hz: f64, rbw_hz: f64) -> f64 {
        let half_width = self.fwhm_hz.max(rbw_hz) / 2.0;
        let offset = (hz - self.center_hz) / half_width;
        let signal_db = self.peak_db - 10.0 * (1.0 + offset * offset).log10();
        10.0 * (10f64.powf(signal_db / 10.0) + 10f64.powf(self.noise_floor_db / 10.0)).log10()
    }

    /// The two frequencies where the signal is `drop_db` below `reference_db`.
    ///
    /// `None` when the level would sink into the noise floor.
    fn points_below(&self, reference_db: f64, drop_db: f64, rbw_hz: f64) -> Option<(f64, f64)> {
        let target = reference_db - drop_db;
        if target <= self.noise_floor_db + 1.0 || target >= self.peak_db {
            return None;
        }
        let half_width = self.fwhm_hz.max(rbw_hz) / 2.0;
        let offset = (10f64.powf((self.peak_db - target) / 10.0) - 1.0).sqrt() * half_width;
        Some((self.center_hz - offset, self.center_hz + offset))
    }
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    enabled: bool,
    frequency_hz: f64,
    ndb_db: f64,
    ndb_enabled: bool,
}

struct SimState {
    signal: SimulatedSignal,
    points: u32,
    center_hz: f64,
    span_hz: f64,
    rbw_hz: f64,
    vbw_hz: f64,
    rbw_auto: bool,
    rbw_ratio: f64,
    continuous: bool,
    reference_level_dbm: f64,
    attenuation_db: f64,
    y_range_db: f64,
    markers: [Marker; MARKER_COUNT as usize],
    sweep_started: Option<Instant>,
    fixed_sweep_time: Option<Duration>,
    sweeps: u64,
    hang: bool,
    jitter: Option<(StdRng, f64)>,
    errors: VecDeque<(i32, String)>,
    pending: VecDeque<String>,
    sent: Vec<String>,
}

impl SimState {
    fn new() -> Self {
        let mut state = Self {
            signal: SimulatedSignal::default(),
            points: 500,
            center_hz: 0.0,
            span_hz: 0.0,
            rbw_hz: 0.0,
            vbw_hz: 0.0,
            rbw_auto: true,
            rbw_ratio: 0.02,
            continuous: true,
            reference_level_dbm: 0.0,
            attenuation_db: 0.0,
            y_range_db: 0.0,
            markers: [Marker {
                enabled: false,
                frequency_hz: 0.0,
                ndb_db: 3.0,
                ndb_enabled: false,
            }; MARKER_COUNT as usize],
            sweep_started: None,
            fixed_sweep_time: None,
            sweeps: 0,
            hang: false,
            jitter: None,
            errors: VecDeque::new(),
            pending: VecDeque::new(),
            sent: Vec::new(),
        };
        state.reset();
        state
    }

    fn reset(&mut self) {
        self.center_hz = 3.5e9;
        self.span_hz = MAX_FREQUENCY_HZ - MIN_FREQUENCY_HZ;
        self.rbw_hz = 3.0e6;
        self.vbw_hz = 3.0e6;
        self.rbw_auto = true;
        self.rbw_ratio = 0.02;
        self.continuous = true;
        self.reference_level_dbm = -20.0;
        self.attenuation_db = 10.0;
        self.y_range_db = 100.0;
        self.sweep_started = None;
        for marker in &mut self.markers {
            marker.enabled = false;
            marker.frequency_hz = self.center_hz;
            marker.ndb_db = 3.0;
            marker.ndb_enabled = false;
        }
    }

    fn start_hz(&self) -> f64 {
        self.center_hz - self.span_hz / 2.0
    }

    fn step_hz(&self) -> f64 {
        self.span_hz / f64::from(self.points.max(2) - 1)
    }

    /// Nearest trace point to `hz`.
    fn on_grid(&self, hz: f64) -> f64 {
        let last = f64::from(self.points.max(2) - 1);
        let index = ((hz - self.start_hz()) / self.step_hz()).round().clamp(0.0, last);
        self.start_hz() + index * self.step_hz()
    }

    fn sweep_time(&self) -> Duration {
        self.fixed_sweep_time.unwrap_or_else(|| {
            let seconds = (2.5 * self.span_hz / (self.rbw_hz * self.rbw_hz)).max(0.005);
            Duration::from_secs_f64(seconds)
        })
    }

    fn is_sweeping(&self) -> bool {
        if self.hang || self.continuous {
            return true;
        }
        self.sweep_started
            .is_some_and(|started| started.elapsed() < self.sweep_time())
    }

    fn level_at(&mut self, hz: f64) -> f64 {
        let level = self.signal.level_at(hz, self.rbw_hz);
        match self.jitter.as_mut() {
            Some((rng, amount)) if *amount > 0.0 => level + rng.gen_range(-*amount..=*amount),
            _ => level,
        }
    }

    fn set_span(&mut self, hz: f64) {
        self.span_hz = hz.clamp(10.0, MAX_FREQUENCY_HZ - MIN_FREQUENCY_HZ);
        if self.rbw_auto {
            self.rbw_hz = snap_rbw(self.span_hz * self.rbw_ratio);
        }
    }

    fn push_error(&mut self, code: i32, message: &str) {
        self.errors.push_back((code, message.to_string()));
    }

    fn handle(&mut self, frame: &str) -> Option<String> {
        let frame = frame.trim();
        let (header, argument) = match frame.split_once(' ') {
            Some((header, argument)) => (header, argument.trim()),
            None => (frame, ""),
        };
        let header = header.trim_start_matches(':').to_ascii_uppercase();
        let number = parse_argument(argument);
        let flag = parse_flag(argument);

        match header.as_str() {
            "*IDN?" => Some(SIMULATED_IDENTITY.to_string()),
            "*RST" => {
                self.reset();
                None
            }
            "*CLS" => {
                self.errors.clear();
                None
            }
            "SYSTEM:ERROR?" => Some(match self.errors.pop_front() {
                Some((code, message)) => format!("{},\"{}\"", code, message),
                None => "0,\"No error\"".to_string(),
            }),
            "SENSE:FREQUENCY:CENTER" => {
                self.apply(number, |s, hz| s.center_hz = hz);
                None
            }
            "SENSE:FREQUENCY:CENTER?" => Some(format_reply(self.center_hz)),
            "SENSE:FREQUENCY:SPAN" => {
                self.apply(number, |s, hz| s.set_span(hz));
                None
            }
            "SENSE:FREQUENCY:SPAN?" => Some(format_reply(self.span_hz)),
            "SENSE:BANDWIDTH:RESOLUTION" => {
                self.apply(number, |s, hz| {
                    s.rbw_auto = false;
                    s.rbw_hz = snap_rbw(hz);
                });
                None
            }
            "SENSE:BANDWIDTH:RESOLUTION?" => Some(format_reply(self.rbw_hz)),
            "SENSE:BANDWIDTH:RESOLUTION:AUTO" => {
                self.apply(flag, |s, on| {
                    s.rbw_auto = on;
                    if on {
                        s.rbw_hz = snap_rbw(s.span_hz * s.rbw_ratio);
                    }
                });
                None
            }
            "SENSE:BANDWIDTH:RESOLUTION:RATIO" => {
                self.apply(number, |s, ratio| s.rbw_ratio = ratio);
                None
            }
            "SENSE:BANDWIDTH:VIDEO" => {
                self.apply(number, |s, hz| s.vbw_hz = snap_vbw(hz));
                None
            }
            "SENSE:BANDWIDTH:VIDEO?" => Some(format_reply(self.vbw_hz)),
            "SENSE:SWEEP:TIME?" => Some(format_reply(self.sweep_time().as_secs_f64())),
            "INITIATE1:CONTINUOUS" => {
                self.apply(flag, |s, on| s.continuous = on);
                None
            }
            "INITIATE1:CONTINUOUS?" => Some(u8::from(self.continuous).to_string()),
            "INITIATE1:IMMEDIATE" => {
                self.sweep_started = Some(Instant::now());
                self.sweeps += 1;
                None
            }
            "STATUS:OPERATION:CONDITION?" => {
                let condition = if self.is_sweeping() { SWEEPING_BIT } else { 0 };
                Some(condition.to_string())
            }
            "DISPLAY:WINDOW1:TRACE1:Y:SCALE:RLEVEL" => {
                self.apply(number, |s, dbm| s.reference_level_dbm = dbm);
                None
            }
            "DISPLAY:WINDOW1:TRACE1:Y:SCALE:RLEVEL?" => {
                Some(format_reply(self.reference_level_dbm))
            }
            "DISPLAY:WINDOW1:TRACE1:Y:SCALE" => {
                self.apply(number, |s, db| s.y_range_db = db);
                None
            }
            "DISPLAY:WINDOW1:TRACE1:Y:SCALE?" => Some(format_reply(self.y_range_db)),
            "INPUT:ATTENUATION" => {
                self.apply(number, |s, db| s.attenuation_db = db);
                None
            }
            "INPUT:ATTENUATION?" => Some(format_reply(self.attenuation_db)),
            _ => match header.strip_prefix("CALCULATE1:MARKER") {
                Some(rest) => self.handle_marker(rest, number, flag),
                None => {
                    self.push_error(-113, "Undefined header");
                    None
                }
            },
        }
    }

    fn handle_marker(
        &mut self,
        rest: &str,
        number: Option<f64>,
        flag: Option<bool>,
    ) -> Option<String> {
        let Some((index, function)) = rest.split_once(':') else {
            self.push_error(-113, "Undefined header");
            return None;
        };
        let index: usize = match index.parse() {
            Ok(index) if (1..=usize::from(MARKER_COUNT)).contains(&index) => index,
            _ => {
                self.push_error(-114, "Header suffix out of range");
                return None;
            }
        };
        let slot = index - 1;

        match function {
            "STATE" => {
                self.apply(flag, |s, on| s.markers[slot].enabled = on);
                None
            }
            "STATE?" => Some(u8::from(self.markers[slot].enabled).to_string()),
            "TRACE" => None,
            "X" => {
                self.apply(number, |s, hz| {
                    let hz = s.on_grid(hz);
                    let marker = &mut s.markers[slot];
                    marker.enabled = true;
                    marker.frequency_hz = hz;
                });
                None
            }
            "X?" => Some(format_reply(self.markers[slot].frequency_hz)),
            "Y?" => {
                let hz = self.markers[slot].frequency_hz;
                Some(format_reply(self.level_at(hz)))
            }
            "MAXIMUM:PEAK" => {
                let hz = self.on_grid(self.signal.center_hz);
                let marker = &mut self.markers[slot];
                marker.enabled = true;
                marker.frequency_hz = hz;
                None
            }
            "FUNCTION:NDBDOWN" => {
                self.apply(number, |s, db| s.markers[slot].ndb_db = db);
                None
            }
            "FUNCTION:NDBDOWN:STATE" => {
                self.apply(flag, |s, on| s.markers[slot].ndb_enabled = on);
                None
            }
            "FUNCTION:NDBDOWN:RESULT?" => Some(match self.ndb_points(slot) {
                Some((low, high)) => format_reply(high - low),
                None => SCPI_NAN.to_string(),
            }),
            "FUNCTION:NDBDOWN:FREQUENCY?" => Some(match self.ndb_points(slot) {
                Some((low, high)) => format!("{},{}", format_reply(low), format_reply(high)),
                None => format!("{},{}", SCPI_NAN, SCPI_NAN),
            }),
            _ => {
                self.push_error(-113, "Undefined header");
                None
            }
        }
    }

    fn ndb_points(&self, slot: usize) -> Option<(f64, f64)> {
        let marker = self.markers[slot];
        if !marker.ndb_enabled {
            return None;
        }
        let reference = self.signal.level_at(marker.frequency_hz, self.rbw_hz);
        let (low, high) = self
            .signal
            .points_below(reference, marker.ndb_db, self.rbw_hz)?;
        let stop = self.start_hz() + self.span_hz;
        (low >= self.start_hz() && high <= stop).then_some((low, high))
    }

    fn apply<V>(&mut self, value: Option<V>, set: impl FnOnce(&mut Self, V)) {
        match value {
            Some(value) => set(self, value),
            None => self.push_error(-224, "Illegal parameter value"),
        }
    }
}

/// Numeric argument with an optional unit suffix (`-10dBm`, `250`).
fn parse_argument(argument: &str) -> Option<f64> {
    argument
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .trim()
        .parse()
        .ok()
        .filter(|value: &f64| value.is_finite())
}

fn parse_flag(argument: &str) -> Option<bool> {
    match argument.to_ascii_uppercase().as_str() {
        "ON" | "1" => Some(true),
        "OFF" | "0" => Some(false),
        _ => None,
    }
}

fn format_reply(value: f64) -> String {
    format!("{:E}", value)
}

/// In-process FSEB20 behind the [`Transport`] capability
#[derive(Clone)]
pub struct SimulatedAnalyzer {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAnalyzer {
    /// Analyzer in its reset state, showing the default beat note.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Replace the simulated beat note.
    pub fn with_signal(self, signal: SimulatedSignal) -> Self {
        self.set_signal(signal);
        self
    }

    /// Number of trace points per sweep.
    pub fn with_points(self, points: u32) -> Self {
        self.lock().points = points.max(2);
        self
    }

    /// Use a fixed sweep duration instead of deriving it from span and RBW.
    pub fn with_sweep_time(self, sweep_time: Duration) -> Self {
        self.lock().fixed_sweep_time = Some(sweep_time);
        self
    }

    /// Add uniform level noise of up to `amount_db` to every marker reading.
    pub fn with_jitter(self, seed: u64, amount_db: f64) -> Self {
        self.lock().jitter = Some((StdRng::seed_from_u64(seed), amount_db.abs()));
        self
    }

    /// Replace the simulated beat note.
    pub fn set_signal(&self, signal: SimulatedSignal) {
        self.lock().signal = signal;
    }

    /// Current beat note.
    pub fn signal(&self) -> SimulatedSignal {
        self.lock().signal
    }

    /// Move the beat note.
    pub fn set_center(&self, hz: f64) {
        self.lock().signal.center_hz = hz;
    }

    /// Change the peak level; below the noise floor the beat note vanishes.
    pub fn set_peak_level(&self, db: f64) {
        self.lock().signal.peak_db = db;
    }

    /// Keep reporting a running sweep forever.
    pub fn set_hang(&self, hang: bool) {
        self.lock().hang = hang;
    }

    /// Sweeps triggered so far.
    pub fn sweeps(&self) -> u64 {
        self.lock().sweeps
    }

    /// Current center frequency setting.
    pub fn center_frequency(&self) -> f64 {
        self.lock().center_hz
    }

    /// Current span setting.
    pub fn span(&self) -> f64 {
        self.lock().span_hz
    }

    /// Current resolution bandwidth setting.
    pub fn resolution_bandwidth(&self) -> f64 {
        self.lock().rbw_hz
    }

    /// Frames received so far, without terminators.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for SimulatedAnalyzer {
    fn name(&self) -> &str {
        "simulated-fseb20"
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> AppResult<()> {
        let frame = String::from_utf8_lossy(bytes);
        let frame = frame.trim_end_matches(['\r', '\n']).to_string();
        let mut state = self.lock();
        if let Some(reply) = state.handle(&frame) {
            trace!("Simulated FSEB20: {} -> {}", frame, reply);
            state.pending.push_back(reply);
        }
        state.sent.push(frame);
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> AppResult<String> {
        self.lock()
            .pending
            .pop_front()
            .ok_or_else(|| MonitorError::timeout("Simulated FSEB20 read", timeout))
    }

    fn escape(&self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }

    fn terminator(&self) -> &[u8] {
        b"\n"
    }
}
