//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the monitor.
//! Configuration is loaded from:
//! 1. `config/beatnote.toml` (base configuration, optional)
//! 2. Environment variables (prefixed with `BEATNOTE_`)
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration for the lab's FSEB20 on GPIB address 20.
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! BEATNOTE_APPLICATION__LOG_LEVEL=debug
//! BEATNOTE_TRANSPORT__PORT=/dev/ttyUSB4
//! BEATNOTE_TRACKER__STABLE_COUNT=8
//! ```
//!
//! # Example
//!
//! ```no_run
//! use beatnote_monitor::config::MonitorConfig;
//!
//! let config = MonitorConfig::load().unwrap();
//! println!("Analyzer on {} (GPIB {})", config.transport.port, config.transport.gpib_address);
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, MonitorError};
use crate::instrument::sweep::{RangePolicy, RBW_LIMITS};
use crate::tracker::WidthMethod;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/beatnote.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link and Prologix controller settings
    pub transport: TransportConfig,
    /// Spectrum analyzer settings
    pub analyzer: AnalyzerConfig,
    /// Tracking loop thresholds
    pub tracker: TrackerConfig,
    /// Frequency counter input
    pub counter: CounterConfig,
    /// Publish sink
    pub publish: PublishConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "phaselock_beatnote_fseb20".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Serial link to the Prologix GPIB-USB controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serial device path (e.g. "/dev/ttyUSB4")
    pub port: String,
    /// Baud rate of the USB serial link
    pub baud_rate: u32,
    /// GPIB primary address of the analyzer (0-30)
    pub gpib_address: u8,
    /// Per-reply read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Terminator appended to every command
    pub line_terminator: String,
    /// Character that ends an instrument reply
    pub response_delimiter: char,
    /// Let the controller address the instrument to talk after every write
    /// (`++auto 1`) instead of issuing `++read eoi` for queries.
    pub read_after_write: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: "/dev/RohdeSchwarz_SpecAna".to_string(),
            baud_rate: 115_200,
            gpib_address: 20,
            read_timeout_ms: 1000,
            line_terminator: "\n".to_string(),
            response_delimiter: '\n',
            read_after_write: false,
        }
    }
}

impl TransportConfig {
    /// Read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Spectrum analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// What to do with a center/span pair outside the analyzer's range
    pub range_policy: RangePolicy,
    /// Upper bound on one sweep, per attempt
    pub sweep_timeout_ms: u64,
    /// Interval between sweep status polls
    pub sweep_poll_interval_ms: u64,
    /// Additional attempts after a sweep timeout
    pub sweep_retries: u32,
    /// Trace points per sweep; sets the marker search step
    pub sweep_points: u32,
    /// Substring expected in the `*IDN?` reply
    pub expected_identity: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            range_policy: RangePolicy::Reject,
            sweep_timeout_ms: 5000,
            sweep_poll_interval_ms: 50,
            sweep_retries: 2,
            sweep_points: 500,
            expected_identity: "Rohde&Schwarz,FSEB 20".to_string(),
        }
    }
}

impl AnalyzerConfig {
    /// Sweep timeout as a [`Duration`].
    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.sweep_timeout_ms)
    }

    /// Sweep status poll interval as a [`Duration`].
    pub fn sweep_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_poll_interval_ms)
    }
}

/// Tracking loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Span used while searching around the counter estimate
    pub search_span_hz: f64,
    /// Resolution bandwidth while searching
    pub search_rbw_hz: f64,
    /// Span once a peak has been found
    pub narrow_span_hz: f64,
    /// Resolution bandwidth in the narrow state
    pub narrow_rbw_hz: f64,
    /// Smallest span used when zoomed on the beat note
    pub zoomed_span_hz: f64,
    /// Smallest resolution bandwidth used when zoomed
    pub zoomed_rbw_hz: f64,
    /// Zoomed span is at least this many linewidths
    pub zoomed_span_fwhm_factor: f64,
    /// Consecutive agreeing iterations required to call the signal stable
    pub stable_count: usize,
    /// Band within which consecutive centers must agree
    pub center_tolerance_hz: f64,
    /// FWHM must be below this to zoom
    pub fwhm_threshold_hz: f64,
    /// Peak amplitude below this counts as a lost peak
    pub noise_floor_db: f64,
    /// Counter vs. measured center divergence that signals lock loss
    pub lock_loss_hz: f64,
    /// Counter change between polls that signals a ramping phaselock
    pub counter_jump_hz: f64,
    /// Pause between iterations
    pub poll_interval_ms: u64,
    /// Consecutive link failures after which the loop gives up
    pub max_consecutive_failures: u32,
    /// How the half-power width is measured
    pub width_method: WidthMethod,
    /// Drop below the peak that defines the width
    pub half_power_db: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            search_span_hz: 5.0e6,
            search_rbw_hz: 10.0e3,
            narrow_span_hz: 50.0e3,
            narrow_rbw_hz: 1.0e3,
            zoomed_span_hz: 250.0,
            zoomed_rbw_hz: 20.0,
            zoomed_span_fwhm_factor: 5.0,
            stable_count: 5,
            center_tolerance_hz: 1.0e3,
            fwhm_threshold_hz: 50.0e3,
            noise_floor_db: -80.0,
            lock_loss_hz: 50.0e3,
            counter_jump_hz: 50.0e3,
            poll_interval_ms: 100,
            max_consecutive_failures: 20,
            width_method: WidthMethod::MarkerSearch,
            half_power_db: 3.0,
        }
    }
}

impl TrackerConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Frequency counter input configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// TCP `host:port` of the counter's line stream; none means no counter
    pub address: Option<String>,
    /// Topic prefix of counter messages
    pub topic: String,
    /// Readings older than this are treated as stale
    pub max_age_ms: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            address: None,
            topic: "beatnote_freq".to_string(),
            max_age_ms: 2000,
        }
    }
}

impl CounterConfig {
    /// Staleness bound as a [`Duration`].
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

/// Publish sink kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Emit each record as a structured log event
    Log,
    /// Append each record as a JSON line to `publish.path`
    JsonLines,
}

/// Publish sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Sink kind
    pub sink: SinkKind,
    /// Output file for the JSON-lines sink
    pub path: Option<PathBuf>,
    /// Minimum interval between published records; 0 publishes every iteration
    pub min_interval_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Log,
            path: None,
            min_interval_ms: 0,
        }
    }
}

impl PublishConfig {
    /// Throttle interval as a [`Duration`].
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl MonitorConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest first): `BEATNOTE_` environment variables, the
    /// TOML file, built-in defaults. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`MonitorError::Config`] if the sources cannot be merged and a
    /// [`MonitorError::Configuration`] if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEATNOTE_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - GPIB address is 0-30
    /// - Spans are positive and ordered search > narrow > zoomed
    /// - Tracker thresholds are positive and the noise floor is finite
    /// - Tracker bandwidths are inside the analyzer's filter range
    /// - Stability window and sweep parameters are non-zero
    /// - The JSON-lines sink has a path
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(MonitorError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.transport.gpib_address > 30 {
            return Err(MonitorError::Configuration(format!(
                "Invalid gpib_address {}. Must be 0-30",
                self.transport.gpib_address
            )));
        }

        if self.transport.port.is_empty() {
            return Err(MonitorError::Configuration(
                "transport.port cannot be empty".to_string(),
            ));
        }

        let t = &self.tracker;
        for (name, value) in [
            ("search_span_hz", t.search_span_hz),
            ("narrow_span_hz", t.narrow_span_hz),
            ("zoomed_span_hz", t.zoomed_span_hz),
            ("center_tolerance_hz", t.center_tolerance_hz),
            ("fwhm_threshold_hz", t.fwhm_threshold_hz),
            ("half_power_db", t.half_power_db),
            ("zoomed_span_fwhm_factor", t.zoomed_span_fwhm_factor),
            ("lock_loss_hz", t.lock_loss_hz),
            ("counter_jump_hz", t.counter_jump_hz),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(MonitorError::Configuration(format!(
                    "tracker.{} must be positive, got {}",
                    name, value
                )));
            }
        }

        if !t.noise_floor_db.is_finite() {
            return Err(MonitorError::Configuration(format!(
                "tracker.noise_floor_db must be finite, got {}",
                t.noise_floor_db
            )));
        }

        if !(t.search_span_hz > t.narrow_span_hz && t.narrow_span_hz > t.zoomed_span_hz) {
            return Err(MonitorError::Configuration(format!(
                "Spans must shrink search > narrow > zoomed, got {} > {} > {}",
                t.search_span_hz, t.narrow_span_hz, t.zoomed_span_hz
            )));
        }

        for (name, value) in [
            ("search_rbw_hz", t.search_rbw_hz),
            ("narrow_rbw_hz", t.narrow_rbw_hz),
            ("zoomed_rbw_hz", t.zoomed_rbw_hz),
        ] {
            if !RBW_LIMITS.contains(value) {
                return Err(MonitorError::Configuration(format!(
                    "tracker.{} {} Hz outside {}-{} Hz",
                    name, value, RBW_LIMITS.min_hz, RBW_LIMITS.max_hz
                )));
            }
        }
        if t.stable_count == 0 {
            return Err(MonitorError::Configuration(
                "tracker.stable_count must be at least 1".to_string(),
            ));
        }

        if t.max_consecutive_failures == 0 {
            return Err(MonitorError::Configuration(
                "tracker.max_consecutive_failures must be at least 1".to_string(),
            ));
        }

        if self.analyzer.sweep_points < 2 {
            return Err(MonitorError::Configuration(format!(
                "analyzer.sweep_points must be at least 2, got {}",
                self.analyzer.sweep_points
            )));
        }

        if self.analyzer.sweep_timeout_ms == 0 || self.transport.read_timeout_ms == 0 {
            return Err(MonitorError::Configuration(
                "Timeouts must be non-zero".to_string(),
            ));
        }

        if self.publish.sink == SinkKind::JsonLines && self.publish.path.is_none() {
            return Err(MonitorError::Configuration(
                "publish.path is required for the json_lines sink".to_string(),
            ));
        }

        Ok(())
    }
}
