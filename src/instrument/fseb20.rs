//! Rohde & Schwarz FSEB20 spectrum analyzer driver
//!
//! One method per instrument command, no business logic. Settings are
//! fire-and-forget writes; readouts are queries whose ASCII reply is parsed
//! into a typed value. Every method performs transport I/O.
//!
//! ## Value checks
//!
//! - Bandwidths are snapped to the 1-2-3-5 ladder before they are written and
//!   the snapped value is returned.
//! - Frequencies go through the configured [`RangePolicy`]: out-of-range
//!   requests are rejected or clamped here, never passed on for the analyzer
//!   to clamp silently.
//! - Marker indices outside 1-4 are rejected.
//!
//! The driver does not enforce ordering. Reading a marker before a sweep has
//! completed returns whatever the previous trace held.
//!
//! ## Example
//!
//! ```no_run
//! use beatnote_monitor::adapters::{PrologixAdapter, PrologixSettings, SerialTransport};
//! use beatnote_monitor::instrument::{AnalyzerOptions, SpectrumAnalyzer};
//!
//! # async fn example() -> beatnote_monitor::error::AppResult<()> {
//! let mut serial = SerialTransport::new("/dev/ttyUSB4", 115_200);
//! serial.connect()?;
//! let mut prologix = PrologixAdapter::new(serial, PrologixSettings::default());
//! prologix.configure().await?;
//!
//! let mut sa = SpectrumAnalyzer::new(prologix, AnalyzerOptions::default());
//! sa.set_center_frequency(21.0e6).await?;
//! sa.set_span(5.0e6).await?;
//! sa.acquire_sweep().await?;
//! sa.marker_to_peak(1).await?;
//! let peak = sa.read_marker(1).await?;
//! println!("peak at {} Hz, {} dB", peak.frequency_hz, peak.amplitude_db);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use tracing::{debug, warn};

use super::sweep::{
    snap_rbw, snap_vbw, FrequencyWindow, RangePolicy, SweepSetting, MAX_FREQUENCY_HZ,
    MIN_FREQUENCY_HZ,
};
use super::MarkerReading;
use crate::adapters::Transport;
use crate::config::{AnalyzerConfig, TransportConfig};
use crate::error::{AppResult, MonitorError};
use crate::error_recovery::RetryPolicy;

/// Command headers, shared with the simulated analyzer.
pub(crate) mod scpi {
    pub const IDENTIFY: &str = "*IDN?";
    pub const RESET: &str = "*RST";
    pub const CLEAR_STATUS: &str = "*CLS";
    pub const SYSTEM_ERROR: &str = "SYSTem:ERRor?";
    pub const CENTER: &str = "SENSe:FREQuency:CENTer";
    pub const SPAN: &str = "SENSe:FREQuency:SPAN";
    pub const RBW: &str = "SENSe:BANDwidth:RESolution";
    pub const RBW_AUTO: &str = "SENSe:BANDwidth:RESolution:AUTO";
    pub const RBW_RATIO: &str = "SENSe:BANDwidth:RESolution:RATio";
    pub const VBW: &str = "SENSe:BANDwidth:VIDeo";
    pub const SWEEP_TIME: &str = "SENSe:SWEep:TIME";
    pub const CONTINUOUS: &str = "INITiate1:CONTinuous";
    pub const INITIATE: &str = "INITiate1:IMMediate";
    pub const OPERATION_CONDITION: &str = "STATus:OPERation:CONDition?";
    pub const REFERENCE_LEVEL: &str = "DISPlay:WINDow1:TRACe1:Y:SCALe:RLEVel";
    pub const Y_RANGE: &str = "DISPlay:WINDow1:TRACe1:Y:SCALe";
    pub const ATTENUATION: &str = "INPut:ATTenuation";
    pub const MARKER_PREFIX: &str = "CALCulate1:MARKer";
}

/// Bit 3 of the operation condition register: a sweep is running.
pub const SWEEPING_BIT: u32 = 1 << 3;

/// Number of markers the analyzer offers.
pub const MARKER_COUNT: u8 = 4;

/// Replies at or above this are the SCPI "not a number" value (9.91E37).
const SCPI_NAN_THRESHOLD: f64 = 9.9e37;

/// Timing and value policies for [`SpectrumAnalyzer`]
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerOptions {
    /// Bound on every query reply
    pub reply_timeout: Duration,
    /// Out-of-range frequency handling
    pub range_policy: RangePolicy,
    /// Bound on one sweep attempt
    pub sweep_timeout: Duration,
    /// Interval between sweep status polls
    pub sweep_poll_interval: Duration,
    /// Attempts and backoff for a sweep that does not complete
    pub sweep_retry: RetryPolicy,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(1),
            range_policy: RangePolicy::Reject,
            sweep_timeout: Duration::from_secs(5),
            sweep_poll_interval: Duration::from_millis(50),
            sweep_retry: RetryPolicy::with_retries(2, Duration::from_millis(100)),
        }
    }
}

impl AnalyzerOptions {
    /// Options from the `[analyzer]` and `[transport]` configuration sections.
    pub fn from_config(analyzer: &AnalyzerConfig, transport: &TransportConfig) -> Self {
        Self {
            reply_timeout: transport.read_timeout(),
            range_policy: analyzer.range_policy,
            sweep_timeout: analyzer.sweep_timeout(),
            sweep_poll_interval: analyzer.sweep_poll_interval(),
            sweep_retry: RetryPolicy::with_retries(
                analyzer.sweep_retries,
                analyzer.sweep_poll_interval() * 2,
            ),
        }
    }
}

/// Format a number the way the analyzer accepts it: plain decimal, no exponent.
pub(crate) fn format_number(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() || text == "-" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

fn on_off(state: bool) -> &'static str {
    if state {
        "ON"
    } else {
        "OFF"
    }
}

/// Parse a numeric reply such as `2.1000050E+07`.
pub fn parse_number(command: &str, reply: &str) -> AppResult<f64> {
    let value: f64 = reply
        .trim()
        .parse()
        .map_err(|_| MonitorError::protocol(command, reply))?;
    if !value.is_finite() {
        return Err(MonitorError::protocol(command, reply));
    }
    Ok(value)
}

/// Parse a boolean reply (`1`/`0`/`ON`/`OFF`).
pub fn parse_bool(command: &str, reply: &str) -> AppResult<bool> {
    match reply.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        _ => Err(MonitorError::protocol(command, reply)),
    }
}

/// Parse a comma-separated pair of numbers, e.g. the N-dB-down frequencies.
pub fn parse_pair(command: &str, reply: &str) -> AppResult<(f64, f64)> {
    let mut fields = reply.split(',');
    match (fields.next(), fields.next(), fields.next()) {
        (Some(a), Some(b), None) => Ok((parse_number(command, a)?, parse_number(command, b)?)),
        _ => Err(MonitorError::protocol(command, reply)),
    }
}

/// Parse a `SYSTem:ERRor?` reply such as `-222,"Data out of range"`.
pub fn parse_error_entry(command: &str, reply: &str) -> AppResult<(i32, String)> {
    let (code, message) = reply
        .split_once(',')
        .ok_or_else(|| MonitorError::protocol(command, reply))?;
    let code = code
        .trim()
        .parse()
        .map_err(|_| MonitorError::protocol(command, reply))?;
    Ok((code, message.trim().trim_matches('"').to_string()))
}

fn reject_scpi_nan(command: &str, value: f64) -> AppResult<f64> {
    if value.abs() >= SCPI_NAN_THRESHOLD {
        Err(MonitorError::Measurement(format!(
            "'{}' returned no value (9.91E37)",
            command
        )))
    } else {
        Ok(value)
    }
}

/// Driver for the FSEB20 behind any [`Transport`]
pub struct SpectrumAnalyzer<T> {
    transport: T,
    options: AnalyzerOptions,
}

impl<T: Transport> SpectrumAnalyzer<T> {
    /// Wrap a transport that already reaches the analyzer.
    pub fn new(transport: T, options: AnalyzerOptions) -> Self {
        Self { transport, options }
    }

    /// Options in use.
    pub fn options(&self) -> &AnalyzerOptions {
        &self.options
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Unwrap the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        debug!("FSEB20 write: {}", command);
        self.transport.send(command).await
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        let reply = self
            .transport
            .query(command, self.options.reply_timeout)
            .await?;
        debug!("FSEB20 query: {} -> {}", command, reply);
        Ok(reply)
    }

    async fn query_number(&mut self, command: &str) -> AppResult<f64> {
        let reply = self.query(command).await?;
        parse_number(command, &reply)
    }

    async fn query_bool(&mut self, command: &str) -> AppResult<bool> {
        let reply = self.query(command).await?;
        parse_bool(command, &reply)
    }

    /// Send an arbitrary query and return the raw reply.
    pub async fn read_raw(&mut self, query: &str) -> AppResult<String> {
        self.query(query).await
    }

    // ------------------------------------------------------------------
    // Identity and status
    // ------------------------------------------------------------------

    /// Instrument identity (`*IDN?`).
    pub async fn identify(&mut self) -> AppResult<String> {
        self.query(scpi::IDENTIFY).await
    }

    /// Query the identity and warn when it lacks `expected`.
    ///
    /// A mismatch is not an error: the lab sometimes swaps in a sibling model.
    pub async fn test_connection(&mut self, expected: &str) -> AppResult<String> {
        let identity = self.identify().await?;
        if identity.contains(expected) {
            debug!("Connected to {}", identity);
        } else {
            warn!(
                "Unexpected instrument identity '{}' (expected '{}')",
                identity, expected
            );
        }
        Ok(identity)
    }

    /// Oldest entry of the error queue (`SYSTem:ERRor?`); code 0 means none.
    pub async fn read_error(&mut self) -> AppResult<(i32, String)> {
        let reply = self.query(scpi::SYSTEM_ERROR).await?;
        parse_error_entry(scpi::SYSTEM_ERROR, &reply)
    }

    /// Reset to factory defaults (`*RST`).
    pub async fn reset(&mut self) -> AppResult<()> {
        self.write(scpi::RESET).await
    }

    /// Clear the status registers and error queue (`*CLS`).
    pub async fn clear_status(&mut self) -> AppResult<()> {
        self.write(scpi::CLEAR_STATUS).await
    }

    // ------------------------------------------------------------------
    // Frequency
    // ------------------------------------------------------------------

    fn check_frequency(&self, what: &str, hz: f64) -> AppResult<f64> {
        if !hz.is_finite() {
            return Err(MonitorError::OutOfRange(format!("{} {} Hz", what, hz)));
        }
        if (MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
            return Ok(hz);
        }
        match self.options.range_policy {
            RangePolicy::Reject => Err(MonitorError::OutOfRange(format!(
                "{} {} Hz outside {}-{} Hz",
                what, hz, MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ
            ))),
            RangePolicy::Clamp => Ok(hz.clamp(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ)),
        }
    }

    /// Set the center frequency; returns the value written.
    pub async fn set_center_frequency(&mut self, hz: f64) -> AppResult<f64> {
        let hz = self.check_frequency("center frequency", hz)?;
        self.write(&format!("{} {}", scpi::CENTER, format_number(hz)))
            .await?;
        Ok(hz)
    }

    /// Current center frequency (Hz).
    pub async fn center_frequency(&mut self) -> AppResult<f64> {
        self.query_number(&format!("{}?", scpi::CENTER)).await
    }

    /// Set the span; returns the value written.
    pub async fn set_span(&mut self, hz: f64) -> AppResult<f64> {
        let widest = MAX_FREQUENCY_HZ - MIN_FREQUENCY_HZ;
        let hz = match self.options.range_policy {
            _ if !hz.is_finite() || hz <= 0.0 => {
                return Err(MonitorError::OutOfRange(format!("span {} Hz", hz)))
            }
            RangePolicy::Reject if hz > widest => {
                return Err(MonitorError::OutOfRange(format!(
                    "span {} Hz wider than {} Hz",
                    hz, widest
                )))
            }
            _ => hz.min(widest),
        };
        self.write(&format!("{} {}", scpi::SPAN, format_number(hz)))
            .await?;
        Ok(hz)
    }

    /// Current span (Hz).
    pub async fn span(&mut self) -> AppResult<f64> {
        self.query_number(&format!("{}?", scpi::SPAN)).await
    }

    /// Set center and span together, checking the window they describe.
    pub async fn set_center_and_span(
        &mut self,
        center_hz: f64,
        span_hz: f64,
    ) -> AppResult<FrequencyWindow> {
        let window = FrequencyWindow::resolve(center_hz, span_hz, self.options.range_policy)?;
        self.write(&format!("{} {}", scpi::CENTER, format_number(window.center_hz)))
            .await?;
        self.write(&format!("{} {}", scpi::SPAN, format_number(window.span_hz)))
            .await?;
        Ok(window)
    }

    /// Apply a complete sweep setting: center, span, RBW and VBW.
    pub async fn apply_sweep(&mut self, setting: &SweepSetting) -> AppResult<SweepSetting> {
        let window =
            self.set_center_and_span(setting.center_frequency, setting.span).await?;
        let rbw = self
            .set_resolution_bandwidth(setting.resolution_bandwidth)
            .await?;
        let vbw = self.set_video_bandwidth(setting.video_bandwidth).await?;
        Ok(SweepSetting {
            center_frequency: window.center_hz,
            span: window.span_hz,
            resolution_bandwidth: rbw,
            video_bandwidth: vbw,
        })
    }

    // ------------------------------------------------------------------
    // Bandwidth
    // ------------------------------------------------------------------

    /// Set the resolution bandwidth; returns the snapped value written.
    pub async fn set_resolution_bandwidth(&mut self, hz: f64) -> AppResult<f64> {
        let hz = snap_rbw(hz);
        self.write(&format!("{} {}", scpi::RBW, format_number(hz)))
            .await?;
        Ok(hz)
    }

    /// Current resolution bandwidth (Hz).
    pub async fn resolution_bandwidth(&mut self) -> AppResult<f64> {
        self.query_number(&format!("{}?", scpi::RBW)).await
    }

    /// Couple the resolution bandwidth to the span (ON) or not (OFF).
    pub async fn set_rbw_auto(&mut self, coupled: bool) -> AppResult<()> {
        self.write(&format!("{} {}", scpi::RBW_AUTO, on_off(coupled)))
            .await
    }

    /// Ratio of resolution bandwidth to span used when coupled.
    pub async fn set_rbw_span_ratio(&mut self, ratio: f64) -> AppResult<()> {
        if !(ratio.is_finite() && ratio > 0.0 && ratio <= 1.0) {
            return Err(MonitorError::OutOfRange(format!("RBW/span ratio {}", ratio)));
        }
        self.write(&format!("{} {}", scpi::RBW_RATIO, ratio)).await
    }

    /// Set the video bandwidth; returns the snapped value written.
    pub async fn set_video_bandwidth(&mut self, hz: f64) -> AppResult<f64> {
        let hz = snap_vbw(hz);
        self.write(&format!("{} {}", scpi::VBW, format_number(hz)))
            .await?;
        Ok(hz)
    }

    /// Current video bandwidth (Hz).
    pub async fn video_bandwidth(&mut self) -> AppResult<f64> {
        self.query_number(&format!("{}?", scpi::VBW)).await
    }

    // ------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------

    /// Duration of one sweep at the current settings.
    pub async fn sweep_time(&mut self) -> AppResult<Duration> {
        let seconds = self.query_number(&format!("{}?", scpi::SWEEP_TIME)).await?;
        Duration::try_from_secs_f64(seconds)
            .map_err(|_| MonitorError::protocol(scpi::SWEEP_TIME, seconds.to_string()))
    }

    /// Free-running sweeps (ON) or single sweeps (OFF).
    pub async fn set_continuous(&mut self, continuous: bool) -> AppResult<()> {
        self.write(&format!("{} {}", scpi::CONTINUOUS, on_off(continuous)))
            .await
    }

    /// Whether the analyzer sweeps continuously.
    pub async fn continuous(&mut self) -> AppResult<bool> {
        self.query_bool(&format!("{}?", scpi::CONTINUOUS)).await
    }

    /// Start a sweep in the current trigger mode.
    pub async fn initiate(&mut self) -> AppResult<()> {
        self.write(scpi::INITIATE).await
    }

    /// Switch to single-sweep mode and trigger one sweep.
    pub async fn sweep_single(&mut self) -> AppResult<()> {
        self.set_continuous(false).await?;
        self.initiate().await
    }

    /// Whether a sweep is running (bit 3 of the operation condition register).
    pub async fn is_sweeping(&mut self) -> AppResult<bool> {
        let reply = self.query(scpi::OPERATION_CONDITION).await?;
        let condition: u32 = reply
            .trim()
            .parse()
            .map_err(|_| MonitorError::protocol(scpi::OPERATION_CONDITION, &reply))?;
        Ok(condition & SWEEPING_BIT != 0)
    }

    /// Poll the sweep status until the sweep completes or `timeout` elapses.
    pub async fn wait_sweep_complete(&mut self, timeout: Duration) -> AppResult<()> {
        let start = tokio::time::Instant::now();
        loop {
            if !self.is_sweeping().await? {
                debug!("Sweep complete after {:?}", start.elapsed());
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(MonitorError::timeout("Sweep", timeout));
            }
            tokio::time::sleep(self.options.sweep_poll_interval).await;
        }
    }

    /// Trigger a single sweep and wait for it, retrying on timeout.
    ///
    /// Each attempt is bounded by `sweep_timeout`; after the last attempt the
    /// timeout is returned to the caller.
    pub async fn acquire_sweep(&mut self) -> AppResult<()> {
        let policy = self.options.sweep_retry.clone();
        let timeout = self.options.sweep_timeout;
        let mut attempt = 0;
        loop {
            self.sweep_single().await?;
            match self.wait_sweep_complete(timeout).await {
                Ok(()) => return Ok(()),
                Err(err @ MonitorError::Timeout { .. }) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        return Err(err);
                    }
                    warn!(
                        "Sweep attempt {}/{} timed out, retrying",
                        attempt, policy.max_attempts
                    );
                    tokio::time::sleep(policy.delay_after(attempt - 1)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ------------------------------------------------------------------
    // Level
    // ------------------------------------------------------------------

    /// Set the reference level (dBm).
    pub async fn set_reference_level(&mut self, dbm: f64) -> AppResult<()> {
        self.write(&format!("{} {}dBm", scpi::REFERENCE_LEVEL, format_number(dbm)))
            .await
    }

    /// Current reference level (dBm).
    pub async fn reference_level(&mut self) -> AppResult<f64> {
        self.query_number(&format!("{}?", scpi::REFERENCE_LEVEL))
            .await
    }

    /// Set the RF input attenuation (dB).
    pub async fn set_rf_attenuation(&mut self, db: f64) -> AppResult<()> {
        if !(0.0..=70.0).contains(&db) {
            return Err(MonitorError::OutOfRange(format!("RF attenuation {} dB", db)));
        }
        self.write(&format!("{} {}dB", scpi::ATTENUATION, format_number(db)))
            .await
    }

    /// Current RF input attenuation (dB).
    pub async fn rf_attenuation(&mut self) -> AppResult<f64> {
        self.query_number(&format!("{}?", scpi::ATTENUATION)).await
    }

    /// Set the displayed level range (dB).
    pub async fn set_y_range(&mut self, db: f64) -> AppResult<()> {
        self.write(&format!("{} {}dB", scpi::Y_RANGE, format_number(db)))
            .await
    }

    /// Current displayed level range (dB).
    pub async fn y_range(&mut self) -> AppResult<f64> {
        self.query_number(&format!("{}?", scpi::Y_RANGE)).await
    }

    // ------------------------------------------------------------------
    // Markers
    // ------------------------------------------------------------------

    fn marker(index: u8, suffix: &str) -> AppResult<String> {
        if !(1..=MARKER_COUNT).contains(&index) {
            return Err(MonitorError::OutOfRange(format!(
                "marker {} (analyzer has 1-{})",
                index, MARKER_COUNT
            )));
        }
        Ok(format!("{}{}:{}", scpi::MARKER_PREFIX, index, suffix))
    }

    /// Switch a marker on or off.
    pub async fn set_marker_enabled(&mut self, index: u8, enabled: bool) -> AppResult<()> {
        let command = Self::marker(index, "STATe")?;
        self.write(&format!("{} {}", command, on_off(enabled))).await
    }

    /// Whether a marker is switched on.
    pub async fn marker_enabled(&mut self, index: u8) -> AppResult<bool> {
        let command = Self::marker(index, "STATe?")?;
        self.query_bool(&command).await
    }

    /// Attach a marker to a trace.
    pub async fn set_marker_trace(&mut self, index: u8, trace: u8) -> AppResult<()> {
        let command = Self::marker(index, "TRACe")?;
        self.write(&format!("{} {}", command, trace)).await
    }

    /// Place a marker at a frequency; returns the value written.
    pub async fn set_marker(&mut self, index: u8, hz: f64) -> AppResult<f64> {
        let command = Self::marker(index, "X")?;
        let hz = self.check_frequency("marker frequency", hz)?;
        self.write(&format!("{} {}", command, format_number(hz)))
            .await?;
        Ok(hz)
    }

    /// Marker frequency (Hz).
    pub async fn read_marker_frequency(&mut self, index: u8) -> AppResult<f64> {
        let command = Self::marker(index, "X?")?;
        self.query_number(&command).await
    }

    /// Marker amplitude in the current unit (dB/dBm).
    pub async fn read_marker_amplitude(&mut self, index: u8) -> AppResult<f64> {
        let command = Self::marker(index, "Y?")?;
        self.query_number(&command).await
    }

    /// Move a marker to the maximum of its trace.
    pub async fn marker_to_peak(&mut self, index: u8) -> AppResult<()> {
        let command = Self::marker(index, "MAXimum:PEAK")?;
        self.write(&command).await
    }

    /// Frequency and amplitude of a marker.
    pub async fn read_marker(&mut self, index: u8) -> AppResult<MarkerReading> {
        let frequency_hz = self.read_marker_frequency(index).await?;
        let amplitude_db = self.read_marker_amplitude(index).await?;
        Ok(MarkerReading {
            frequency_hz,
            amplitude_db,
        })
    }

    /// Set the level drop of the N-dB-down function relative to a marker.
    pub async fn set_ndb_down(&mut self, index: u8, db: f64) -> AppResult<()> {
        let command = Self::marker(index, "FUNCtion:NDBDown")?;
        self.write(&format!("{} {}dB", command, format_number(db)))
            .await
    }

    /// Switch the N-dB-down function on or off.
    pub async fn set_ndb_down_enabled(&mut self, index: u8, enabled: bool) -> AppResult<()> {
        let command = Self::marker(index, "FUNCtion:NDBDown:STATe")?;
        self.write(&format!("{} {}", command, on_off(enabled))).await
    }

    /// Spacing between the two N-dB-down points (Hz).
    pub async fn ndb_down_width(&mut self, index: u8) -> AppResult<f64> {
        let command = Self::marker(index, "FUNCtion:NDBDown:RESult?")?;
        let width = self.query_number(&command).await?;
        reject_scpi_nan(&command, width)
    }

    /// Frequencies of the two N-dB-down points, ascending (Hz).
    pub async fn ndb_down_frequencies(&mut self, index: u8) -> AppResult<(f64, f64)> {
        let command = Self::marker(index, "FUNCtion:NDBDown:FREQuency?")?;
        let reply = self.query(&command).await?;
        let (low, high) = parse_pair(&command, &reply)?;
        Ok((reject_scpi_nan(&command, low)?, reject_scpi_nan(&command, high)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    fn analyzer(mock: &MockTransport) -> SpectrumAnalyzer<MockTransport> {
        SpectrumAnalyzer::new(
            mock.clone(),
            AnalyzerOptions {
                reply_timeout: Duration::from_millis(10),
                sweep_timeout: Duration::from_millis(200),
                sweep_poll_interval: Duration::from_millis(10),
                sweep_retry: RetryPolicy::with_retries(1, Duration::from_millis(10)),
                ..AnalyzerOptions::default()
            },
        )
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(21_000_050.0), "21000050");
        assert_eq!(format_number(250.5), "250.5");
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(-10.0), "-10");
        assert_eq!(format_number(7.0e9), "7000000000");
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(parse_number("X?", " 2.1000050E+07\n").unwrap(), 21_000_050.0);
        assert!(matches!(
            parse_number("X?", "ERR"),
            Err(MonitorError::Protocol { .. })
        ));
        assert!(parse_bool("C?", "1").unwrap());
        assert!(!parse_bool("C?", "OFF").unwrap());
        assert!(parse_bool("C?", "maybe").is_err());
        assert_eq!(
            parse_pair("F?", "21000030,21000070").unwrap(),
            (21_000_030.0, 21_000_070.0)
        );
        assert!(parse_pair("F?", "21000030").is_err());
        assert_eq!(
            parse_error_entry("E?", "-222,\"Data out of range\"").unwrap(),
            (-222, "Data out of range".to_string())
        );
    }

    #[tokio::test]
    async fn test_setting_commands() {
        let mock = MockTransport::new();
        let mut sa = analyzer(&mock);
        sa.set_center_frequency(21.0e6).await.unwrap();
        sa.set_span(5.0e6).await.unwrap();
        assert_eq!(sa.set_resolution_bandwidth(9_000.0).await.unwrap(), 10_000.0);
        assert_eq!(sa.set_video_bandwidth(0.5).await.unwrap(), 1.0);
        sa.set_rbw_auto(true).await.unwrap();
        sa.set_rbw_span_ratio(0.02).await.unwrap();
        assert_eq!(
            mock.sent(),
            vec![
                "SENSe:FREQuency:CENTer 21000000",
                "SENSe:FREQuency:SPAN 5000000",
                "SENSe:BANDwidth:RESolution 10000",
                "SENSe:BANDwidth:VIDeo 1",
                "SENSe:BANDwidth:RESolution:AUTO ON",
                "SENSe:BANDwidth:RESolution:RATio 0.02",
            ]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_rejected_without_writing() {
        let mock = MockTransport::new();
        let mut sa = analyzer(&mock);
        assert!(matches!(
            sa.set_center_frequency(8.0e9).await,
            Err(MonitorError::OutOfRange(_))
        ));
        assert!(sa.set_center_and_span(10.0e3, 1.0e6).await.is_err());
        assert!(sa.set_span(0.0).await.is_err());
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_clamped_when_configured() {
        let mock = MockTransport::new();
        let mut sa = SpectrumAnalyzer::new(
            mock.clone(),
            AnalyzerOptions {
                range_policy: RangePolicy::Clamp,
                ..AnalyzerOptions::default()
            },
        );
        assert_eq!(sa.set_center_frequency(1.0e3).await.unwrap(), 9.0e3);
        let window = sa.set_center_and_span(10.0e3, 1.0e6).await.unwrap();
        assert!(window.start_hz() >= MIN_FREQUENCY_HZ);
        assert_eq!(mock.sent()[0], "SENSe:FREQuency:CENTer 9000");
    }

    #[tokio::test]
    async fn test_apply_sweep_writes_all_four_settings() {
        let mock = MockTransport::new();
        let mut sa = analyzer(&mock);
        let setting =
            SweepSetting::new(21.0e6, 50.0e3, 1_000.0, 1_000.0, RangePolicy::Reject).unwrap();
        let applied = sa.apply_sweep(&setting).await.unwrap();
        assert_eq!(applied, setting);
        assert_eq!(mock.sent().len(), 4);
    }

    #[tokio::test]
    async fn test_marker_readout() {
        let mock = MockTransport::new()
            .on("CALCulate1:MARKer1:X?", "2.1000050E+07")
            .on("CALCulate1:MARKer1:Y?", "-10.0");
        let mut sa = analyzer(&mock);
        sa.marker_to_peak(1).await.unwrap();
        let reading = sa.read_marker(1).await.unwrap();
        assert_eq!(reading.frequency_hz, 21_000_050.0);
        assert_eq!(reading.amplitude_db, -10.0);
        assert_eq!(mock.sent()[0], "CALCulate1:MARKer1:MAXimum:PEAK");
    }

    #[tokio::test]
    async fn test_marker_index_checked() {
        let mock = MockTransport::new();
        let mut sa = analyzer(&mock);
        assert!(matches!(
            sa.set_marker(5, 21.0e6).await,
            Err(MonitorError::OutOfRange(_))
        ));
        assert!(sa.read_marker_amplitude(0).await.is_err());
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_protocol_failure() {
        let mock = MockTransport::new().on("SENSe:FREQuency:SPAN?", "garbage");
        let mut sa = analyzer(&mock);
        let err = sa.span().await.unwrap_err();
        assert!(matches!(err, MonitorError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_ndb_down_not_found_is_measurement_failure() {
        let mock = MockTransport::new()
            .on("CALCulate1:MARKer1:FUNCtion:NDBDown:RESult?", "9.91E37")
            .on(
                "CALCulate1:MARKer1:FUNCtion:NDBDown:FREQuency?",
                "21000030,21000070",
            );
        let mut sa = analyzer(&mock);
        assert!(matches!(
            sa.ndb_down_width(1).await,
            Err(MonitorError::Measurement(_))
        ));
        assert_eq!(
            sa.ndb_down_frequencies(1).await.unwrap(),
            (21_000_030.0, 21_000_070.0)
        );
    }

    #[tokio::test]
    async fn test_wait_sweep_complete_polls_status() {
        let mock = MockTransport::new();
        mock.push_reply(scpi::OPERATION_CONDITION, "8");
        mock.push_reply(scpi::OPERATION_CONDITION, "8");
        mock.push_reply(scpi::OPERATION_CONDITION, "0");
        let mut sa = analyzer(&mock);
        sa.wait_sweep_complete(Duration::from_secs(1)).await.unwrap();
        assert_eq!(mock.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_timeout_after_retries() {
        let mock = MockTransport::new().on(scpi::OPERATION_CONDITION, "8");
        let mut sa = analyzer(&mock);
        let err = sa.acquire_sweep().await.unwrap_err();
        assert!(matches!(err, MonitorError::Timeout { .. }));
        let triggers = mock
            .sent()
            .iter()
            .filter(|c| c.as_str() == scpi::INITIATE)
            .count();
        assert_eq!(triggers, 2);
    }

    #[tokio::test]
    async fn test_test_connection_tolerates_other_identity() {
        let mock = MockTransport::new().on("*IDN?", "Rohde&Schwarz,FSEA 30,0,1.0");
        let mut sa = analyzer(&mock);
        let idn = sa.test_connection("FSEB 20").await.unwrap();
        assert!(idn.contains("FSEA 30"));
    }
}
