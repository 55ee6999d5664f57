//! Beat note tracker
//!
//! A single polling loop that keeps the analyzer centered on the beat note and
//! zooms in as the signal settles:
//!
//! ```text
//!            peak found               N centers agree, FWHM < threshold
//!   SEARCH ─────────────▶ NARROW ─────────────────────────────────────▶ ZOOMED
//!     ▲                     ▲  │                                          │
//!     │                     │  └── unstable ◀─────────────────────────────┘
//!     └──── peak lost / counter diverges from the measured center ───────┘
//! ```
//!
//! - **SEARCH** sweeps a wide span around the counter estimate.
//! - **NARROW** sweeps a reduced span around the last measured peak and
//!   measures the half-power width.
//! - **ZOOMED** sweeps the smallest span that still holds the linewidth.
//!
//! Every measured iteration publishes a [`BeatnoteRecord`](crate::publish::BeatnoteRecord),
//! whatever the mode. A failed iteration is logged and skipped; only a run of
//! consecutive link failures (transport, protocol, timeout) longer than
//! `max_consecutive_failures` ends the loop.
//!
//! Stability counts consecutive measured iterations. A NARROW or ZOOMED
//! iteration whose width cannot be measured restarts the count and re-centers
//! on the widened sweep's peak. Iterations skipped before any sweep (no
//! counter data, ramping phaselock, link failure) neither add to the count
//! nor reset it.
//!
//! The loop owns the analyzer link. Stop requests are honored between
//! iterations, never in the middle of a command exchange.

pub mod fwhm;
pub mod state;

use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::Transport;
use crate::config::TrackerConfig;
use crate::counter::FrequencySource;
use crate::error::{AppResult, FailureKind, MonitorError};
use crate::instrument::sweep::snap_rbw;
use crate::instrument::{FrequencyWindow, MarkerReading, SpectrumAnalyzer, SweepSetting};
use crate::publish::PublishSink;

pub use fwhm::{CrossingSearch, HalfPowerPoints, LevelSource, MarkerLevels, Side};
pub use state::{BeatnoteEstimate, MarkerAssignment, StabilityWindow, TrackerMode, TrackerState};

/// Ratio of resolution bandwidth to span in ZOOMED mode.
const ZOOMED_RBW_SPAN_RATIO: f64 = 1.0 / 50.0;

/// How the half-power width is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidthMethod {
    /// Step the lower/upper markers outward from the peak
    #[default]
    MarkerSearch,
    /// Use the analyzer's N-dB-down marker function
    InstrumentNdb,
}

/// Why an iteration produced no estimate.
#[derive(Debug, Error)]
pub enum SkipReason {
    /// The counter has no fresh reading.
    #[error("no fresh counter reading")]
    NoCounterData,

    /// The counter moved too far since the previous poll.
    #[error("phaselock ramping: counter moved from {previous_hz:.0} Hz to {current_hz:.0} Hz")]
    Ramping {
        /// Counter frequency at the previous poll
        previous_hz: f64,
        /// Counter frequency now
        current_hz: f64,
    },

    /// The strongest point of the trace is below the noise floor.
    #[error("no peak above the noise floor (strongest point {amplitude_db:.1} dB)")]
    NoPeak {
        /// Level at the strongest point
        amplitude_db: f64,
    },

    /// An instrument operation failed.
    #[error(transparent)]
    Failed(#[from] MonitorError),
}

impl SkipReason {
    /// Failure class of the skip; `None` when the instrument was not involved.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            SkipReason::NoCounterData | SkipReason::Ramping { .. } => None,
            SkipReason::NoPeak { .. } => Some(FailureKind::Measurement),
            SkipReason::Failed(e) => Some(e.kind()),
        }
    }
}

/// What one call to [`BeatnoteTracker::step`] did.
#[derive(Debug)]
pub enum IterationOutcome {
    /// A peak was measured and published.
    Measured(BeatnoteEstimate),
    /// Nothing was published this cycle.
    Skipped(SkipReason),
}

impl IterationOutcome {
    /// The estimate, if one was measured.
    pub fn estimate(&self) -> Option<&BeatnoteEstimate> {
        match self {
            IterationOutcome::Measured(estimate) => Some(estimate),
            IterationOutcome::Skipped(_) => None,
        }
    }

    /// The skip reason, if the iteration was skipped.
    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            IterationOutcome::Measured(_) => None,
            IterationOutcome::Skipped(reason) => Some(reason),
        }
    }
}

/// Closed-loop centering and zoom control
pub struct BeatnoteTracker<T, S, P> {
    analyzer: SpectrumAnalyzer<T>,
    counter: S,
    sink: P,
    config: TrackerConfig,
    sweep_points: u32,
    state: TrackerState,
}

impl<T, S, P> BeatnoteTracker<T, S, P>
where
    T: Transport,
    S: FrequencySource,
    P: PublishSink,
{
    /// Tracker in SEARCH mode.
    ///
    /// `sweep_points` is the analyzer's trace length; it sets the marker
    /// search step.
    pub fn new(
        analyzer: SpectrumAnalyzer<T>,
        counter: S,
        sink: P,
        config: TrackerConfig,
        sweep_points: u32,
    ) -> Self {
        let state = TrackerState::new(config.stable_count, config.max_consecutive_failures);
        Self {
            analyzer,
            counter,
            sink,
            config,
            sweep_points,
            state,
        }
    }

    /// State after the last iteration.
    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    /// Current mode.
    pub fn mode(&self) -> TrackerMode {
        self.state.mode
    }

    /// The analyzer driver.
    pub fn analyzer_mut(&mut self) -> &mut SpectrumAnalyzer<T> {
        &mut self.analyzer
    }

    /// Consume the tracker, keeping its state.
    pub fn into_state(self) -> TrackerState {
        self.state
    }

    /// Check the identity and put the analyzer in single-sweep mode with the
    /// tracking markers on trace 1.
    pub async fn prepare(&mut self, expected_identity: &str) -> AppResult<String> {
        let identity = self.analyzer.test_connection(expected_identity).await?;
        self.analyzer.clear_status().await?;
        self.analyzer.set_continuous(false).await?;
        let markers = self.state.markers;
        for marker in [markers.peak, markers.lower, markers.upper] {
            self.analyzer.set_marker_enabled(marker, true).await?;
            self.analyzer.set_marker_trace(marker, 1).await?;
        }
        info!("Analyzer ready: {}", identity);
        Ok(identity)
    }

    /// Run exactly one iteration.
    pub async fn step(&mut self) -> IterationOutcome {
        self.state.iterations += 1;
        let mode = self.state.mode;
        let outcome = match self.iterate().await {
            Ok(estimate) => IterationOutcome::Measured(estimate),
            Err(reason) => IterationOutcome::Skipped(reason),
        };

        match &outcome {
            IterationOutcome::Measured(estimate) => {
                self.state.failures.record_success();
                debug!(
                    mode = %estimate.mode,
                    center_hz = estimate.center_frequency_hz,
                    fwhm_hz = estimate.fwhm_hz,
                    stable = estimate.stable,
                    "Iteration {} measured",
                    self.state.iterations
                );
            }
            IterationOutcome::Skipped(reason) => {
                match reason {
                    SkipReason::Failed(e) if e.is_link_failure() => {
                        self.state.failures.record_failure();
                    }
                    SkipReason::NoPeak { .. } => self.state.failures.record_success(),
                    SkipReason::Failed(e) if e.kind() == FailureKind::Measurement => {
                        self.state.failures.record_success();
                    }
                    _ => {}
                }
                warn!(
                    mode = %mode,
                    kind = ?reason.kind(),
                    consecutive_failures = self.state.failures.consecutive(),
                    "Skipping iteration {}: {}",
                    self.state.iterations,
                    reason
                );
            }
        }
        outcome
    }

    async fn iterate(&mut self) -> Result<BeatnoteEstimate, SkipReason> {
        let counter_hz = self
            .counter
            .latest()
            .await
            .ok_or(SkipReason::NoCounterData)?
            .frequency_hz;

        if let Some(previous_hz) = self.state.last_counter_hz.replace(counter_hz) {
            if (counter_hz - previous_hz).abs() > self.config.counter_jump_hz {
                return Err(SkipReason::Ramping {
                    previous_hz,
                    current_hz: counter_hz,
                });
            }
        }

        if self.state.mode != TrackerMode::Search {
            if let Some(center_hz) = self.state.center_hz {
                if (counter_hz - center_hz).abs() > self.config.lock_loss_hz {
                    self.transition(TrackerMode::Search, "counter diverged from measured center");
                }
            }
        }

        let mode = self.state.mode;
        let setting = self.sweep_setting(counter_hz)?;
        let (mut applied, mut peak) = self.sweep_and_find_peak(&setting).await?;
        self.check_peak(peak)?;

        let fwhm_hz = match self.measure_width(peak, applied.window()).await {
            Ok(width) => Some(width),
            Err(e) if e.kind() == FailureKind::Measurement => {
                let wider = SweepSetting::new(
                    applied.center_frequency,
                    applied.span * 2.0,
                    applied.resolution_bandwidth,
                    applied.video_bandwidth,
                    self.analyzer.options().range_policy,
                )?;
                warn!("{}; widening span to {:.0} Hz and retrying", e, wider.span);
                (applied, peak) = self.sweep_and_find_peak(&wider).await?;
                self.check_peak(peak)?;
                match self.measure_width(peak, applied.window()).await {
                    Ok(width) => Some(width),
                    Err(e) if mode == TrackerMode::Search && e.kind() == FailureKind::Measurement => {
                        debug!("No width while searching: {}", e);
                        None
                    }
                    Err(e) => return Err(self.width_lost(peak, e)),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let center_hz = peak.frequency_hz;
        self.state.center_hz = Some(center_hz);
        if fwhm_hz.is_some() {
            self.state.fwhm_hz = fwhm_hz;
        }
        if mode != TrackerMode::Search {
            self.state.history.push(center_hz);
        }
        let stable = self.state.history.is_stable(self.config.center_tolerance_hz)
            && fwhm_hz.is_some_and(|w| w < self.config.fwhm_threshold_hz);

        match mode {
            TrackerMode::Search => {
                self.state.history.clear();
                self.transition(TrackerMode::Narrow, "peak found");
            }
            TrackerMode::Narrow if stable => {
                self.transition(TrackerMode::Zoomed, "center and width stable");
            }
            TrackerMode::Zoomed if !stable => {
                self.transition(TrackerMode::Narrow, "center or width unstable");
            }
            _ => {}
        }

        let estimate = BeatnoteEstimate {
            center_frequency_hz: center_hz,
            fwhm_hz,
            stable,
            mode,
            amplitude_db: peak.amplitude_db,
            span_hz: applied.span,
            resolution_bandwidth_hz: applied.resolution_bandwidth,
        };
        self.sink.publish(&estimate.to_record());
        self.state.last_estimate = Some(estimate.clone());
        Ok(estimate)
    }

    /// Sweep setting for the current mode.
    fn sweep_setting(&self, counter_hz: f64) -> AppResult<SweepSetting> {
        let c = &self.config;
        let (center, span, rbw) = match (self.state.mode, self.state.center_hz) {
            (TrackerMode::Search, _) | (_, None) => (counter_hz, c.search_span_hz, c.search_rbw_hz),
            (TrackerMode::Narrow, Some(center)) => (center, c.narrow_span_hz, c.narrow_rbw_hz),
            (TrackerMode::Zoomed, Some(center)) => {
                let span = self.zoomed_span(self.state.fwhm_hz);
                (center, span, self.zoomed_rbw(span))
            }
        };
        SweepSetting::new(center, span, rbw, rbw, self.analyzer.options().range_policy)
    }

    /// Span used in ZOOMED mode for a measured linewidth.
    pub fn zoomed_span(&self, fwhm_hz: Option<f64>) -> f64 {
        let c = &self.config;
        let by_width = fwhm_hz.map_or(0.0, |w| w * c.zoomed_span_fwhm_factor);
        c.zoomed_span_hz.max(by_width).min(c.narrow_span_hz)
    }

    /// Resolution bandwidth used in ZOOMED mode for a span.
    pub fn zoomed_rbw(&self, span_hz: f64) -> f64 {
        snap_rbw((span_hz * ZOOMED_RBW_SPAN_RATIO).max(self.config.zoomed_rbw_hz))
    }

    async fn sweep_and_find_peak(
        &mut self,
        setting: &SweepSetting,
    ) -> AppResult<(SweepSetting, MarkerReading)> {
        let applied = self.analyzer.apply_sweep(setting).await?;
        self.state.span_hz = Some(applied.span);
        self.state.rbw_hz = Some(applied.resolution_bandwidth);
        self.analyzer.acquire_sweep().await?;

        let marker = self.state.markers.peak;
        self.analyzer.marker_to_peak(marker).await?;
        let peak = self.analyzer.read_marker(marker).await?;
        Ok((applied, peak))
    }

    fn check_peak(&mut self, peak: MarkerReading) -> Result<(), SkipReason> {
        if peak.amplitude_db >= self.config.noise_floor_db {
            return Ok(());
        }
        if self.state.mode != TrackerMode::Search {
            self.transition(TrackerMode::Search, "peak lost");
        }
        Err(SkipReason::NoPeak {
            amplitude_db: peak.amplitude_db,
        })
    }

    async fn measure_width(&mut self, peak: MarkerReading, window: FrequencyWindow) -> AppResult<f64> {
        match self.config.width_method {
            WidthMethod::MarkerSearch => {
                let search =
                    CrossingSearch::over_trace(window, self.sweep_points, self.config.half_power_db);
                let mut levels = MarkerLevels::new(&mut self.analyzer, self.state.markers);
                Ok(fwhm::measure_fwhm(&mut levels, peak, &search).await?.width_hz())
            }
            WidthMethod::InstrumentNdb => {
                let marker = self.state.markers.peak;
                self.analyzer
                    .set_ndb_down(marker, self.config.half_power_db)
                    .await?;
                self.analyzer.set_ndb_down_enabled(marker, true).await?;
                let (lower, upper) = self.analyzer.ndb_down_frequencies(marker).await?;
                if upper <= lower {
                    return Err(MonitorError::Measurement(format!(
                        "N-dB-down points out of order: {} / {} Hz",
                        lower, upper
                    )));
                }
                Ok(upper - lower)
            }
        }
    }

    /// No width even on the widened sweep: follow its peak and restart the
    /// stability count, falling back from ZOOMED to NARROW.
    fn width_lost(&mut self, peak: MarkerReading, err: MonitorError) -> SkipReason {
        if err.kind() == FailureKind::Measurement && self.state.mode != TrackerMode::Search {
            self.state.center_hz = Some(peak.frequency_hz);
            self.state.history.clear();
            if self.state.mode == TrackerMode::Zoomed {
                self.transition(TrackerMode::Narrow, "linewidth not measurable");
            }
        }
        err.into()
    }

    fn transition(&mut self, to: TrackerMode, reason: &str) {
        let from = self.state.mode;
        if from == to {
            return;
        }
        info!(from = %from, to = %to, reason, "Tracker mode {} -> {}", from, to);
        self.state.mode = to;
        if to == TrackerMode::Search {
            self.state.history.clear();
            self.state.center_hz = None;
            self.state.fwhm_hz = None;
        }
    }

    /// Iterate until `stop` turns true (or its sender is dropped).
    ///
    /// # Errors
    ///
    /// [`MonitorError::TooManyFailures`] once `max_consecutive_failures` link
    /// failures happen in a row.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> AppResult<()> {
        info!("Beat note tracker started in {} mode", self.state.mode);
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            self.step().await;
            if self.state.failures.is_exhausted() {
                let failures = self.state.failures.consecutive();
                error!("Stopping tracker after {} consecutive failed iterations", failures);
                return Err(MonitorError::TooManyFailures(failures));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(
            "Beat note tracker stopped after {} iterations",
            self.state.iterations
        );
        Ok(())
    }
}

impl<T, S, P> BeatnoteTracker<T, S, P>
where
    T: Transport + 'static,
    S: FrequencySource + 'static,
    P: PublishSink + 'static,
{
    /// Spawn [`run`](Self::run) on the tokio runtime.
    pub fn start(mut self) -> TrackerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let result = self.run(stop_rx).await;
            result.map(|()| self.into_state())
        });
        TrackerHandle { stop, task }
    }
}

/// Control surface of a running tracker
///
/// Dropping the handle also stops the loop at its next iteration boundary.
pub struct TrackerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<AppResult<TrackerState>>,
}

impl TrackerHandle {
    /// Ask the loop to stop after the current iteration.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Whether the loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request a stop and wait for the loop to end.
    pub async fn stop(self) -> AppResult<TrackerState> {
        self.request_stop();
        self.join().await
    }

    /// Wait for the loop to end on its own.
    pub async fn join(self) -> AppResult<TrackerState> {
        self.task
            .await
            .map_err(|e| MonitorError::Task(e.to_string()))?
    }

    /// Run until `signal` completes or the loop ends on its own, whichever
    /// comes first, then wait for the loop to end.
    pub async fn stop_on<F>(self, signal: F) -> AppResult<TrackerState>
    where
        F: Future<Output = ()>,
    {
        let TrackerHandle { stop, mut task } = self;
        tokio::select! {
            _ = signal => {
                stop.send_replace(true);
            }
            joined = &mut task => {
                return joined.map_err(|e| MonitorError::Task(e.to_string()))?;
            }
        }
        task.await.map_err(|e| MonitorError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use crate::counter::{FixedSource, WatchSource};
    use crate::error_recovery::RetryPolicy;
    use crate::instrument::{AnalyzerOptions, SimulatedAnalyzer};
    use crate::publish::{BeatnoteRecord, ChannelSink};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    fn options() -> AnalyzerOptions {
        AnalyzerOptions {
            sweep_timeout: Duration::from_millis(500),
            sweep_poll_interval: Duration::from_millis(10),
            sweep_retry: RetryPolicy::with_retries(1, Duration::from_millis(10)),
            ..AnalyzerOptions::default()
        }
    }

    fn tracker<S: FrequencySource>(
        sim: &SimulatedAnalyzer,
        counter: S,
        config: TrackerConfig,
    ) -> (
        BeatnoteTracker<SimulatedAnalyzer, S, ChannelSink>,
        mpsc::Receiver<BeatnoteRecord>,
    ) {
        let (sink, rx) = ChannelSink::channel(64);
        let analyzer = SpectrumAnalyzer::new(sim.clone(), options());
        (BeatnoteTracker::new(analyzer, counter, sink, config, 500), rx)
    }

    fn simulator() -> SimulatedAnalyzer {
        SimulatedAnalyzer::new().with_sweep_time(Duration::from_millis(20))
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_counter_reading_skips_without_sweeping() {
        let sim = simulator();
        let (_feed, source) = WatchSource::channel(Duration::from_secs(1));
        let (mut tracker, _rx) = tracker(&sim, source, TrackerConfig::default());
        let outcome = tracker.step().await;
        assert!(matches!(
            outcome.skip_reason(),
            Some(SkipReason::NoCounterData)
        ));
        assert_eq!(sim.sweeps(), 0);
        assert_eq!(tracker.mode(), TrackerMode::Search);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramping_counter_skips_one_iteration() {
        let sim = simulator();
        let (feed, source) = WatchSource::channel(Duration::from_secs(10));
        let (mut tracker, mut rx) = tracker(&sim, source, TrackerConfig::default());

        feed.publish(21.0e6);
        assert!(tracker.step().await.estimate().is_some());

        feed.publish(21.2e6);
        assert!(matches!(
            tracker.step().await.skip_reason(),
            Some(SkipReason::Ramping { .. })
        ));

        feed.publish(21.2e6);
        assert!(tracker.step().await.skip_reason().is_none());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_sweep_timeout_is_logged_and_skipped() {
        let sim = simulator();
        sim.set_hang(true);
        let (mut tracker, mut rx) = tracker(&sim, FixedSource::new(21.0e6), TrackerConfig::default());

        let outcome = tracker.step().await;
        let reason = outcome.skip_reason().unwrap();
        assert_eq!(reason.kind(), Some(FailureKind::Timeout));
        assert_eq!(tracker.state().failures.consecutive(), 1);
        assert_eq!(tracker.mode(), TrackerMode::Search);
        assert!(rx.try_recv().is_err());
        assert!(logs_contain("Skipping iteration"));
        assert!(logs_contain("timed out"));

        sim.set_hang(false);
        assert!(tracker.step().await.estimate().is_some());
        assert_eq!(tracker.state().failures.consecutive(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_divergence_returns_to_search() {
        let sim = simulator();
        let (feed, source) = WatchSource::channel(Duration::from_secs(10));
        let config = TrackerConfig {
            counter_jump_hz: 10.0e6,
            ..TrackerConfig::default()
        };
        let (mut tracker, _rx) = tracker(&sim, source, config);

        feed.publish(21.0e6);
        tracker.step().await;
        tracker.step().await;
        assert_eq!(tracker.mode(), TrackerMode::Narrow);

        feed.publish(21.2e6);
        let outcome = tracker.step().await;
        let estimate = outcome.estimate().unwrap();
        assert_eq!(estimate.mode, TrackerMode::Search);
        assert!((estimate.center_frequency_hz - 21.000_05e6).abs() < 20.0e3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skirt_off_screen_widens_once() {
        let sim = simulator();
        sim.set_signal(crate::instrument::SimulatedSignal {
            fwhm_hz: 3.0e3,
            ..sim.signal()
        });
        let config = TrackerConfig {
            narrow_span_hz: 2.0e3,
            narrow_rbw_hz: 10.0,
            zoomed_span_hz: 250.0,
            ..TrackerConfig::default()
        };
        let (mut tracker, _rx) = tracker(&sim, FixedSource::new(21.0e6), config);
        tracker.step().await;
        assert_eq!(tracker.mode(), TrackerMode::Narrow);
        let searched = tracker.state().center_hz.unwrap();

        let before = sim.sweeps();
        let outcome = tracker.step().await;
        assert_eq!(sim.sweeps(), before + 2);
        // The skirt runs off the narrow span and off the doubled one.
        assert_eq!(
            outcome.skip_reason().and_then(SkipReason::kind),
            Some(FailureKind::Measurement)
        );
        assert_eq!(tracker.state().span_hz, Some(4.0e3));
        // The widened sweep's peak becomes the next center.
        let center = tracker.state().center_hz.unwrap();
        let target = sim.signal().center_hz;
        assert!((center - target).abs() < (searched - target).abs());
        assert!((center - searched).abs() <= 2.0e3 + 1.0);
        assert!(tracker.state().history.is_empty());
        assert_eq!(tracker.mode(), TrackerMode::Narrow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_failures_stop_the_loop() {
        let mock = MockTransport::new();
        let config = TrackerConfig {
            max_consecutive_failures: 3,
            poll_interval_ms: 10,
            ..TrackerConfig::default()
        };
        let (sink, _rx) = ChannelSink::channel(4);
        let analyzer = SpectrumAnalyzer::new(mock, options());
        let tracker = BeatnoteTracker::new(analyzer, FixedSource::new(21.0e6), sink, config, 500);

        let err = tracker.start().join().await.unwrap_err();
        assert!(matches!(err, MonitorError::TooManyFailures(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let sim = simulator();
        let (tracker, mut rx) = tracker(&sim, FixedSource::new(21.0e6), TrackerConfig::default());
        let handle = tracker.start();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!handle.is_finished());
        let state = handle.stop().await.unwrap();
        assert!(state.iterations >= 2);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_signal() {
        let sim = simulator();
        let (tracker, _rx) = tracker(&sim, FixedSource::new(21.0e6), TrackerConfig::default());
        let state = tracker
            .start()
            .stop_on(tokio::time::sleep(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(state.iterations >= 2);
        assert_ne!(state.mode, TrackerMode::Search);
    }

    #[test]
    fn test_zoomed_span_and_rbw() {
        let sim = SimulatedAnalyzer::new();
        let (tracker, _rx) = tracker(&sim, FixedSource::new(21.0e6), TrackerConfig::default());
        assert_eq!(tracker.zoomed_span(None), 250.0);
        assert_eq!(tracker.zoomed_span(Some(40.0)), 250.0);
        assert_eq!(tracker.zoomed_span(Some(1_000.0)), 5_000.0);
        assert_eq!(tracker.zoomed_span(Some(1.0e6)), 50.0e3);
        assert_eq!(tracker.zoomed_rbw(250.0), 20.0);
        assert_eq!(tracker.zoomed_rbw(5_000.0), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_configures_markers() {
        let sim = simulator();
        let (mut tracker, _rx) = tracker(&sim, FixedSource::new(21.0e6), TrackerConfig::default());
        let idn = tracker.prepare("FSEB 20").await.unwrap();
        assert!(idn.contains("FSEB 20"));
        for marker in 1..=3 {
            assert!(tracker.analyzer_mut().marker_enabled(marker).await.unwrap());
        }
        assert!(!tracker.analyzer_mut().continuous().await.unwrap());
    }
}
