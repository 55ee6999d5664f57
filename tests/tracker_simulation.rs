//! Tracking loop against the simulated FSEB20.

use beatnote_monitor::config::TrackerConfig;
use beatnote_monitor::counter::FixedSource;
use beatnote_monitor::error::FailureKind;
use beatnote_monitor::instrument::{AnalyzerOptions, SimulatedAnalyzer, SpectrumAnalyzer};
use beatnote_monitor::publish::{BeatnoteRecord, ChannelSink};
use beatnote_monitor::tracker::{BeatnoteTracker, SkipReason, TrackerMode};
use std::time::Duration;
use tokio::sync::mpsc;

type SimTracker = BeatnoteTracker<SimulatedAnalyzer, FixedSource, ChannelSink>;

fn setup(counter_hz: f64) -> (SimulatedAnalyzer, SimTracker, mpsc::Receiver<BeatnoteRecord>) {
    let sim = SimulatedAnalyzer::new().with_sweep_time(Duration::from_millis(50));
    let analyzer = SpectrumAnalyzer::new(sim.clone(), AnalyzerOptions::default());
    let (sink, rx) = ChannelSink::channel(64);
    let tracker = BeatnoteTracker::new(
        analyzer,
        FixedSource::new(counter_hz),
        sink,
        TrackerConfig::default(),
        500,
    );
    (sim, tracker, rx)
}

#[tokio::test(start_paused = true)]
async fn test_converges_to_zoomed_and_falls_back_when_peak_vanishes() {
    let (sim, mut tracker, mut rx) = setup(21.0e6);
    tracker
        .prepare("FSEB 20")
        .await
        .expect("simulated analyzer should identify");

    let mut modes = Vec::new();
    for _ in 0..6 {
        let outcome = tracker.step().await;
        assert!(outcome.estimate().is_some(), "{:?}", outcome.skip_reason());
        modes.push(tracker.mode());
    }
    assert_eq!(
        modes,
        [
            TrackerMode::Narrow,
            TrackerMode::Narrow,
            TrackerMode::Narrow,
            TrackerMode::Narrow,
            TrackerMode::Narrow,
            TrackerMode::Zoomed,
        ]
    );

    // Every measured iteration was published.
    let mut published = Vec::new();
    while let Ok(record) = rx.try_recv() {
        published.push(record);
    }
    assert_eq!(published.len(), 6);
    assert_eq!(published[0].mode, TrackerMode::Search);
    assert!(!published[0].stable);
    assert!(published[5].stable);

    // Zoomed sweeps shrink toward the true linewidth.
    for _ in 0..3 {
        let outcome = tracker.step().await;
        let estimate = outcome.estimate().expect("zoomed iteration should measure");
        assert_eq!(estimate.mode, TrackerMode::Zoomed);
    }
    let state = tracker.state();
    assert_eq!(state.mode, TrackerMode::Zoomed);
    assert_eq!(state.span_hz, Some(250.0));
    let fwhm = state.fwhm_hz.expect("width measured");
    assert!((fwhm - 40.0).abs() < 4.0, "fwhm {}", fwhm);
    let center = state.center_hz.expect("center measured");
    assert!((center - sim.signal().center_hz).abs() < 5.0, "center {}", center);

    sim.set_peak_level(-130.0);
    let outcome = tracker.step().await;
    assert!(matches!(outcome.skip_reason(), Some(SkipReason::NoPeak { .. })));
    assert_eq!(tracker.mode(), TrackerMode::Search);
    assert_eq!(tracker.state().center_hz, None);
    assert!(tracker.state().history.is_empty());
}

async fn zoom_in(tracker: &mut SimTracker, steps: usize) {
    for _ in 0..steps {
        assert!(tracker.step().await.estimate().is_some());
    }
    assert_eq!(tracker.mode(), TrackerMode::Zoomed);
}

#[tokio::test(start_paused = true)]
async fn test_center_jump_while_zoomed_drops_to_narrow() {
    let (sim, mut tracker, mut rx) = setup(21.0e6);
    zoom_in(&mut tracker, 6).await;
    while rx.try_recv().is_ok() {}

    sim.set_center(sim.signal().center_hz + 1_500.0);
    let outcome = tracker.step().await;
    let estimate = outcome.estimate().expect("drifted peak is still on screen");
    assert_eq!(estimate.mode, TrackerMode::Zoomed);
    assert!(!estimate.stable);
    assert_eq!(tracker.mode(), TrackerMode::Narrow);

    let record = rx.try_recv().expect("unstable reading is published");
    assert!(!record.stable);
    assert!((record.center_frequency_hz - sim.signal().center_hz).abs() < 10.0);
}

#[tokio::test(start_paused = true)]
async fn test_drift_off_the_zoomed_span_is_reacquired() {
    let (sim, mut tracker, mut rx) = setup(21.0e6);
    zoom_in(&mut tracker, 9).await;
    assert_eq!(tracker.state().span_hz, Some(250.0));
    let zoomed_center = tracker.state().center_hz.expect("center measured");

    let target = sim.signal().center_hz + 2_000.0;
    sim.set_center(target);
    let outcome = tracker.step().await;
    assert_eq!(
        outcome.skip_reason().and_then(SkipReason::kind),
        Some(FailureKind::Measurement)
    );
    // Followed the widened sweep's peak toward the signal.
    assert_eq!(tracker.mode(), TrackerMode::Narrow);
    assert!(tracker.state().history.is_empty());
    let center = tracker.state().center_hz.expect("re-centered");
    assert!((center - target).abs() < (zoomed_center - target).abs());

    while rx.try_recv().is_ok() {}
    for _ in 0..10 {
        tracker.step().await;
    }
    assert_eq!(tracker.mode(), TrackerMode::Zoomed);
    let center = tracker.state().center_hz.expect("center measured");
    assert!((center - target).abs() < 5.0, "center {}", center);

    let published: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(published.len(), 10);
    assert!(published
        .iter()
        .all(|r| (r.center_frequency_hz - target).abs() < 100.0));
}

#[tokio::test(start_paused = true)]
async fn test_search_centers_on_counter_estimate() {
    let (sim, mut tracker, _rx) = setup(21.0e6);
    let outcome = tracker.step().await;
    let estimate = outcome.estimate().expect("search iteration should measure");

    assert_eq!(estimate.mode, TrackerMode::Search);
    assert_eq!(estimate.span_hz, 5.0e6);
    assert_eq!(sim.center_frequency(), 21.0e6);
    assert_eq!(sim.span(), 5.0e6);
    assert_eq!(sim.resolution_bandwidth(), 10.0e3);
    // One search grid step is ~10 kHz.
    assert!((estimate.center_frequency_hz - sim.signal().center_hz).abs() < 10.1e3);
}

#[tokio::test(start_paused = true)]
async fn test_run_survives_a_hung_sweep() {
    let (sim, tracker, mut rx) = setup(21.0e6);
    sim.set_hang(true);
    let handle = tracker.start();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!handle.is_finished());
    assert!(rx.try_recv().is_err());

    sim.set_hang(false);
    tokio::time::sleep(Duration::from_secs(30)).await;
    let state = handle.stop().await.expect("loop should stop cleanly");
    assert!(state.last_estimate.is_some());
    assert_eq!(state.failures.consecutive(), 0);
    assert!(rx.recv().await.is_some());
}
