//! Publish sinks
//!
//! Every measured iteration produces one [`BeatnoteRecord`]. Sinks are
//! fire-and-forget: [`PublishSink::publish`] never waits for the consumer and
//! drops records the consumer cannot keep up with.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{PublishConfig, SinkKind};
use crate::error::{AppResult, MonitorError};
use crate::tracker::TrackerMode;

const JSON_LINES_QUEUE: usize = 256;

/// One published beat note measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeatnoteRecord {
    /// When the measurement completed
    pub timestamp: DateTime<Utc>,
    /// Measured beat note frequency (Hz)
    pub center_frequency_hz: f64,
    /// Measured linewidth, if a width could be taken (Hz)
    pub fwhm_hz: Option<f64>,
    /// Whether the tracker considers the reading stable
    pub stable: bool,
    /// Tracker mode the measurement was taken in
    pub mode: TrackerMode,
    /// Resolution bandwidth of the sweep (Hz)
    pub resolution_bandwidth_hz: f64,
}

/// Destination for [`BeatnoteRecord`]s.
pub trait PublishSink: Send {
    /// Hand over a record without waiting for delivery.
    fn publish(&mut self, record: &BeatnoteRecord);
}

impl<S: PublishSink + ?Sized> PublishSink for Box<S> {
    fn publish(&mut self, record: &BeatnoteRecord) {
        (**self).publish(record);
    }
}

/// Emits each record as an `info` event on the `beatnote` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl PublishSink for LogSink {
    fn publish(&mut self, record: &BeatnoteRecord) {
        info!(
            target: "beatnote",
            center_hz = record.center_frequency_hz,
            fwhm_hz = record.fwhm_hz,
            stable = record.stable,
            mode = ?record.mode,
            rbw_hz = record.resolution_bandwidth_hz,
            "Beat note at {:.1} Hz",
            record.center_frequency_hz
        );
    }
}

/// Forwards records into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<BeatnoteRecord>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BeatnoteRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl PublishSink for ChannelSink {
    fn publish(&mut self, record: &BeatnoteRecord) {
        if let Err(e) = self.tx.try_send(record.clone()) {
            debug!("Dropping beat note record: {}", e);
        }
    }
}

/// Appends records as JSON lines to a file from a background task.
pub struct JsonLinesSink {
    inner: ChannelSink,
    path: PathBuf,
}

/// Background task behind a sink.
///
/// Dropping every clone of the sink ends the task once the queued records are
/// written; [`finish`](SinkWriter::finish) waits for that.
#[derive(Debug, Default)]
pub struct SinkWriter {
    task: Option<JoinHandle<()>>,
}

impl SinkWriter {
    /// Wait until the sink is gone and its queue drained.
    pub async fn finish(self) {
        let Some(task) = self.task else {
            return;
        };
        if let Err(e) = task.await {
            warn!("Publish writer task failed: {}", e);
        }
    }
}

impl JsonLinesSink {
    /// Open (or create) `path` for appending and start the writer task.
    pub async fn create(path: impl AsRef<Path>) -> AppResult<(Self, SinkWriter)> {
        let path = path.as_ref().to_path_buf();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let (inner, mut rx) = ChannelSink::channel(JSON_LINES_QUEUE);
        let target = path.clone();
        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let mut line = match serde_json::to_string(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Cannot serialize beat note record: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                let written = async {
                    file.write_all(line.as_bytes()).await?;
                    file.flush().await
                };
                if let Err(e) = written.await {
                    warn!("Writing {} failed: {}", target.display(), e);
                }
            }
            debug!("JSON-lines writer for {} finished", target.display());
        });
        info!("Publishing beat note records to {}", path.display());
        Ok((Self { inner, path }, SinkWriter { task: Some(task) }))
    }

    /// Output file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PublishSink for JsonLinesSink {
    fn publish(&mut self, record: &BeatnoteRecord) {
        self.inner.publish(record);
    }
}

/// Passes at most one record per `min_interval` to the wrapped sink.
pub struct Throttled<S> {
    sink: S,
    min_interval: Duration,
    last: Option<Instant>,
}

impl<S: PublishSink> Throttled<S> {
    /// Wrap `sink`; a zero interval passes every record.
    pub fn new(sink: S, min_interval: Duration) -> Self {
        Self {
            sink,
            min_interval,
            last: None,
        }
    }

    /// Unwrap the sink.
    pub fn into_inner(self) -> S {
        self.sink
    }
}

impl<S: PublishSink> PublishSink for Throttled<S> {
    fn publish(&mut self, record: &BeatnoteRecord) {
        let now = Instant::now();
        if let Some(last) = self.last {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }
        self.last = Some(now);
        self.sink.publish(record);
    }
}

/// Build the sink described by the `[publish]` section.
///
/// The returned [`SinkWriter`] must be finished after the sink is dropped so
/// that queued records reach the file.
pub async fn sink_from_config(
    config: &PublishConfig,
) -> AppResult<(Box<dyn PublishSink>, SinkWriter)> {
    let (sink, writer): (Box<dyn PublishSink>, SinkWriter) = match config.sink {
        SinkKind::Log => (Box::new(LogSink), SinkWriter::default()),
        SinkKind::JsonLines => {
            let path = config.path.as_ref().ok_or_else(|| {
                MonitorError::Configuration("publish.path is required for json_lines".to_string())
            })?;
            let (sink, writer) = JsonLinesSink::create(path).await?;
            (Box::new(sink), writer)
        }
    };
    if config.min_interval().is_zero() {
        Ok((sink, writer))
    } else {
        Ok((Box::new(Throttled::new(sink, config.min_interval())), writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(center: f64) -> BeatnoteRecord {
        BeatnoteRecord {
            timestamp: Utc::now(),
            center_frequency_hz: center,
            fwhm_hz: Some(40.0),
            stable: true,
            mode: TrackerMode::Zoomed,
            resolution_bandwidth_hz: 20.0,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (mut sink, mut rx) = ChannelSink::channel(1);
        sink.publish(&record(1.0));
        sink.publish(&record(2.0));
        assert_eq!(rx.recv().await.unwrap().center_frequency_hz, 1.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle() {
        let (inner, mut rx) = ChannelSink::channel(8);
        let mut sink = Throttled::new(inner, Duration::from_millis(400));
        sink.publish(&record(1.0));
        sink.publish(&record(2.0));
        tokio::time::advance(Duration::from_millis(450)).await;
        sink.publish(&record(3.0));
        assert_eq!(rx.recv().await.unwrap().center_frequency_hz, 1.0);
        assert_eq!(rx.recv().await.unwrap().center_frequency_hz, 3.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beatnote.jsonl");
        let (mut sink, writer) = JsonLinesSink::create(&path).await.unwrap();
        sink.publish(&record(21_000_050.0));
        sink.publish(&record(21_000_051.0));
        drop(sink);
        writer.finish().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["center_frequency_hz"], 21_000_050.0);
        assert_eq!(lines[0]["mode"], "zoomed");
        assert_eq!(lines[1]["fwhm_hz"], 40.0);
    }

    #[tokio::test]
    async fn test_configured_sink_flushes_after_owner_drops_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beatnote.jsonl");
        let config = PublishConfig {
            sink: SinkKind::JsonLines,
            path: Some(path.clone()),
            min_interval_ms: 0,
        };
        let (mut sink, writer) = sink_from_config(&config).await.unwrap();
        for i in 0..50 {
            sink.publish(&record(21_000_000.0 + f64::from(i)));
        }
        // The sink goes away with its owner, as when the tracker task ends.
        drop(sink);
        writer.finish().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 50);
    }

    #[tokio::test]
    async fn test_log_sink_writer_finishes_immediately() {
        let (_sink, writer) = sink_from_config(&PublishConfig::default()).await.unwrap();
        writer.finish().await;
    }

    #[tokio::test]
    async fn test_sink_from_config_requires_path() {
        let config = PublishConfig {
            sink: SinkKind::JsonLines,
            path: None,
            min_interval_ms: 0,
        };
        assert!(sink_from_config(&config).await.is_err());
    }
}
