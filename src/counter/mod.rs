//! Frequency counter input
//!
//! The tracker needs a rough beat note frequency to know where to search. It
//! comes from an external counter that publishes text lines of the form
//!
//! ```text
//! beatnote_freq 1718000000.123 21.000012
//! ```
//!
//! (topic, timestamp, frequency in MHz). [`spawn_line_reader`] turns such a
//! stream into the latest value of a [`WatchSource`]; the tracker only ever
//! asks for the latest reading and treats a missing or stale one as "skip
//! this iteration".

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AppResult, MonitorError};

/// One counter sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterReading {
    /// Counted frequency (Hz)
    pub frequency_hz: f64,
    /// When the sample arrived
    pub received_at: Instant,
}

impl CounterReading {
    /// Reading stamped with the current time.
    pub fn now(frequency_hz: f64) -> Self {
        Self {
            frequency_hz,
            received_at: Instant::now(),
        }
    }
}

/// Source of the rough frequency estimate.
#[async_trait]
pub trait FrequencySource: Send {
    /// Latest usable reading; `None` when there is no data yet or it is stale.
    async fn latest(&mut self) -> Option<CounterReading>;
}

#[async_trait]
impl<S: FrequencySource + ?Sized> FrequencySource for Box<S> {
    async fn latest(&mut self) -> Option<CounterReading> {
        (**self).latest().await
    }
}

/// Writing half of a [`WatchSource`].
#[derive(Debug, Clone)]
pub struct CounterFeed {
    tx: watch::Sender<Option<CounterReading>>,
}

impl CounterFeed {
    /// Publish a new frequency (Hz), replacing the previous one.
    pub fn publish(&self, frequency_hz: f64) {
        self.tx.send_replace(Some(CounterReading::now(frequency_hz)));
    }

    /// Forget the current reading.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}

/// Latest-value frequency source with a staleness bound.
#[derive(Debug, Clone)]
pub struct WatchSource {
    rx: watch::Receiver<Option<CounterReading>>,
    max_age: Duration,
}

impl WatchSource {
    /// Create a connected feed and source pair.
    pub fn channel(max_age: Duration) -> (CounterFeed, WatchSource) {
        let (tx, rx) = watch::channel(None);
        (CounterFeed { tx }, WatchSource { rx, max_age })
    }
}

#[async_trait]
impl FrequencySource for WatchSource {
    async fn latest(&mut self) -> Option<CounterReading> {
        let reading = (*self.rx.borrow_and_update())?;
        if reading.received_at.elapsed() > self.max_age {
            debug!(
                "Counter reading {:.0} Hz is stale ({:?} old)",
                reading.frequency_hz,
                reading.received_at.elapsed()
            );
            return None;
        }
        Some(reading)
    }
}

/// A counter that always reads the same frequency.
///
/// Stands in for the counter when the operator supplies the frequency by hand.
#[derive(Debug, Clone, Copy)]
pub struct FixedSource {
    frequency_hz: f64,
}

impl FixedSource {
    /// Source that always reports `frequency_hz`.
    pub fn new(frequency_hz: f64) -> Self {
        Self { frequency_hz }
    }
}

#[async_trait]
impl FrequencySource for FixedSource {
    async fn latest(&mut self) -> Option<CounterReading> {
        Some(CounterReading::now(self.frequency_hz))
    }
}

/// Parse one counter line (`<topic> <timestamp> <MHz>`) into Hz.
///
/// Lines for another topic are rejected like malformed ones.
pub fn parse_counter_message(line: &str, topic: &str) -> AppResult<f64> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        [found, _, mhz, ..] if *found == topic => {
            let mhz: f64 = mhz
                .parse()
                .map_err(|_| MonitorError::protocol(topic, line))?;
            if !mhz.is_finite() || mhz <= 0.0 {
                return Err(MonitorError::protocol(topic, line));
            }
            Ok(mhz * 1.0e6)
        }
        _ => Err(MonitorError::protocol(topic, line)),
    }
}

/// Read counter lines from `reader` and publish each parsed frequency.
///
/// The task ends when the stream ends or fails. Unparseable lines are logged
/// and skipped.
pub fn spawn_line_reader<R>(reader: R, topic: String, feed: CounterFeed) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_counter_message(&line, &topic) {
                    Ok(hz) => feed.publish(hz),
                    Err(e) => debug!("Ignoring counter line: {}", e),
                },
                Ok(None) => {
                    info!("Counter stream closed");
                    break;
                }
                Err(e) => {
                    warn!("Counter stream failed: {}", e);
                    break;
                }
            }
        }
    })
}
