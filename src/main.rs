//! Beat note monitor command-line entry point.
//!
//! Connects to the FSEB20 through the Prologix controller (or the built-in
//! simulator with `--simulate`), then runs the tracking loop until Ctrl-C.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use beatnote_monitor::adapters::{PrologixAdapter, PrologixSettings, SerialTransport, Transport};
use beatnote_monitor::config::{MonitorConfig, TransportConfig, DEFAULT_CONFIG_PATH};
use beatnote_monitor::counter::{spawn_line_reader, FixedSource, FrequencySource, WatchSource};
use beatnote_monitor::instrument::{
    AnalyzerOptions, SimulatedAnalyzer, SimulatedSignal, SpectrumAnalyzer,
};
use beatnote_monitor::publish::sink_from_config;
use beatnote_monitor::tracker::BeatnoteTracker;

#[derive(Parser, Debug)]
#[command(name = "beatnote_monitor", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run against a simulated analyzer instead of the GPIB link
    #[arg(long)]
    simulate: bool,

    /// Use a fixed counter frequency (Hz) instead of the counter stream
    #[arg(long, value_name = "HZ")]
    counter_hz: Option<f64>,

    /// Serial device of the Prologix controller (overrides the config)
    #[arg(long)]
    port: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MonitorConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.transport.port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting {}", config.application.name);

    let counter = match cli.counter_hz {
        Some(hz) => fixed_counter(hz),
        None if cli.simulate && config.counter.address.is_none() => {
            fixed_counter(SimulatedSignal::default().center_hz)
        }
        None => open_counter(&config).await?,
    };

    let transport: Box<dyn Transport> = if cli.simulate {
        info!("Using the simulated analyzer");
        Box::new(
            SimulatedAnalyzer::new()
                .with_points(config.analyzer.sweep_points)
                .with_jitter(rand::random(), 0.5),
        )
    } else {
        Box::new(open_prologix(&config.transport).await?)
    };

    let options = AnalyzerOptions::from_config(&config.analyzer, &config.transport);
    let analyzer = SpectrumAnalyzer::new(transport, options);
    let (sink, writer) = sink_from_config(&config.publish)
        .await
        .context("Failed to open the publish sink")?;

    let mut tracker = BeatnoteTracker::new(
        analyzer,
        counter,
        sink,
        config.tracker.clone(),
        config.analyzer.sweep_points,
    );
    tracker
        .prepare(&config.analyzer.expected_identity)
        .await
        .context("Failed to prepare the analyzer")?;

    let result = tracker
        .start()
        .stop_on(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Ctrl-C received, stopping");
        })
        .await;
    // The tracker and its sink are gone; drain what is still queued.
    writer.finish().await;
    let state = result?;

    match state.last_estimate {
        Some(estimate) => info!(
            "Last beat note {:.1} Hz in {} mode ({} iterations)",
            estimate.center_frequency_hz, estimate.mode, state.iterations
        ),
        None => info!("Stopped after {} iterations without a measurement", state.iterations),
    }
    Ok(())
}

async fn open_prologix(config: &TransportConfig) -> Result<PrologixAdapter<SerialTransport>> {
    let mut serial = SerialTransport::new(&config.port, config.baud_rate)
        .with_line_terminator(config.line_terminator.clone())
        .with_response_delimiter(config.response_delimiter);
    serial
        .connect()
        .with_context(|| format!("Failed to open {}", config.port))?;

    let mut adapter = PrologixAdapter::new(serial, PrologixSettings::from_config(config));
    adapter
        .configure()
        .await
        .context("Failed to configure the Prologix controller")?;
    match adapter.controller_version(config.read_timeout()).await {
        Ok(version) => info!("Prologix controller: {}", version),
        Err(e) => warn!("Prologix controller did not report a version: {}", e),
    }
    Ok(adapter)
}

fn fixed_counter(hz: f64) -> Box<dyn FrequencySource> {
    info!("Using a fixed counter frequency of {} Hz", hz);
    Box::new(FixedSource::new(hz))
}

async fn open_counter(config: &MonitorConfig) -> Result<Box<dyn FrequencySource>> {
    let Some(address) = &config.counter.address else {
        bail!("No frequency counter: set counter.address or pass --counter-hz");
    };
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("Failed to connect to the counter at {}", address))?;
    info!("Reading counter stream from {}", address);

    let (feed, source) = WatchSource::channel(config.counter.max_age());
    spawn_line_reader(BufReader::new(stream), config.counter.topic.clone(), feed);
    Ok(Box::new(source))
}
