//! kiwi-devices: inspect and exercise audio devices through the Kiwi device layer
//!
//! - `drivers`: List the available drivers
//! - `devices`: List input and output devices of a driver
//! - `caps`: Show the sample rates and vector sizes of a selection
//! - `run`: Open a stream with a built-in graph and report callback statistics
//!
//! `--simulated` swaps the hardware for an in-process subsystem whose periods
//! are pumped from a background thread at real-time pace.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use kiwi_device::backend::cpal::CpalHost;
use kiwi_device::backend::simulated::SimulatedHardware;
use kiwi_device::{
    CallbackStats, DeviceDescriptor, DeviceManager, DspGraph, InterleavedDeviceManager, ManagerOptions, Passthrough,
    PlanarDeviceManager, SessionState, Silence, SineTone, StreamConfiguration, TickFault,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SIMULATED_ID: &str = "kiwi-devices";

/// Inspect and exercise audio devices
#[derive(Parser)]
#[command(name = "kiwi-devices")]
#[command(about = "Enumerate audio drivers and devices, and run test streams")]
#[command(version)]
struct Cli {
    /// Path to a JSON options file (default: auto-detect)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Use the simulated audio subsystem instead of real hardware
    #[arg(long, global = true)]
    simulated: bool,

    /// Use the planar device manager (JACK, or the simulated planar devices)
    #[arg(long, global = true)]
    planar: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum GraphKind {
    Silence,
    Passthrough,
    Sine,
}

#[derive(Args, Debug, Default, Clone)]
struct Selection {
    /// Driver (host API or device type) name
    #[arg(long)]
    driver: Option<String>,

    /// Input device name
    #[arg(long)]
    input: Option<String>,

    /// Output device name
    #[arg(long)]
    output: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available drivers
    Drivers,

    /// List the devices of a driver
    Devices {
        /// Driver to list (default: the configured or default driver)
        #[arg(long)]
        driver: Option<String>,
    },

    /// Show available sample rates and vector sizes
    Caps {
        #[command(flatten)]
        selection: Selection,
    },

    /// Open a stream and run a built-in graph
    Run {
        #[command(flatten)]
        selection: Selection,

        /// Sample rate in Hz
        #[arg(long)]
        rate: Option<u32>,

        /// Vector size in frames
        #[arg(long)]
        vector: Option<usize>,

        /// How long to run
        #[arg(short, long, default_value_t = 2.0)]
        seconds: f64,

        /// Graph to run
        #[arg(short, long, default_value = "sine")]
        graph: GraphKind,

        /// Frequency of the sine graph in Hz
        #[arg(long, default_value_t = 440.0)]
        frequency: f64,
    },
}

fn default_config_path() -> PathBuf {
    if let Ok(override_path) = std::env::var("KIWI_DEVICE_CONFIG") {
        return PathBuf::from(override_path);
    }

    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    config_dir.join("kiwi").join("devices.json")
}

/// An explicit `--config` must exist; the default path is optional.
fn load_options(explicit: Option<&PathBuf>) -> Result<ManagerOptions> {
    match explicit {
        Some(path) => {
            ManagerOptions::load(path).with_context(|| format!("Failed to load options from {}", path.display()))
        }
        None => {
            let path = default_config_path();
            if path.exists() {
                ManagerOptions::load(&path).with_context(|| format!("Failed to load options from {}", path.display()))
            } else {
                Ok(ManagerOptions::default())
            }
        }
    }
}

fn apply_selection(options: &mut ManagerOptions, selection: &Selection) {
    if let Some(driver) = &selection.driver {
        options.driver = Some(driver.clone());
    }
    if let Some(input) = &selection.input {
        options.input_device = Some(input.clone());
    }
    if let Some(output) = &selection.output {
        options.output_device = Some(output.clone());
    }
}

fn build_graph(kind: GraphKind, frequency: f64) -> Box<dyn DspGraph> {
    match kind {
        GraphKind::Silence => Box::new(Silence),
        GraphKind::Passthrough => Box::new(Passthrough),
        GraphKind::Sine => Box::new(SineTone::new(frequency, 0.25)),
    }
}

/// A manager plus the simulated hardware behind it, if any.
struct Session {
    manager: Box<dyn DeviceManager>,
    hardware: Option<SimulatedHardware>,
}

fn open_session(cli: &Cli, options: ManagerOptions, graph: Box<dyn DspGraph>) -> Result<Session> {
    options.validate().context("Invalid options")?;

    if cli.simulated {
        let hardware = SimulatedHardware::stock(SIMULATED_ID);
        let manager: Box<dyn DeviceManager> = if cli.planar {
            Box::new(PlanarDeviceManager::with_graph(hardware.device_types(), options, graph)?)
        } else {
            Box::new(InterleavedDeviceManager::with_graph(hardware.clone(), options, graph)?)
        };
        return Ok(Session {
            manager,
            hardware: Some(hardware),
        });
    }

    let manager: Box<dyn DeviceManager> = if cli.planar {
        open_planar_hardware(options, graph)?
    } else {
        Box::new(InterleavedDeviceManager::with_graph(CpalHost::new(), options, graph)?)
    };
    Ok(Session {
        manager,
        hardware: None,
    })
}

#[cfg(feature = "jack")]
fn open_planar_hardware(options: ManagerOptions, graph: Box<dyn DspGraph>) -> Result<Box<dyn DeviceManager>> {
    use kiwi_device::backend::jack::JackDeviceType;

    let types: Vec<Box<dyn kiwi_device::planar::device::DeviceType>> = vec![Box::new(JackDeviceType::new())];
    Ok(Box::new(PlanarDeviceManager::with_graph(types, options, graph)?))
}

#[cfg(not(feature = "jack"))]
fn open_planar_hardware(_options: ManagerOptions, _graph: Box<dyn DspGraph>) -> Result<Box<dyn DeviceManager>> {
    bail!("Planar hardware needs the `jack` feature; use --simulated for the simulated planar devices")
}

/// Background thread playing the hardware for a simulated session.
struct Pump {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<f32>,
}

impl Pump {
    fn spawn(hardware: SimulatedHardware) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut peak = 0.0f32;
            while !flag.load(Ordering::Relaxed) {
                let Some(period) = hardware.period_duration() else {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                };
                if let Some(outputs) = hardware.run_period(&[]) {
                    for sample in outputs.iter().flatten() {
                        peak = peak.max(sample.abs());
                    }
                }
                thread::sleep(period);
            }
            peak
        });
        Self { stop, handle }
    }

    /// Stop pumping and return the output peak seen.
    fn finish(self) -> f32 {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap_or(0.0)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_configuration(config: &StreamConfiguration, state: SessionState) {
    let none = || "-".dimmed().to_string();
    println!("{:>14} {}", "STATE".bold(), state.to_string().cyan());
    println!(
        "{:>14} {}",
        "DRIVER".bold(),
        config.driver.clone().unwrap_or_else(none)
    );
    println!(
        "{:>14} {} ({} ch)",
        "INPUT".bold(),
        config.input_device.clone().unwrap_or_else(none),
        config.input_channels
    );
    println!(
        "{:>14} {} ({} ch)",
        "OUTPUT".bold(),
        config.output_device.clone().unwrap_or_else(none),
        config.output_channels
    );
    println!("{:>14} {} Hz", "SAMPLE RATE".bold(), config.sample_rate.to_string().yellow());
    println!("{:>14} {} frames", "VECTOR SIZE".bold(), config.vector_size.to_string().yellow());
}

fn format_ns(ns: f64) -> String {
    if ns >= 1_000_000.0 {
        format!("{:.2}ms", ns / 1_000_000.0)
    } else if ns >= 1_000.0 {
        format!("{:.2}µs", ns / 1_000.0)
    } else {
        format!("{:.0}ns", ns)
    }
}

fn print_stats(stats: &CallbackStats) {
    println!(
        "callbacks={} ticks={} faults={} contended={}",
        stats.callbacks.to_string().cyan(),
        stats.ticks.to_string().cyan(),
        if stats.faults > 0 {
            stats.faults.to_string().red()
        } else {
            stats.faults.to_string().green()
        },
        stats.contended.to_string().dimmed()
    );
    println!(
        "tick avg={} peak={} usage avg={:.1}% peak={:.1}%",
        format_ns(stats.avg_tick_ns).yellow(),
        format_ns(stats.peak_tick_ns as f64).red(),
        stats.avg_usage * 100.0,
        stats.peak_usage * 100.0
    );
}

fn cmd_drivers(session: &Session, format: OutputFormat) -> Result<()> {
    let drivers = session.manager.drivers();
    let current = session.manager.driver_name();

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "drivers": drivers,
            "current": current,
        }));
    }

    for driver in &drivers {
        if Some(driver.name.as_str()) == current {
            println!("{} {}", "*".green(), driver.name.cyan());
        } else {
            println!("  {}", driver.name);
        }
    }
    Ok(())
}

fn cmd_devices(session: &mut Session, format: OutputFormat) -> Result<()> {
    let devices: Vec<DeviceDescriptor> = session.manager.devices();

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "driver": session.manager.driver_name(),
            "devices": devices,
        }));
    }

    println!("{:>30} {:>10} {:>10}", "DEVICE", "DIRECTION", "CHANNELS");
    println!("{}", "-".repeat(52));
    for device in &devices {
        println!(
            "{:>30} {:>10} {:>10}",
            device.name.cyan(),
            device.direction.to_string(),
            device.max_channels.to_string().yellow()
        );
    }
    println!("{}", "-".repeat(52));
    println!(
        "Showing {} devices for {}",
        devices.len(),
        session.manager.driver_name().unwrap_or("no driver")
    );
    Ok(())
}

fn cmd_caps(session: &Session, format: OutputFormat) -> Result<()> {
    let rates = session.manager.available_sample_rates();
    let sizes = session.manager.available_vector_sizes();

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "configuration": session.manager.configuration(),
            "state": session.manager.state(),
            "sampleRates": rates,
            "vectorSizes": sizes,
        }));
    }

    print_configuration(session.manager.configuration(), session.manager.state());
    println!("{}", "-".repeat(52));
    let join = |values: Vec<String>| if values.is_empty() { "-".to_string() } else { values.join(" ") };
    println!(
        "{:>14} {}",
        "RATES".bold(),
        join(rates.iter().map(|r| r.to_string()).collect())
    );
    println!(
        "{:>14} {}",
        "VECTORS".bold(),
        join(sizes.iter().map(|s| s.to_string()).collect())
    );
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport {
    configuration: StreamConfiguration,
    state: SessionState,
    seconds: f64,
    faults: Vec<TickFault>,
    stats: CallbackStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_peak: Option<f32>,
}

/// How long `run` keeps the stream open.
fn run_length(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds).with_context(|| format!("Invalid run length: {seconds}s"))
}

fn cmd_run(session: &mut Session, rate: Option<u32>, vector: Option<usize>, seconds: f64, format: OutputFormat) -> Result<()> {
    let length = run_length(seconds)?;
    if let Some(rate) = rate {
        if rate != session.manager.sample_rate() && !session.manager.set_sample_rate(rate) {
            tracing::warn!("Sample rate {} is not available, keeping {}", rate, session.manager.sample_rate());
        }
    }
    if let Some(vector) = vector {
        if vector != session.manager.vector_size() && !session.manager.set_vector_size(vector) {
            tracing::warn!("Vector size {} is not available, keeping {}", vector, session.manager.vector_size());
        }
    }

    if session.manager.state() != SessionState::Running {
        bail!("No stream is running; check the driver and device selection");
    }

    if format == OutputFormat::Table {
        print_configuration(session.manager.configuration(), session.manager.state());
        println!("{}", "-".repeat(52));
        println!("Running for {:.1}s...", seconds);
    }

    let pump = session.hardware.clone().map(Pump::spawn);
    thread::sleep(length);
    let output_peak = pump.map(Pump::finish);

    let report = RunReport {
        configuration: session.manager.configuration().clone(),
        state: session.manager.state(),
        seconds,
        faults: session.manager.drain_faults(),
        stats: session.manager.callback_stats(),
        output_peak,
    };

    if format == OutputFormat::Json {
        return print_json(&report);
    }

    print_stats(&report.stats);
    if let Some(peak) = report.output_peak {
        println!("output peak={:.3}", peak);
    }
    for fault in &report.faults {
        println!("{} {}", "fault".red(), fault);
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let mut options = load_options(cli.config.as_ref())?;

    match &cli.command {
        Commands::Drivers => {
            let session = open_session(&cli, options, Box::new(Silence))?;
            cmd_drivers(&session, cli.format)
        }
        Commands::Devices { driver } => {
            apply_selection(
                &mut options,
                &Selection {
                    driver: driver.clone(),
                    ..Selection::default()
                },
            );
            let mut session = open_session(&cli, options, Box::new(Silence))?;
            cmd_devices(&mut session, cli.format)
        }
        Commands::Caps { selection } => {
            apply_selection(&mut options, selection);
            let session = open_session(&cli, options, Box::new(Silence))?;
            cmd_caps(&session, cli.format)
        }
        Commands::Run {
            selection,
            rate,
            vector,
            seconds,
            graph,
            frequency,
        } => {
            apply_selection(&mut options, selection);
            if let Some(rate) = rate {
                options.sample_rate = *rate;
            }
            if let Some(vector) = vector {
                options.vector_size = *vector;
            }
            let mut session = open_session(&cli, options, build_graph(*graph, *frequency))?;
            cmd_run(&mut session, *rate, *vector, *seconds, cli.format)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_overrides_file_values() {
        let mut options = ManagerOptions {
            driver: Some("From File".into()),
            output_device: Some("Speakers".into()),
            ..ManagerOptions::default()
        };
        apply_selection(
            &mut options,
            &Selection {
                driver: Some("Simulated".into()),
                input: Some("Mic".into()),
                output: None,
            },
        );
        assert_eq!(options.driver.as_deref(), Some("Simulated"));
        assert_eq!(options.input_device.as_deref(), Some("Mic"));
        assert_eq!(options.output_device.as_deref(), Some("Speakers"));
    }

    #[test]
    fn parses_global_flags_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "kiwi-devices",
            "run",
            "--graph",
            "passthrough",
            "--simulated",
            "--format",
            "json",
        ])
        .unwrap();
        assert!(cli.simulated);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Run {
                graph: GraphKind::Passthrough,
                ..
            }
        ));
    }

    #[test]
    fn run_length_rejects_unrepresentable_durations() {
        assert_eq!(run_length(0.5).unwrap(), Duration::from_millis(500));
        assert_eq!(run_length(0.0).unwrap(), Duration::ZERO);
        assert!(run_length(f64::INFINITY).is_err());
        assert!(run_length(f64::NAN).is_err());
        assert!(run_length(-1.0).is_err());
    }

    #[test]
    fn simulated_drivers_are_listed() {
        let cli = Cli::try_parse_from(["kiwi-devices", "--simulated", "drivers"]).unwrap();
        let session = open_session(&cli, ManagerOptions::default(), Box::new(Silence)).unwrap();
        assert_eq!(
            session.manager.available_drivers(),
            vec!["Simulated".to_string(), "Simulated Pro".to_string()]
        );
        let names: Vec<String> = session.manager.drivers().into_iter().map(|d| d.name).collect();
        assert_eq!(names, session.manager.available_drivers());
        assert_eq!(session.manager.state(), SessionState::Running);
    }
}
