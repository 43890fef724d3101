use std::io::{self, Write};
use std::path::PathBuf;
use std::process::exit;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};

use electrometer_rs::logging::{init_logging_with, parse_level};
use electrometer_rs::{
    Acquisition, AcquisitionMode, AcquisitionProfile, CancelToken, ChannelSettings,
    CommandChannel, GpibChannel, InstrumentConfig, MeasurementFunction, Sample, SampleSink,
    SerialChannel, SimulatedElectrometer, DEFAULT_BAUD_RATE, DEFAULT_GPIB_ADDRESS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// RS-232 link to the instrument
    Serial,
    /// USB GPIB controller
    Gpib,
    /// In-memory instrument, no hardware
    Sim,
}

#[derive(Parser, Debug)]
#[command(
    name = "electrometer-acquire",
    about = "Acquire readings from a SCPI electrometer"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = TransportKind::Serial)]
    transport: TransportKind,
    /// Serial device of the instrument or the GPIB controller (e.g., /dev/ttyUSB0)
    #[arg(long)]
    port: Option<String>,
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
    /// GPIB primary address
    #[arg(long, default_value_t = DEFAULT_GPIB_ADDRESS)]
    address: u8,
    /// TOML acquisition profile
    #[arg(long)]
    profile: Option<PathBuf>,
    /// current, voltage or charge
    #[arg(long)]
    function: Option<MeasurementFunction>,
    /// Fixed measurement range
    #[arg(long)]
    range: Option<f64>,
    /// Integration time in power-line cycles
    #[arg(long)]
    nplc: Option<f64>,
    /// Acquire a finite block of N readings
    #[arg(long, conflicts_with = "continuous")]
    samples: Option<usize>,
    /// Stream readings until Ctrl+C
    #[arg(long)]
    continuous: bool,
    /// Stop a continuous run after this many seconds
    #[arg(long)]
    duration: Option<f64>,
    /// Query the error queue after configuration
    #[arg(long)]
    check_errors: bool,
    /// error, warn, info, debug or trace
    #[arg(long)]
    log_level: Option<String>,
}

/// Prints samples to stdout as comma-separated lines.
struct StdoutSink {
    out: io::Stdout,
}

impl SampleSink for StdoutSink {
    fn consume(&mut self, samples: &[Sample]) {
        let mut out = self.out.lock();
        for s in samples {
            if let Err(e) = writeln!(out, "{},{},{:E},{}", s.index, s.timestamp, s.value, s.status)
            {
                warn!("stdout write failed: {}", e);
                return;
            }
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging_with(parse_level(args.log_level.as_deref()));

    let mut profile = match &args.profile {
        Some(path) => AcquisitionProfile::load(path)?,
        None => AcquisitionProfile::default(),
    };
    apply_overrides(&mut profile, &args)?;
    profile.validate()?;

    let mode = match (args.samples, args.continuous) {
        (Some(n), _) => AcquisitionMode::Finite(n),
        (None, true) => AcquisitionMode::Continuous,
        (None, false) => profile
            .mode()
            .context("no run mode: pass --samples N or --continuous, or set [run] in the profile")?,
    };
    if mode == AcquisitionMode::Finite(0) {
        bail!("--samples must be positive");
    }

    let unit = profile.instrument.function.unit();
    let settings = profile.into_settings()?;
    let channel = open_channel(&args)?;
    info!("using {} transport", channel.kind());

    let cancel = CancelToken::new();
    watch_ctrl_c(cancel.clone())?;

    let mut acquisition = Acquisition::new(channel, settings);
    let mut sink = StdoutSink { out: io::stdout() };
    println!("index,timestamp_s,value_{unit},status");
    let delivered = acquisition
        .run(mode, &cancel, &mut sink)
        .context("acquisition failed")?;
    info!("{} readings delivered", delivered);
    Ok(())
}

fn apply_overrides(profile: &mut AcquisitionProfile, args: &Args) -> Result<()> {
    if let Some(function) = args.function {
        if function != profile.instrument.function {
            // Switch to the new function's default range unless one is given below.
            profile.instrument.range = InstrumentConfig::for_function(function).range;
        }
        profile.instrument.function = function;
    }
    if let Some(range) = args.range {
        profile.instrument.range = range;
    }
    if let Some(nplc) = args.nplc {
        profile.instrument.nplc = nplc;
    }
    if let Some(secs) = args.duration {
        if !(secs.is_finite() && secs > 0.0) {
            bail!("--duration must be a positive number of seconds");
        }
        profile.timing.run_duration_s = Some(secs);
    }
    Ok(())
}

fn open_channel(args: &Args) -> Result<Box<dyn CommandChannel>> {
    let port = || {
        args.port
            .clone()
            .context("--port is required for the serial and gpib transports")
    };
    match args.transport {
        TransportKind::Serial => {
            let settings = ChannelSettings::new(port()?)
                .baud_rate(args.baud)
                .check_errors(args.check_errors);
            let channel = SerialChannel::open(&settings)
                .with_context(|| format!("failed to open {}", settings.path))?;
            Ok(Box::new(channel))
        }
        TransportKind::Gpib => {
            let settings = ChannelSettings::new(port()?)
                .baud_rate(args.baud)
                .gpib_address(args.address)
                .check_errors(args.check_errors);
            let channel = GpibChannel::open(&settings)
                .with_context(|| format!("failed to open GPIB controller {}", settings.path))?;
            Ok(Box::new(channel))
        }
        TransportKind::Sim => {
            let mut sim = SimulatedElectrometer::bus().with_readings_per_poll(5);
            if args.check_errors {
                sim = sim.with_error_checking();
            }
            Ok(Box::new(sim))
        }
    }
}

/// Cancel `token` on Ctrl+C. The signal is awaited on its own thread.
fn watch_ctrl_c(token: CancelToken) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("tokio runtime init failed")?;
    thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            rt.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("interrupt received, stopping");
                        token.cancel();
                    }
                    Err(e) => warn!("cannot listen for Ctrl+C: {}", e),
                }
            });
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}
