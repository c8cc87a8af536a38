use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, bail};
use crossbeam_channel::Receiver;
use emgex_core::{Condition, SessionState};
use emgex_device::{DeviceGateway, SimulatedDriver};
use emgex_experiment::{
    BusMessage, ChannelBus, ConsoleEvent, ExperimentConfig, PhaseTimeline, Protocol,
    RecordStore, SessionController, StopSignal, TrialStore, TrialSummary,
};
use emgex_timing::{HighPrecisionTimer, Timer, VirtualTimer};
use tracing::{debug, info, warn};

use crate::cli::{DeviceArgs, ProtocolArgs, RunArgs, TrialArgs};

const BUS_CAPACITY: usize = 8192;

pub struct App {
    config: ExperimentConfig,
}

impl App {
    pub fn new(config_path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => ExperimentConfig::load(path)
                .with_context(|| format!("loading configuration {}", path.display()))?,
            None => ExperimentConfig::default(),
        };
        if let Some(dir) = data_dir {
            config.data_dir = dir;
        }
        Ok(Self { config })
    }

    pub fn run_trial(mut self, args: &RunArgs) -> Result<()> {
        if let Some(protocol) = &args.protocol {
            self.config.protocol = resolve_protocol(protocol)?;
        }
        if let Some(lead_in) = args.lead_in {
            self.config.lead_in_secs = lead_in;
        }
        self.config.validate()?;
        let condition = self.condition(&args.trial.condition)?;

        println!("=== FACIAL sEMG ACQUISITION ===");
        println!("Platform: {}", std::env::consts::OS);
        println!(
            "Protocol: {} ({} phases)",
            self.config.protocol.name,
            self.config.protocol.steps.len()
        );
        println!("Type 'stop' and Enter to end the trial early.\n");

        let summary = if args.virtual_clock {
            self.record(VirtualTimer::new(), args, condition)?
        } else {
            self.record(HighPrecisionTimer::new(), args, condition)?
        };

        if args.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            print_summary(&summary);
        }
        if summary.state == SessionState::Failed {
            bail!(
                "trial {} failed: {}",
                summary.identity,
                summary.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(())
    }

    fn record<T>(self, timer: T, args: &RunArgs, condition: Condition) -> Result<TrialSummary>
    where
        T: Timer<Timestamp = u64>,
    {
        let gateway = simulated_gateway(timer.clone(), &args.device);
        let (bus, bus_rx) = ChannelBus::bounded(BUS_CAPACITY);
        let store = TrialStore::new(&self.config.data_dir);
        // Held until the record is closed; blocks `delete-latest` from other processes.
        let _lock = store
            .lock_participant(&args.trial.participant)
            .context("locking participant directory")?;
        let mut controller = SessionController::new(self.config, store, gateway, bus, timer);

        let console = spawn_console(controller.events())?;
        let monitor = spawn_bus_monitor(bus_rx)?;
        watch_stdin(controller.stop_signal())?;

        let identity = controller
            .start(&args.trial.participant, condition)
            .context("starting trial")?;
        info!(trial = %identity, "waiting for trial to finish");
        let summary = controller
            .wait()?
            .context("session ended without a summary")?;

        // Dropping the controller closes the event and bus channels.
        drop(controller);
        if console.join().is_err() {
            warn!("console thread panicked");
        }
        match monitor.join() {
            Ok((samples, markers)) => debug!(samples, markers, "bus traffic"),
            Err(_) => warn!("bus monitor thread panicked"),
        }
        Ok(summary)
    }

    pub fn delete_latest(self, args: &TrialArgs) -> Result<()> {
        let condition = self.condition(&args.condition)?;
        let store = TrialStore::new(&self.config.data_dir);
        let deleted = store
            .delete_latest(&args.participant, condition)
            .context("deleting latest trial")?;
        println!("Deleted {}", store.path_for(&deleted).display());
        Ok(())
    }

    pub fn print_protocol(mut self, args: &ProtocolArgs) -> Result<()> {
        if let Some(protocol) = &args.protocol {
            self.config.protocol = resolve_protocol(protocol)?;
        }
        let condition = self.condition(&args.condition)?;
        let timeline =
            PhaseTimeline::new(&self.config.protocol, condition, self.config.condition_names())?;

        if args.json {
            println!("{}", serde_json::to_string_pretty(timeline.phases())?);
            return Ok(());
        }
        println!(
            "{} / condition {} ({})",
            self.config.protocol.name,
            condition,
            condition_name(&self.config, condition)
        );
        for (i, phase) in timeline.phases().iter().enumerate() {
            println!(
                "{:>3}  {:<24} {:>3}s  code {}",
                i + 1,
                phase.prompt(),
                phase.duration_secs,
                phase.event_code
            );
        }
        println!("Total capture time: {}s", timeline.total_duration().as_secs());
        Ok(())
    }

    pub fn list_devices(self, args: &DeviceArgs) -> Result<()> {
        let gateway = simulated_gateway(HighPrecisionTimer::new(), args);
        for handle in gateway.discover()? {
            let device = gateway.connect(&handle)?;
            println!("{}  {} channels", device.serial(), device.channel_count());
        }
        Ok(())
    }

    fn condition(&self, input: &str) -> Result<Condition> {
        Ok(Condition::parse_with_names(input, self.config.condition_names())?)
    }
}

fn simulated_gateway<T>(timer: T, args: &DeviceArgs) -> DeviceGateway<SimulatedDriver<T>>
where
    T: Timer<Timestamp = u64>,
{
    let driver = SimulatedDriver::new(timer)
        .with_channels(args.channels)
        .with_sample_rate(args.sample_rate)
        .with_seed(args.seed);
    let gateway = DeviceGateway::new(driver);
    if args.include_unpaired {
        gateway.include_unpaired()
    } else {
        gateway
    }
}

fn resolve_protocol(name_or_path: &str) -> Result<Protocol> {
    if let Some(preset) = Protocol::preset(name_or_path) {
        return Ok(preset);
    }
    let path = Path::new(name_or_path);
    if !path.exists() {
        bail!(
            "unknown protocol '{name_or_path}'; use one of {:?} or a JSON file",
            Protocol::PRESETS
        );
    }
    Ok(Protocol::load(path)?)
}

fn condition_name(config: &ExperimentConfig, condition: Condition) -> &str {
    match condition {
        Condition::A => &config.condition_names[0],
        Condition::B => &config.condition_names[1],
    }
}

fn spawn_console(events: Receiver<ConsoleEvent>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("emgex-console".into())
        .spawn(move || {
            for event in events {
                match event {
                    ConsoleEvent::Countdown { prompt, seconds } => {
                        println!("  Get ready: {prompt} in {seconds}...");
                    }
                    ConsoleEvent::PhaseChanged {
                        prompt,
                        seconds_remaining,
                        index,
                        phases_left,
                        ..
                    } => {
                        println!(
                            "[{}/{}] {prompt}  {seconds_remaining}s",
                            index + 1,
                            index + 1 + phases_left
                        );
                    }
                    ConsoleEvent::StatusChanged { state, message } => match message {
                        Some(message) => println!("Status: {state} - {message}"),
                        None => println!("Status: {state}"),
                    },
                }
            }
        })?;
    Ok(handle)
}

/// Stands in for an external bus consumer and counts what it receives.
fn spawn_bus_monitor(bus: Receiver<BusMessage>) -> Result<JoinHandle<(u64, u64)>> {
    let handle = thread::Builder::new()
        .name("emgex-bus".into())
        .spawn(move || {
            let (mut samples, mut markers) = (0u64, 0u64);
            for message in bus {
                match message {
                    BusMessage::Samples(_) => samples += 1,
                    BusMessage::Marker(_) => markers += 1,
                }
            }
            (samples, markers)
        })?;
    Ok(handle)
}

/// Requests a stop when the operator types `stop` or `s`. The thread is
/// detached; it ends with the process.
fn watch_stdin(stop: StopSignal) -> Result<()> {
    thread::Builder::new()
        .name("emgex-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if matches!(line.trim().to_ascii_lowercase().as_str(), "stop" | "s") {
                    stop.request();
                    println!("Stopping after the current read...");
                }
            }
        })?;
    Ok(())
}

fn print_summary(summary: &TrialSummary) {
    println!();
    println!("Trial:    {}", summary.identity);
    println!("Record:   {}", summary.path.display());
    println!("State:    {}", summary.state);
    println!(
        "Phases:   {}/{}{}",
        summary.phases_completed,
        summary.phases_total,
        if summary.cancelled { " (stopped)" } else { "" }
    );
    println!("Frames:   {}", summary.frames_written);
    println!("Duration: {:.1}s", summary.running_elapsed_ms as f64 / 1000.0);
    let stats = &summary.read_stats;
    if stats.reads > 0 {
        println!(
            "Reads:    {} ({:.3} ms avg, jitter {:.3} ms, {:.1} Hz)",
            stats.reads,
            stats.average_read_ns / 1e6,
            stats.jitter_ns / 1e6,
            stats.effective_read_rate_hz
        );
    }
}
