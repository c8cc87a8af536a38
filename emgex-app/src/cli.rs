use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "emgex")]
#[command(about = "Facial sEMG acquisition with protocol-timed event markers")]
pub struct Cli {
    /// Experiment configuration file (JSON).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Root directory of trial records.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Record one trial.
    Run(RunArgs),
    /// Delete the newest record of a participant and condition.
    DeleteLatest(TrialArgs),
    /// Print the phase schedule of a condition.
    Protocol(ProtocolArgs),
    /// List acquisition devices.
    Devices(DeviceArgs),
}

#[derive(Debug, Args)]
pub struct TrialArgs {
    /// Participant label, e.g. P1.
    #[arg(short, long)]
    pub participant: String,

    /// Condition letter (A/B) or its display name.
    #[arg(short, long)]
    pub condition: String,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub trial: TrialArgs,

    /// Preset name (standard, extended) or path to a protocol JSON file.
    #[arg(long)]
    pub protocol: Option<String>,

    /// Countdown seconds before each phase.
    #[arg(long)]
    pub lead_in: Option<u32>,

    /// Run against a simulated clock; finishes instantly.
    #[arg(long)]
    pub virtual_clock: bool,

    /// Print the trial summary as JSON.
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub device: DeviceArgs,
}

#[derive(Debug, Args)]
pub struct ProtocolArgs {
    /// Condition letter (A/B) or its display name.
    #[arg(short, long, default_value = "A")]
    pub condition: String,

    /// Preset name (standard, extended) or path to a protocol JSON file.
    #[arg(long)]
    pub protocol: Option<String>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct DeviceArgs {
    /// Channels of the simulated amplifier.
    #[arg(long, default_value_t = 8)]
    pub channels: usize,

    /// Sampling rate of the simulated amplifier.
    #[arg(long, default_value_t = 250)]
    pub sample_rate: u32,

    #[arg(long, default_value_t = 0x5eed)]
    pub seed: u64,

    /// Also consider devices that are in range but not paired.
    #[arg(long)]
    pub include_unpaired: bool,
}
