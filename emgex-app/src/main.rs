mod app;
mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use app::App;
use cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let app = App::new(cli.config.as_deref(), cli.data_dir)?;
    match cli.command {
        Command::Run(args) => app.run_trial(&args),
        Command::DeleteLatest(args) => app.delete_latest(&args),
        Command::Protocol(args) => app.print_protocol(&args),
        Command::Devices(args) => app.list_devices(&args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init();
}
